//! Error types for the answer pipeline.

use std::time::Duration;

use sage_core::Retryable;
use sage_llm::LlmError;

/// Errors from the web search backend.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("search timed out after {0:?}")]
    Timeout(Duration),
    #[error("search backend returned HTTP {status}")]
    Remote { status: u16 },
    #[error("search returned no usable results")]
    NoResults,
    #[error("search transport error: {0}")]
    Transport(String),
    #[error("invalid search payload: {0}")]
    Decode(String),
}

impl Retryable for SearchError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            SearchError::Timeout(_) | SearchError::Remote { .. } | SearchError::NoResults
        )
    }
}

impl SearchError {
    pub(crate) fn from_reqwest(err: reqwest::Error, deadline: Duration) -> Self {
        if err.is_timeout() {
            SearchError::Timeout(deadline)
        } else if err.is_decode() {
            SearchError::Decode(err.to_string())
        } else {
            SearchError::Transport(err.to_string())
        }
    }
}

/// Errors that fail a whole pipeline invocation.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("inquiry cannot be empty")]
    EmptyInquiry,
    #[error("inquiry exceeds maximum length of {0} characters")]
    InquiryTooLong(usize),
    #[error("completion failed: {0}")]
    Llm(#[from] LlmError),
    #[error("search failed: {0}")]
    Search(#[from] SearchError),
    #[error("another inquiry is already running in this conversation")]
    ConversationBusy,
    #[error("voice error: {0}")]
    Voice(String),
}
