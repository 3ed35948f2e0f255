//! Error types for the completion client.

use std::time::Duration;

use sage_core::Retryable;

/// Errors from a chat-completion request.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("completion timed out after {0:?}")]
    Timeout(Duration),
    #[error("completion stream stalled for {0:?} after partial output")]
    StreamStalled(Duration),
    #[error("completion backend returned HTTP {status}: {body}")]
    Remote { status: u16, body: String },
    #[error("completion backend returned no text")]
    EmptyResponse,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid completion payload: {0}")]
    Decode(String),
    #[error("client configuration error: {0}")]
    Config(String),
}

impl Retryable for LlmError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::Timeout(_) | LlmError::Remote { .. } | LlmError::EmptyResponse
        )
    }
}

impl LlmError {
    /// Classify a reqwest failure; its own timeouts count as deadline misses.
    pub(crate) fn from_reqwest(err: reqwest::Error, deadline: Duration) -> Self {
        if err.is_timeout() {
            LlmError::Timeout(deadline)
        } else {
            LlmError::Transport(err.to_string())
        }
    }
}
