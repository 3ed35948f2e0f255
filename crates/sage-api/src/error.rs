//! API error types and JSON error response formatting.
//!
//! ApiError maps pipeline failures onto HTTP status codes with a consistent
//! `{error, message}` JSON body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use sage_chat::{ChatError, SearchError};
use sage_llm::LlmError;

/// JSON error response body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Machine-readable error code (e.g., "bad_request", "bad_gateway").
    pub error: String,
    /// Human-readable error message.
    pub message: String,
}

/// API error type that maps to HTTP status codes and JSON responses.
#[derive(Debug)]
pub enum ApiError {
    /// 400 Bad Request - empty or oversized inquiry.
    BadRequest(String),
    /// 409 Conflict - the conversation is already answering an inquiry.
    Conflict(String),
    /// 502 Bad Gateway - a backend failed after retries.
    BadGateway(String),
    /// 504 Gateway Timeout - a backend never answered in time.
    GatewayTimeout(String),
    /// 500 Internal Server Error - unexpected server error.
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Conflict(_) => "conflict",
            ApiError::BadGateway(_) => "bad_gateway",
            ApiError::GatewayTimeout(_) => "gateway_timeout",
            ApiError::Internal(_) => "internal_error",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ApiError::BadRequest(msg)
            | ApiError::Conflict(msg)
            | ApiError::BadGateway(msg)
            | ApiError::GatewayTimeout(msg)
            | ApiError::Internal(msg) => msg,
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            error: self.code().to_string(),
            message: self.message().to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        let message = err.to_string();
        match err {
            ChatError::EmptyInquiry | ChatError::InquiryTooLong(_) => ApiError::BadRequest(message),
            ChatError::ConversationBusy => ApiError::Conflict(message),
            ChatError::Llm(LlmError::Timeout(_) | LlmError::StreamStalled(_))
            | ChatError::Search(SearchError::Timeout(_)) => ApiError::GatewayTimeout(message),
            ChatError::Llm(_) | ChatError::Search(_) => ApiError::BadGateway(message),
            ChatError::Voice(_) => ApiError::Internal(message),
        }
    }
}
