//! Chat-completion client for Sage.
//!
//! Sends a message list to an OpenAI-compatible or Gemini backend and reads
//! back either a single JSON body or a server-sent event stream, forwarding
//! each text fragment to an optional partial-answer callback. Requests carry
//! a response deadline and are retried with linear backoff on timeouts and
//! non-success statuses.

pub mod client;
pub mod error;
pub mod sse;
pub mod wire;

pub use client::{ChatCompletion, CompletionClient, PartialFn, ResponseSchema};
pub use error::LlmError;
pub use sse::{SseDecoder, SseEvent};
pub use wire::WireFormat;
