//! Sage API crate - axum HTTP server for the answer pipeline.
//!
//! Exposes a JSON chat endpoint, an SSE endpoint that streams the answer
//! while it is generated, and a health check.

pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::{create_router, start_server};
pub use state::AppState;
