pub mod config;
pub mod error;
pub mod retry;
pub mod types;

pub use config::SageConfig;
pub use error::{Result, SageError};
pub use retry::{RetryPolicy, Retryable};
pub use types::*;
