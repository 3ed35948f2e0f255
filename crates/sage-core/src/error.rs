use thiserror::Error;

/// Top-level error type for configuration and persistence concerns.
///
/// Network-facing crates define their own error types (`LlmError`,
/// `SearchError`, `ChatError`) because their variants carry retry
/// semantics; this one covers what every crate shares.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SageError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<toml::de::Error> for SageError {
    fn from(err: toml::de::Error) -> Self {
        SageError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for SageError {
    fn from(err: toml::ser::Error) -> Self {
        SageError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for SageError {
    fn from(err: serde_json::Error) -> Self {
        SageError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for Sage core operations.
pub type Result<T> = std::result::Result<T, SageError>;
