//! Error types for the banking engine

use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Banking engine errors
#[derive(Error, Debug)]
pub enum Error {
    /// Store error (duplicate key, stage order, validation, storage)
    #[error("Store error: {0}")]
    Store(#[from] settlement_store::Error),

    /// Negative or malformed amount reaching the allocation engine
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// External aggregation source failure
    #[error("Aggregation error: {message}")]
    Aggregation {
        /// Failure description
        message: String,
        /// Whether a bounded retry is worthwhile
        retryable: bool,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Transient aggregation failure, worth a bounded retry
    pub fn aggregation_transient(message: impl Into<String>) -> Self {
        Error::Aggregation {
            message: message.into(),
            retryable: true,
        }
    }

    /// Permanent aggregation failure
    pub fn aggregation_permanent(message: impl Into<String>) -> Self {
        Error::Aggregation {
            message: message.into(),
            retryable: false,
        }
    }

    /// Whether a bounded retry may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Aggregation { retryable: true, .. })
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}
