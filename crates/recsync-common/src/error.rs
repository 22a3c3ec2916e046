//! Error types for recsync

use thiserror::Error;

/// Result type alias for recsync operations
pub type Result<T> = std::result::Result<T, RecsyncError>;

/// Main error type for recsync
#[derive(Error, Debug)]
pub enum RecsyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}
