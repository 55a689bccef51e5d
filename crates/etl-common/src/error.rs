//! Error types shared across the ETL workspace

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, EtlError>;

/// Workspace-wide error type
#[derive(Error, Debug)]
pub enum EtlError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid value for {key}: {value:?} ({reason})")]
    InvalidEnv {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Logging error: {0}")]
    Logging(String),
}

impl EtlError {
    pub fn config(message: impl Into<String>) -> Self {
        EtlError::Config(message.into())
    }
}
