//! Engine error types

use std::time::Duration;
use thiserror::Error;

/// Result type alias for engine operations
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Engine-wide error type
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid cron expression {expression:?}: {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("Invalid workflow configuration: {0}")]
    InvalidConfig(String),

    #[error("Durable backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("ETL error: {0}")]
    Common(#[from] etl_common::EtlError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn not_found(what: impl Into<String>) -> Self {
        EngineError::NotFound(what.into())
    }
}

/// Errors raised by the durable execution backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("namespace already exists: {0}")]
    AlreadyExists(String),

    #[error("namespace not registered: {0}")]
    NamespaceNotFound(String),

    #[error("task queue {queue:?} does not belong to namespace {namespace:?}")]
    TaskQueueMismatch { namespace: String, queue: String },

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("backend call timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors raised at a pipeline step boundary.
///
/// The display text is what ends up in `error_message` columns, so variants
/// wrapping a message print it verbatim.
#[derive(Error, Debug)]
pub enum StepError {
    #[error("{0}")]
    Failed(String),

    #[error("invalid step configuration: {0}")]
    InvalidConfig(String),

    #[error("unsafe identifier {0:?}")]
    UnsafeIdentifier(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("analytics query failed: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("step timed out after {0:?}")]
    TimedOut(Duration),

    #[error("cancelled")]
    Cancelled,
}

impl StepError {
    /// Whether another attempt could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            StepError::InvalidConfig(_)
                | StepError::UnsafeIdentifier(_)
                | StepError::Payload(_)
                | StepError::Cancelled
        )
    }

    pub fn failed(message: impl Into<String>) -> Self {
        StepError::Failed(message.into())
    }
}

impl From<EngineError> for StepError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::InvalidConfig(msg) => StepError::InvalidConfig(msg),
            EngineError::Storage(msg) => StepError::Storage(msg),
            other => StepError::Failed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_error_retryability() {
        assert!(StepError::failed("connection reset").is_retryable());
        assert!(StepError::TimedOut(Duration::from_secs(600)).is_retryable());
        assert!(!StepError::InvalidConfig("missing url".into()).is_retryable());
        assert!(!StepError::UnsafeIdentifier("a;b".into()).is_retryable());
        assert!(!StepError::Cancelled.is_retryable());
    }

    #[test]
    fn test_failed_displays_verbatim() {
        assert_eq!(StepError::failed("attempt 3").to_string(), "attempt 3");
    }

    #[test]
    fn test_engine_error_into_step_error() {
        let step: StepError = EngineError::InvalidConfig("no query".into()).into();
        assert!(matches!(step, StepError::InvalidConfig(_)));
        let step: StepError = EngineError::not_found("workflow 9").into();
        assert_eq!(step.to_string(), "Not found: workflow 9");
    }
}
