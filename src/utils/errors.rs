// src/utils/errors.rs
//! Error types for the audit pipeline
//!
//! A single error enum is shared by every component. The variants follow the
//! failure taxonomy of the pipeline: failures local to one message or one
//! metrics fetch are absorbed and counted by their callers, failures that
//! invalidate a whole benchmark run are surfaced.

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Pipeline error
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Producer or consumer cannot reach the broker
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// Broker refused a publish
    #[error("Publish rejected: {0}")]
    PublishRejected(String),

    /// Received message could not be parsed into an audit event
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    /// Sink store write failed
    #[error("Store write failed: {0}")]
    StoreWriteFailure(String),

    /// Caller supplied invalid parameters
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        received: Option<String>,
    },

    /// Peer sink metrics endpoint could not be read
    #[error("Metrics fetch failed: {0}")]
    MetricsFetchFailure(String),

    /// Benchmark result row could not be written or read
    #[error("Persistence failed: {0}")]
    PersistenceFailure(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Build a validation error carrying the offending input
    pub fn validation(message: impl Into<String>, received: Option<String>) -> Self {
        PipelineError::Validation {
            message: message.into(),
            received,
        }
    }

    /// Short label used for log fields and metric labels
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::BrokerUnavailable(_) => "broker_unavailable",
            PipelineError::PublishRejected(_) => "publish_rejected",
            PipelineError::MalformedEvent(_) => "malformed_event",
            PipelineError::StoreWriteFailure(_) => "store_write_failure",
            PipelineError::Validation { .. } => "validation",
            PipelineError::MetricsFetchFailure(_) => "metrics_fetch_failure",
            PipelineError::PersistenceFailure(_) => "persistence_failure",
            PipelineError::NotFound(_) => "not_found",
            PipelineError::Conflict(_) => "conflict",
            PipelineError::Unauthorized(_) => "unauthorized",
            PipelineError::ConfigError(_) => "config",
            PipelineError::Http(_) => "http",
            PipelineError::Io(_) => "io",
        }
    }
}

impl From<lapin::Error> for PipelineError {
    fn from(e: lapin::Error) -> Self {
        PipelineError::BrokerUnavailable(e.to_string())
    }
}

impl From<config::ConfigError> for PipelineError {
    fn from(e: config::ConfigError) -> Self {
        PipelineError::ConfigError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_display() {
        let err = PipelineError::validation("base_url must be absolute", Some("x".into()));
        assert_eq!(err.to_string(), "Validation error: base_url must be absolute");
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        let err: PipelineError = io.into();
        assert!(matches!(err, PipelineError::Io(_)));
    }
}
