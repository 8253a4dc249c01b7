//! Error types for the operation engine

use crate::core::operations::{HandlerError, OperationStatus};
use thiserror::Error;

/// Result type alias for the engine
pub type Result<T> = std::result::Result<T, OpsError>;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum OpsError {
    /// Payload or request failed pre-flight checks; nothing was enqueued
    #[error("Validation error: {0}")]
    Validation(String),

    /// Raised by a handler during execution
    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    /// Invalid priority/max_retries at registration or invalid engine configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Checksum mismatch or restoration failure
    #[error("Rollback error: {0}")]
    Rollback(String),

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// State machine violation
    #[error("Invalid transition for operation {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: OperationStatus,
        to: OperationStatus,
    },

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl OpsError {
    /// Whether the executor may retry the failed work
    pub fn is_retryable(&self) -> bool {
        matches!(self, OpsError::Handler(_))
    }

    /// Short machine-readable code, used in logs and history details
    pub fn code(&self) -> &'static str {
        match self {
            OpsError::Validation(_) => "validation_error",
            OpsError::Handler(_) => "handler_error",
            OpsError::Configuration(_) => "configuration_error",
            OpsError::Rollback(_) => "rollback_error",
            OpsError::NotFound(_) => "not_found",
            OpsError::InvalidTransition { .. } => "invalid_transition",
            OpsError::Serialization(_) => "serialization_error",
            OpsError::Yaml(_) => "yaml_error",
            OpsError::Io(_) => "io_error",
            OpsError::Internal(_) => "internal_error",
        }
    }
}
