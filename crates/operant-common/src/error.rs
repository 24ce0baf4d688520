//! Error types for the Operant client
//!
//! Provides a unified error type shared by every subsystem. No error from
//! the sync subsystem is ever surfaced synchronously to the host
//! application; these values end up in logs and queued telemetry.

use thiserror::Error;

/// Result type alias using OperantError
pub type Result<T> = std::result::Result<T, OperantError>;

/// Unified error type for Operant operations
#[derive(Debug, Error)]
pub enum OperantError {
    // Input validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    // Snapshot storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    // Remote service transport errors
    #[error("Network error: {0}")]
    Network(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

// Implement From for common external error types
impl From<serde_json::Error> for OperantError {
    fn from(err: serde_json::Error) -> Self {
        OperantError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for OperantError {
    fn from(err: std::io::Error) -> Self {
        OperantError::Storage(err.to_string())
    }
}

impl From<anyhow::Error> for OperantError {
    fn from(err: anyhow::Error) -> Self {
        OperantError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OperantError::Validation("action_id is required".to_string());
        assert!(err.to_string().contains("action_id"));
    }

    #[test]
    fn test_io_error_maps_to_storage() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: OperantError = io.into();
        assert!(matches!(err, OperantError::Storage(_)));
    }
}
