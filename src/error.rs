//! Error types for the NFS Volume Broker
//!
//! Provides structured error types for the registry, the mount-option merge
//! engine, the persistence layer, and the backend provisioner.

use thiserror::Error;

/// Unified error type for the broker
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Registry Errors
    // =========================================================================
    #[error("{kind} does not exist: {id}")]
    NotFound { kind: ResourceKind, id: String },

    #[error("{kind} already exists with different details: {id}")]
    Conflict { kind: ResourceKind, id: String },

    // =========================================================================
    // Parameter Errors
    // =========================================================================
    #[error("Invalid parameter {field}: {reason}")]
    InvalidParameters { field: String, reason: String },

    // =========================================================================
    // Persistence Errors
    // =========================================================================
    #[error("State store {store} failed to {operation}: {reason}")]
    Persistence {
        store: String,
        operation: String,
        reason: String,
    },

    #[error("Persisted registry state is malformed: {0}")]
    CorruptState(String),

    #[error("JSON encode/decode error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Backend Errors
    // =========================================================================
    #[error("Backend unavailable: {backend}")]
    BackendUnavailable { backend: String },

    #[error("Backend operation failed: {backend} - {operation} {instance_id}: {reason}")]
    BackendOperationFailed {
        backend: String,
        operation: String,
        instance_id: String,
        reason: String,
    },
}

/// The kind of registry entry an error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Instance,
    Binding,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Instance => write!(f, "service instance"),
            ResourceKind::Binding => write!(f, "service binding"),
        }
    }
}

/// Coarse classification surfaced to the broker-protocol layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidParameters,
    IoError,
    BackendError,
    Internal,
}

impl Error {
    /// Shorthand for a parameter validation failure
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidParameters {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Conflict { .. } => ErrorKind::Conflict,
            Error::InvalidParameters { .. } => ErrorKind::InvalidParameters,

            // Encode failures happen on the flush path, so they count as IO
            Error::Persistence { .. }
            | Error::CorruptState(_)
            | Error::Json(_)
            | Error::Io(_) => ErrorKind::IoError,

            Error::BackendUnavailable { .. } | Error::BackendOperationFailed { .. } => {
                ErrorKind::BackendError
            }

            Error::Internal(_) | Error::Configuration(_) => ErrorKind::Internal,
        }
    }

    /// Check if a caller may reasonably retry the same request
    pub fn is_transient(&self) -> bool {
        match self {
            Error::CorruptState(_) => false,
            _ => matches!(self.kind(), ErrorKind::IoError | ErrorKind::BackendError),
        }
    }
}

/// Result type alias for the broker
pub type Result<T> = std::result::Result<T, Error>;
