//! Error types for the Volume Orchestrator
//!
//! Provides the typed error taxonomy shared by drivers, the backend
//! registry, the scheduler, the volume state machine and the replication
//! coordinator. Callers branch on variants, never on message text.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the orchestrator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Invalid configuration for backend {backend}: {reason}")]
    InvalidConfiguration { backend: String, reason: String },

    // =========================================================================
    // Backend Availability Errors
    // =========================================================================
    #[error("Backend unavailable: {backend} - {reason}")]
    BackendUnavailable { backend: String, reason: String },

    #[error("Driver call {operation} on backend {backend} timed out after {timeout:?}")]
    DriverTimeout {
        backend: String,
        operation: String,
        timeout: Duration,
    },

    #[error("Backend operation failed: {backend} - {operation}: {reason}")]
    BackendOperationFailed {
        backend: String,
        operation: String,
        reason: String,
    },

    // =========================================================================
    // Placement Errors
    // =========================================================================
    #[error("Insufficient capacity on {backend}: requested {requested_gb} GiB, available {available_gb:.1} GiB")]
    InsufficientCapacity {
        backend: String,
        requested_gb: u64,
        available_gb: f64,
    },

    #[error("No valid backend found: {reason}")]
    NoValidBackend { reason: String },

    // =========================================================================
    // Precondition Errors
    // =========================================================================
    #[error("{kind} {id} is in use: {reason}")]
    InUse {
        kind: String,
        id: String,
        reason: String,
    },

    #[error("Volume {volume_id} has dependent snapshots")]
    HasSnapshots { volume_id: String },

    #[error("Conflicting operation on volume {volume_id}: currently {status}")]
    ConflictingOperation { volume_id: String, status: String },

    #[error("Volume {volume_id} cannot {operation} while {status}")]
    InvalidState {
        volume_id: String,
        status: String,
        operation: String,
    },

    #[error("Quota exceeded for {resource}: {reason}")]
    QuotaExceeded { resource: String, reason: String },

    #[error("Export limit exceeded on backend {backend}: at most {limit} exports")]
    ExportLimitExceeded { backend: String, limit: u32 },

    // =========================================================================
    // Replication Errors
    // =========================================================================
    #[error("Replication not configured on backend {backend}")]
    ReplicationNotConfigured { backend: String },

    #[error("Replication sync incomplete on backend {backend}: {reason}")]
    SyncIncomplete { backend: String, reason: String },

    #[error("Failover in progress for backend {backend}")]
    FailoverInProgress { backend: String },

    // =========================================================================
    // Lookup / Request Errors
    // =========================================================================
    #[error("Resource not found: {kind}/{id}")]
    NotFound { kind: String, id: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Taxonomy class of an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Fatal at startup, backend excluded
    Configuration,
    /// Transient, retryable
    Unavailable,
    /// Non-retryable for this request
    Placement,
    /// Caller must resolve a precondition
    Precondition,
    /// Replication-specific precondition
    Replication,
    /// Driver or internal failure with no safe retry
    Failure,
}

/// What the volume state machine does with a failed driver call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Return to the prior stable state and surface the error
    Revert,
    /// Remote outcome unknown: park in error until reconciled
    MarkErrorPendingVerification,
    /// Definitive failure with unknown remote state: error
    MarkError,
}

impl Error {
    /// Taxonomy class for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidConfiguration { .. } | Error::Yaml(_) => ErrorKind::Configuration,

            Error::BackendUnavailable { .. } | Error::DriverTimeout { .. } => {
                ErrorKind::Unavailable
            }

            Error::InsufficientCapacity { .. } | Error::NoValidBackend { .. } => {
                ErrorKind::Placement
            }

            Error::InUse { .. }
            | Error::HasSnapshots { .. }
            | Error::ConflictingOperation { .. }
            | Error::InvalidState { .. }
            | Error::QuotaExceeded { .. }
            | Error::ExportLimitExceeded { .. }
            | Error::NotFound { .. }
            | Error::InvalidRequest(_) => ErrorKind::Precondition,

            Error::ReplicationNotConfigured { .. }
            | Error::SyncIncomplete { .. }
            | Error::FailoverInProgress { .. } => ErrorKind::Replication,

            Error::BackendOperationFailed { .. }
            | Error::Internal(_)
            | Error::Json(_)
            | Error::Io(_) => ErrorKind::Failure,
        }
    }

    /// How a volume transition reacts when its driver call fails with this error
    pub fn disposition(&self) -> FailureDisposition {
        match self {
            Error::DriverTimeout { .. } => FailureDisposition::MarkErrorPendingVerification,
            Error::BackendOperationFailed { .. } | Error::Internal(_) | Error::Io(_) => {
                FailureDisposition::MarkError
            }
            _ => FailureDisposition::Revert,
        }
    }

    /// Check if the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Unavailable)
            || matches!(
                self,
                Error::FailoverInProgress { .. } | Error::ConflictingOperation { .. }
            )
    }

    /// Check if this error is transient (safe for automatic retry of idempotent calls)
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::BackendUnavailable { .. })
    }

    /// Check if the remote side effect of the failed call is unknown
    pub fn outcome_unknown(&self) -> bool {
        matches!(self, Error::DriverTimeout { .. })
    }

    /// Short machine-readable label, used for metrics and logs
    pub fn label(&self) -> &'static str {
        match self {
            Error::InvalidConfiguration { .. } => "invalid_configuration",
            Error::BackendUnavailable { .. } => "backend_unavailable",
            Error::DriverTimeout { .. } => "driver_timeout",
            Error::BackendOperationFailed { .. } => "backend_operation_failed",
            Error::InsufficientCapacity { .. } => "insufficient_capacity",
            Error::NoValidBackend { .. } => "no_valid_backend",
            Error::InUse { .. } => "in_use",
            Error::HasSnapshots { .. } => "has_snapshots",
            Error::ConflictingOperation { .. } => "conflicting_operation",
            Error::InvalidState { .. } => "invalid_state",
            Error::QuotaExceeded { .. } => "quota_exceeded",
            Error::ExportLimitExceeded { .. } => "export_limit_exceeded",
            Error::ReplicationNotConfigured { .. } => "replication_not_configured",
            Error::SyncIncomplete { .. } => "sync_incomplete",
            Error::FailoverInProgress { .. } => "failover_in_progress",
            Error::NotFound { .. } => "not_found",
            Error::InvalidRequest(_) => "invalid_request",
            Error::Internal(_) => "internal",
            Error::Yaml(_) => "yaml",
            Error::Json(_) => "json",
            Error::Io(_) => "io",
        }
    }

    pub(crate) fn not_found(kind: &str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            id: id.into(),
        }
    }

    pub(crate) fn invalid_config(backend: &str, reason: impl Into<String>) -> Self {
        Error::InvalidConfiguration {
            backend: backend.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for the orchestrator
pub type Result<T> = std::result::Result<T, Error>;
