//! Sync error types.

use issuemirror_connector::ConnectorError;
use issuemirror_core::{Cancelled, OperationId};
use thiserror::Error;

/// Errors that can occur during synchronization.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Operation failed validation; retrying without correction is pointless.
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Upstream call failed after the connector's own retries.
    #[error("Upstream error: {0}")]
    Connector(#[from] ConnectorError),

    /// File store rejected a stage, pull or push.
    #[error("File store error: {message}")]
    Store { message: String },

    /// Batch commit failed.
    #[error("Commit failed: {message}")]
    Commit { message: String },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Invalid state transition.
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Operation has used its whole retry budget.
    #[error("Operation {operation_id} exhausted its retry budget ({max_retries} retries)")]
    RetryBudgetExhausted {
        operation_id: OperationId,
        max_retries: u32,
    },

    /// Caller cancelled the run.
    #[error("Operation cancelled")]
    Cancelled,

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl From<Cancelled> for SyncError {
    fn from(_: Cancelled) -> Self {
        SyncError::Cancelled
    }
}

impl SyncError {
    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a file store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Create a commit error.
    pub fn commit(message: impl Into<String>) -> Self {
        Self::Commit {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a not found error.
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Create an invalid state transition error.
    pub fn invalid_state_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if the error is worth retrying.
    ///
    /// Store and I/O failures are assumed transient. Upstream errors have
    /// already been retried by the connector, so only those it gave up on
    /// because of the budget count as retryable here.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Store { .. } | SyncError::Commit { .. } | SyncError::Io(_) => true,
            SyncError::Connector(e) => {
                matches!(e, ConnectorError::RetriesExhausted { .. } | ConnectorError::CircuitOpen { .. })
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self {
            SyncError::Cancelled => true,
            SyncError::Connector(e) => e.is_cancelled(),
            _ => false,
        }
    }

    /// Get an error code for logging/metrics.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            SyncError::Validation { .. } => "VALIDATION_ERROR",
            SyncError::Connector(e) => e.error_code(),
            SyncError::Store { .. } => "STORE_ERROR",
            SyncError::Commit { .. } => "COMMIT_FAILED",
            SyncError::Configuration { .. } => "CONFIGURATION_ERROR",
            SyncError::NotFound { .. } => "NOT_FOUND",
            SyncError::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            SyncError::RetryBudgetExhausted { .. } => "RETRY_BUDGET_EXHAUSTED",
            SyncError::Cancelled => "CANCELLED",
            SyncError::Serialization(_) => "SERIALIZATION_ERROR",
            SyncError::Io(_) => "IO_ERROR",
            SyncError::Internal { .. } => "INTERNAL_ERROR",
        }
    }
}

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;
