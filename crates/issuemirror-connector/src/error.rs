//! Connector error types
//!
//! Errors raised while talking to the upstream tracker, with helpers the
//! retry machinery uses to decide what to do next.

use std::time::Duration;

use issuemirror_core::{Cancelled, ClassifiedError, ErrorType, UpstreamError};
use thiserror::Error;

/// Error that can occur while calling the upstream.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Circuit breaker rejected the call without contacting the upstream.
    #[error("circuit breaker '{name}' is open")]
    CircuitOpen { name: String },

    /// The caller's context was cancelled while waiting or retrying.
    #[error("operation cancelled")]
    Cancelled,

    /// Raw upstream failure reported by a record source.
    #[error("upstream call failed: {0}")]
    Upstream(#[from] UpstreamError),

    /// Failure that has been classified as non-retryable.
    #[error("{0}")]
    Classified(#[from] ClassifiedError),

    /// Retry budget spent; carries the classification of the last attempt.
    #[error("giving up after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last_error: ClassifiedError,
    },

    /// Credentials could not be refreshed after an authentication failure.
    #[error("credential refresh failed: {message}")]
    CredentialRefresh { message: String },

    /// Configuration rejected by `validate()`.
    #[error("invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    /// Unexpected internal failure.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl From<Cancelled> for ConnectorError {
    fn from(_: Cancelled) -> Self {
        ConnectorError::Cancelled
    }
}

impl ConnectorError {
    pub fn circuit_open(name: impl Into<String>) -> Self {
        ConnectorError::CircuitOpen { name: name.into() }
    }

    pub fn credential_refresh(message: impl Into<String>) -> Self {
        ConnectorError::CredentialRefresh {
            message: message.into(),
        }
    }

    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        ConnectorError::InvalidConfiguration {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ConnectorError::Internal {
            message: message.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ConnectorError::Cancelled)
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ConnectorError::CircuitOpen { .. })
    }

    /// Taxonomy entry already attached to this error, if any.
    pub fn error_type(&self) -> Option<ErrorType> {
        match self {
            ConnectorError::Classified(e) => Some(e.error_type),
            ConnectorError::RetriesExhausted { last_error, .. } => Some(last_error.error_type),
            _ => None,
        }
    }

    /// Retry-after hint carried by the underlying failure, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ConnectorError::Upstream(e) => e.retry_after(),
            ConnectorError::Classified(e) => e.retry_after,
            ConnectorError::RetriesExhausted { last_error, .. } => last_error.retry_after,
            _ => None,
        }
    }

    /// Get an error code for logging/metrics.
    pub fn error_code(&self) -> &'static str {
        match self {
            ConnectorError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            ConnectorError::Cancelled => "CANCELLED",
            ConnectorError::Upstream(_) => "UPSTREAM_ERROR",
            ConnectorError::Classified(_) => "CLASSIFIED_ERROR",
            ConnectorError::RetriesExhausted { .. } => "RETRIES_EXHAUSTED",
            ConnectorError::CredentialRefresh { .. } => "CREDENTIAL_REFRESH_FAILED",
            ConnectorError::InvalidConfiguration { .. } => "INVALID_CONFIGURATION",
            ConnectorError::Internal { .. } => "INTERNAL_ERROR",
        }
    }
}

/// Result type for connector operations.
pub type ConnectorResult<T> = Result<T, ConnectorError>;
