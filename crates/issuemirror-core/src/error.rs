//! Failure taxonomy shared by every issuemirror component.
//!
//! Raw failures are annotated, never swallowed: a [`ClassifiedError`] keeps
//! the original message next to its [`ErrorType`], [`Severity`] and retry
//! verdict.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Category a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// Temporary upstream condition (5xx, overload).
    Transient,
    /// Will not succeed without a change on our side.
    Permanent,
    /// Credentials rejected or expired.
    Authentication,
    /// Upstream quota exhausted.
    RateLimit,
    /// Request or data rejected as invalid.
    Validation,
    /// Connection-level fault.
    Network,
    /// Call or deadline exceeded.
    Timeout,
    /// Referenced resource does not exist.
    NotFound,
    /// Concurrent modification or duplicate.
    Conflict,
    /// Unrecognised failure.
    Internal,
}

impl ErrorType {
    /// All error types in declaration order.
    #[must_use]
    pub fn all() -> &'static [ErrorType] {
        &[
            ErrorType::Transient,
            ErrorType::Permanent,
            ErrorType::Authentication,
            ErrorType::RateLimit,
            ErrorType::Validation,
            ErrorType::Network,
            ErrorType::Timeout,
            ErrorType::NotFound,
            ErrorType::Conflict,
            ErrorType::Internal,
        ]
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Transient => "transient",
            ErrorType::Permanent => "permanent",
            ErrorType::Authentication => "authentication",
            ErrorType::RateLimit => "rate_limit",
            ErrorType::Validation => "validation",
            ErrorType::Network => "network",
            ErrorType::Timeout => "timeout",
            ErrorType::NotFound => "not_found",
            ErrorType::Conflict => "conflict",
            ErrorType::Internal => "internal",
        }
    }

    /// Default severity attached when a failure of this type is classified.
    #[must_use]
    pub fn default_severity(&self) -> Severity {
        match self {
            ErrorType::RateLimit | ErrorType::Validation | ErrorType::NotFound => Severity::Low,
            ErrorType::Transient
            | ErrorType::Network
            | ErrorType::Timeout
            | ErrorType::Conflict => Severity::Medium,
            ErrorType::Permanent | ErrorType::Internal => Severity::High,
            ErrorType::Authentication => Severity::Critical,
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing an error type from string.
#[derive(Debug, Clone, Error)]
#[error("invalid error type '{0}'")]
pub struct ParseErrorTypeError(String);

impl FromStr for ErrorType {
    type Err = ParseErrorTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        ErrorType::all()
            .iter()
            .copied()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| ParseErrorTypeError(s.to_string()))
    }
}

/// How urgently a failure needs operator attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// A failure annotated with its taxonomy entry.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{error_type} error in {component}.{operation}: {message}")]
pub struct ClassifiedError {
    pub error_type: ErrorType,
    pub severity: Severity,
    pub retryable: bool,
    /// Original failure message.
    pub message: String,
    pub component: String,
    pub operation: String,
    /// Upstream HTTP status, when one was observed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Retry-after hint reported by the upstream, when present.
    #[serde(skip)]
    pub retry_after: Option<Duration>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl ClassifiedError {
    /// Builds a classified error directly, bypassing the classifier.
    pub fn new(
        error_type: ErrorType,
        retryable: bool,
        message: impl Into<String>,
        component: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            error_type,
            severity: error_type.default_severity(),
            retryable,
            message: message.into(),
            component: component.into(),
            operation: operation.into(),
            status_code: None,
            retry_after: None,
            context: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Adds a key/value pair to the error context.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

/// Structured failure reported by an upstream client.
///
/// Record sources surface transport and protocol failures through this type
/// so that the classifier can inspect status codes and retry hints instead of
/// guessing from message text.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpstreamError {
    /// Upstream answered with a non-success status.
    #[error("upstream returned HTTP {status}: {message}")]
    Status {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },

    /// Connection could not be established or was dropped.
    #[error("connection failed: {message}")]
    Connection { message: String },

    /// Call exceeded its deadline.
    #[error("request timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// Anything else the client could not categorise.
    #[error("{message}")]
    Other { message: String },
}

impl UpstreamError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        UpstreamError::Status {
            status,
            message: message.into(),
            retry_after: None,
        }
    }

    /// A 429 response with an optional retry-after hint.
    pub fn too_many_requests(retry_after: Option<Duration>) -> Self {
        UpstreamError::Status {
            status: 429,
            message: "too many requests".to_string(),
            retry_after,
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        UpstreamError::Connection {
            message: message.into(),
        }
    }

    pub fn timeout(timeout: Duration) -> Self {
        UpstreamError::Timeout { timeout }
    }

    pub fn other(message: impl Into<String>) -> Self {
        UpstreamError::Other {
            message: message.into(),
        }
    }

    /// HTTP status carried by this failure, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            UpstreamError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Retry-after hint carried by this failure, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            UpstreamError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Returned by blocking points when the caller's context was cancelled.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("operation cancelled")]
pub struct Cancelled;
