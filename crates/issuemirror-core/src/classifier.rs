//! Error classification.
//!
//! Maps raw failures onto the [`ErrorType`] taxonomy. The classifier walks the
//! full `source()` chain and applies, in order:
//!
//! 1. connection-level faults → `Network`
//! 2. timeouts and elapsed deadlines → `Timeout`
//! 3. HTTP status codes → validation/auth/not-found/conflict/rate-limit/transient
//! 4. substring heuristics on the error text
//! 5. fallback → `Internal` with high severity
//!
//! Classification is a pure function of its inputs.

use std::collections::HashSet;
use std::error::Error as StdError;
use std::io;

use serde::Deserialize;

use crate::context::CallContext;
use crate::error::{Cancelled, ClassifiedError, ErrorType, Severity, UpstreamError};

/// Configuration for the error classifier.
#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierConfig {
    /// Error types that are considered retryable.
    #[serde(default = "default_retryable_types")]
    pub retryable_types: HashSet<ErrorType>,
}

fn default_retryable_types() -> HashSet<ErrorType> {
    [
        ErrorType::Transient,
        ErrorType::Network,
        ErrorType::Timeout,
        ErrorType::RateLimit,
    ]
    .into_iter()
    .collect()
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            retryable_types: default_retryable_types(),
        }
    }
}

/// Classifies failures into the shared taxonomy.
#[derive(Debug, Clone, Default)]
pub struct ErrorClassifier {
    config: ClassifierConfig,
}

impl ErrorClassifier {
    /// Creates a classifier with the default retryable set
    /// (transient, network, timeout, rate limit).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_config(config: ClassifierConfig) -> Self {
        Self { config }
    }

    /// Replaces the retryable allow-list.
    #[must_use]
    pub fn with_retryable_types(types: impl IntoIterator<Item = ErrorType>) -> Self {
        Self {
            config: ClassifierConfig {
                retryable_types: types.into_iter().collect(),
            },
        }
    }

    /// Whether failures of this type are retried.
    pub fn is_retryable(&self, error_type: ErrorType) -> bool {
        self.config.retryable_types.contains(&error_type)
    }

    /// Classifies `error` raised by `component` while performing `operation`.
    pub fn classify(
        &self,
        error: &(dyn StdError + 'static),
        component: &str,
        operation: &str,
    ) -> ClassifiedError {
        let chain = error_chain(error);

        // Already classified upstream in the chain: keep the verdict, re-apply
        // this classifier's retry policy.
        if let Some(existing) = chain
            .iter()
            .find_map(|e| e.downcast_ref::<ClassifiedError>())
        {
            let mut classified = existing.clone();
            classified.retryable = self.is_retryable(classified.error_type);
            return classified;
        }

        let (error_type, status_code) = detect(&chain);
        let retry_after = chain
            .iter()
            .find_map(|e| e.downcast_ref::<UpstreamError>())
            .and_then(UpstreamError::retry_after);

        let mut classified = ClassifiedError::new(
            error_type,
            self.is_retryable(error_type),
            error.to_string(),
            component,
            operation,
        );
        classified.status_code = status_code;
        classified.retry_after = retry_after;
        if let Some(status) = status_code {
            classified = classified.with_context("status_code", status.to_string());
        }
        if chain.iter().any(|e| e.is::<Cancelled>()) {
            classified = classified
                .with_severity(Severity::Low)
                .with_context("cancelled", "true");
        }
        classified
    }

    /// Classifies using the component/operation recorded in `ctx`.
    pub fn classify_in(
        &self,
        error: &(dyn StdError + 'static),
        ctx: &CallContext,
    ) -> ClassifiedError {
        let mut classified = self.classify(error, ctx.component(), ctx.operation());
        classified = classified.with_context("request_id", ctx.request_id().to_string());
        if let Some(correlation_id) = ctx.correlation_id() {
            classified = classified.with_context("correlation_id", correlation_id);
        }
        classified
    }
}

fn error_chain<'a>(error: &'a (dyn StdError + 'static)) -> Vec<&'a (dyn StdError + 'static)> {
    let mut chain = Vec::new();
    let mut current: Option<&'a (dyn StdError + 'static)> = Some(error);
    while let Some(err) = current {
        chain.push(err);
        current = err.source();
    }
    chain
}

fn detect(chain: &[&(dyn StdError + 'static)]) -> (ErrorType, Option<u16>) {
    if chain.iter().any(|e| is_network_fault(*e)) {
        return (ErrorType::Network, None);
    }
    if chain.iter().any(|e| is_timeout(*e)) {
        return (ErrorType::Timeout, None);
    }
    if let Some(status) = chain.iter().find_map(|e| status_code(*e)) {
        if let Some(error_type) = map_status_code(status) {
            return (error_type, Some(status));
        }
    }
    if chain.iter().any(|e| e.is::<Cancelled>()) {
        return (ErrorType::Permanent, None);
    }

    let text = chain
        .iter()
        .map(|e| e.to_string().to_lowercase())
        .collect::<Vec<_>>()
        .join(": ");
    (match_text(&text).unwrap_or(ErrorType::Internal), None)
}

fn is_network_fault(error: &(dyn StdError + 'static)) -> bool {
    if let Some(upstream) = error.downcast_ref::<UpstreamError>() {
        return matches!(upstream, UpstreamError::Connection { .. });
    }
    if let Some(io_err) = error.downcast_ref::<io::Error>() {
        return matches!(
            io_err.kind(),
            io::ErrorKind::ConnectionRefused
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::NotConnected
                | io::ErrorKind::AddrNotAvailable
                | io::ErrorKind::BrokenPipe
        );
    }
    if let Some(http_err) = error.downcast_ref::<reqwest::Error>() {
        return http_err.is_connect();
    }
    false
}

fn is_timeout(error: &(dyn StdError + 'static)) -> bool {
    if let Some(upstream) = error.downcast_ref::<UpstreamError>() {
        return matches!(upstream, UpstreamError::Timeout { .. });
    }
    if let Some(io_err) = error.downcast_ref::<io::Error>() {
        return io_err.kind() == io::ErrorKind::TimedOut;
    }
    if let Some(http_err) = error.downcast_ref::<reqwest::Error>() {
        return http_err.is_timeout();
    }
    error.is::<tokio::time::error::Elapsed>()
}

fn status_code(error: &(dyn StdError + 'static)) -> Option<u16> {
    if let Some(upstream) = error.downcast_ref::<UpstreamError>() {
        return upstream.status_code();
    }
    error
        .downcast_ref::<reqwest::Error>()
        .and_then(reqwest::Error::status)
        .map(|s| s.as_u16())
}

/// Maps an HTTP status to an error type. Informational and success codes
/// carry no verdict.
pub(crate) fn map_status_code(status: u16) -> Option<ErrorType> {
    match status {
        401 | 403 => Some(ErrorType::Authentication),
        404 | 410 => Some(ErrorType::NotFound),
        409 | 412 => Some(ErrorType::Conflict),
        429 => Some(ErrorType::RateLimit),
        408 | 504 => Some(ErrorType::Timeout),
        400..=499 => Some(ErrorType::Validation),
        500..=599 => Some(ErrorType::Transient),
        _ => None,
    }
}

fn match_text(text: &str) -> Option<ErrorType> {
    const PATTERNS: &[(&[&str], ErrorType)] = &[
        (&["rate limit", "too many requests"], ErrorType::RateLimit),
        (&["unauthorized", "unauthenticated", "forbidden"], ErrorType::Authentication),
        (&["not found"], ErrorType::NotFound),
        (&["conflict"], ErrorType::Conflict),
        (&["connection"], ErrorType::Network),
        (&["timed out", "timeout", "deadline"], ErrorType::Timeout),
    ];

    PATTERNS
        .iter()
        .find(|(needles, _)| needles.iter().any(|n| text.contains(n)))
        .map(|(_, error_type)| *error_type)
}
