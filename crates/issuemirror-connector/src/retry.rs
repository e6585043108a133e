//! Classified retries for upstream calls.
//!
//! Each attempt waits for the rate limiter, runs through the circuit breaker
//! and is classified on failure. Only retryable classes are retried;
//! authentication failures get one credential refresh and an immediate retry.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use issuemirror_core::{CallContext, ErrorClassifier, ErrorType};
use tracing::{debug, info, warn};

use crate::adaptive::AdaptiveRateLimiter;
use crate::backoff::Backoff;
use crate::circuit_breaker::CircuitBreaker;
use crate::config::RetryConfig;
use crate::error::{ConnectorError, ConnectorResult};
use crate::rate_limit::RateLimiter;
use crate::response::ResponseMetadata;
use crate::source::CredentialRefresher;

/// Retry executor combining rate limiting, circuit breaking and
/// classification.
#[derive(Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
    backoff: Backoff,
    classifier: ErrorClassifier,
    rate_limiter: Option<Arc<RateLimiter>>,
    adaptive: Option<Arc<AdaptiveRateLimiter>>,
    circuit_breaker: Option<Arc<CircuitBreaker>>,
    credentials: Option<Arc<dyn CredentialRefresher>>,
}

impl fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("config", &self.config)
            .field("rate_limited", &self.rate_limiter.is_some())
            .field("adaptive", &self.adaptive.is_some())
            .field("circuit_breaker", &self.circuit_breaker.as_ref().map(|cb| cb.name()))
            .field("refreshes_credentials", &self.credentials.is_some())
            .finish()
    }
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> ConnectorResult<Self> {
        config
            .validate()
            .map_err(ConnectorError::invalid_configuration)?;
        Ok(Self {
            backoff: Backoff::from_config(&config),
            config,
            classifier: ErrorClassifier::new(),
            rate_limiter: None,
            adaptive: None,
            circuit_breaker: None,
            credentials: None,
        })
    }

    #[must_use]
    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Uses the adaptive limiter's inner limiter and reports outcomes to it.
    #[must_use]
    pub fn with_adaptive_rate_limiter(mut self, adaptive: Arc<AdaptiveRateLimiter>) -> Self {
        self.rate_limiter = Some(Arc::clone(adaptive.limiter()));
        self.adaptive = Some(adaptive);
        self
    }

    #[must_use]
    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.circuit_breaker = Some(breaker);
        self
    }

    #[must_use]
    pub fn with_credential_refresher(mut self, refresher: Arc<dyn CredentialRefresher>) -> Self {
        self.credentials = Some(refresher);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn rate_limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.rate_limiter.as_ref()
    }

    pub fn circuit_breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.circuit_breaker.as_ref()
    }

    /// Executes `operation` with at most `1 + max_retries` attempts.
    ///
    /// Returns `CircuitOpen` and `Cancelled` unchanged, `Classified` for
    /// non-retryable failures and `RetriesExhausted` once the budget is spent.
    pub async fn execute<F, Fut, T>(&self, ctx: &CallContext, mut operation: F) -> ConnectorResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ConnectorResult<T>>,
    {
        let mut attempt: u32 = 0;
        let mut refreshed = false;

        loop {
            ctx.check_cancelled()?;

            let permit = match &self.rate_limiter {
                Some(limiter) => Some(limiter.wait(ctx).await?),
                None => None,
            };
            let result = match &self.circuit_breaker {
                Some(breaker) => {
                    breaker
                        .execute_filtered(&mut operation, |e| self.trips_circuit(e, ctx))
                        .await
                }
                None => operation().await,
            };
            drop(permit);

            if let Some(adaptive) = &self.adaptive {
                if !matches!(&result, Err(e) if e.is_cancelled() || e.is_circuit_open()) {
                    adaptive.record_outcome(result.is_ok()).await;
                }
            }

            let err = match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_cancelled() || e.is_circuit_open() => return Err(e),
                Err(e) => e,
            };

            let classified = self.classifier.classify_in(&err, ctx);

            if classified.error_type == ErrorType::Authentication && !refreshed {
                if let Some(refresher) = &self.credentials {
                    refreshed = true;
                    info!(
                        component = ctx.component(),
                        operation = ctx.operation(),
                        "Authentication failed, refreshing credentials"
                    );
                    refresher
                        .refresh_credentials(ctx)
                        .await
                        .map_err(|e| ConnectorError::credential_refresh(e.to_string()))?;
                    continue;
                }
            }

            if !classified.retryable {
                debug!(
                    error_type = %classified.error_type,
                    error = %classified.message,
                    "Non-retryable failure"
                );
                return Err(ConnectorError::Classified(classified));
            }

            let hint = classified.retry_after.map(|d| d.min(self.backoff.max_delay()));
            if classified.error_type == ErrorType::RateLimit {
                if let Some(limiter) = &self.rate_limiter {
                    limiter
                        .handle_response(&ResponseMetadata::too_many_requests(hint))
                        .await;
                }
            }

            if attempt >= self.config.max_retries {
                warn!(
                    attempts = attempt + 1,
                    error_type = %classified.error_type,
                    error = %classified.message,
                    "Retry budget exhausted"
                );
                return Err(ConnectorError::RetriesExhausted {
                    attempts: attempt + 1,
                    last_error: classified,
                });
            }

            let delay = hint.unwrap_or_else(|| self.backoff.delay(attempt));
            debug!(
                attempt = attempt + 1,
                max_retries = self.config.max_retries,
                delay_ms = delay.as_millis() as u64,
                error_type = %classified.error_type,
                "Retrying after retryable error"
            );
            if let Some(limiter) = &self.rate_limiter {
                limiter.record_backoff_retry().await;
            }
            ctx.sleep(delay).await?;
            attempt += 1;
        }
    }

    /// Only failures that say something about upstream health count toward
    /// the circuit.
    fn trips_circuit(&self, err: &ConnectorError, ctx: &CallContext) -> bool {
        let classified = self.classifier.classify(err, ctx.component(), ctx.operation());
        matches!(
            classified.error_type,
            ErrorType::Transient
                | ErrorType::Network
                | ErrorType::Timeout
                | ErrorType::RateLimit
                | ErrorType::Internal
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CircuitBreakerConfig, RateLimitConfig};
    use async_trait::async_trait;
    use issuemirror_core::UpstreamError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    fn executor() -> RetryExecutor {
        RetryExecutor::new(RetryConfig::for_testing()).unwrap()
    }

    fn ctx() -> CallContext {
        CallContext::new("upstream", "search")
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = executor()
            .execute(&ctx(), || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ConnectorError::Upstream(UpstreamError::status(503, "unavailable")))
                } else {
                    Ok("done")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_short_circuits() {
        let calls = AtomicU32::new(0);
        let result: ConnectorResult<()> = executor()
            .execute(&ctx(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ConnectorError::Upstream(UpstreamError::status(400, "bad request")))
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.error_type(), Some(ErrorType::Validation));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_budget() {
        let calls = AtomicU32::new(0);
        let result: ConnectorResult<()> = executor()
            .execute(&ctx(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ConnectorError::Upstream(UpstreamError::connection("refused")))
            })
            .await;

        match result.unwrap_err() {
            ConnectorError::RetriesExhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 4);
                assert_eq!(last_error.error_type, ErrorType::Network);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_is_capped() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();
        let result = executor()
            .execute(&ctx(), || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ConnectorError::Upstream(UpstreamError::too_many_requests(Some(Duration::from_secs(600)))))
                } else {
                    Ok(())
                }
            })
            .await;

        assert!(result.is_ok());
        // max_delay for testing is 100ms
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_open_is_not_retried() {
        let breaker = Arc::new(CircuitBreaker::new(
            "upstream",
            CircuitBreakerConfig {
                max_failures: 2,
                reset_timeout_secs: 60,
            },
        ));
        let executor = executor().with_circuit_breaker(Arc::clone(&breaker));
        let calls = AtomicU32::new(0);

        let result: ConnectorResult<()> = executor
            .execute(&ctx(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ConnectorError::Upstream(UpstreamError::status(502, "bad gateway")))
            })
            .await;

        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_throttling_trips_circuit() {
        let breaker = Arc::new(CircuitBreaker::new(
            "upstream",
            CircuitBreakerConfig {
                max_failures: 2,
                reset_timeout_secs: 60,
            },
        ));
        let executor = executor().with_circuit_breaker(Arc::clone(&breaker));
        let calls = AtomicU32::new(0);

        let result: ConnectorResult<()> = executor
            .execute(&ctx(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ConnectorError::Upstream(UpstreamError::too_many_requests(Some(
                    Duration::from_millis(10),
                ))))
            })
            .await;

        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_does_not_trip_circuit() {
        let breaker = Arc::new(CircuitBreaker::new(
            "upstream",
            CircuitBreakerConfig {
                max_failures: 1,
                reset_timeout_secs: 60,
            },
        ));
        let executor = executor().with_circuit_breaker(Arc::clone(&breaker));

        let result: ConnectorResult<()> = executor
            .execute(&ctx(), || async { Err(ConnectorError::Upstream(UpstreamError::status(404, "missing"))) })
            .await;

        assert_eq!(result.unwrap_err().error_type(), Some(ErrorType::NotFound));
        assert_eq!(breaker.failure_count().await, 0);
    }

    #[derive(Default)]
    struct CountingRefresher {
        refreshes: AtomicU32,
    }

    #[async_trait]
    impl CredentialRefresher for CountingRefresher {
        async fn refresh_credentials(&self, _ctx: &CallContext) -> ConnectorResult<()> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_refreshes_once() {
        let refresher = Arc::new(CountingRefresher::default());
        let executor = executor().with_credential_refresher(refresher.clone());
        let calls = AtomicU32::new(0);

        let result = executor
            .execute(&ctx(), || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ConnectorError::Upstream(UpstreamError::status(401, "token expired")))
                } else {
                    Ok(())
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(refresher.refreshes.load(Ordering::SeqCst), 1);

        let persistent: ConnectorResult<()> = executor
            .execute(&ctx(), || async { Err(ConnectorError::Upstream(UpstreamError::status(403, "forbidden"))) })
            .await;
        assert_eq!(persistent.unwrap_err().error_type(), Some(ErrorType::Authentication));
        assert_eq!(refresher.refreshes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_counted_by_limiter() {
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig::for_testing()).unwrap());
        let executor = executor().with_rate_limiter(Arc::clone(&limiter));
        let calls = AtomicU32::new(0);

        executor
            .execute(&ctx(), || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ConnectorError::Upstream(UpstreamError::timeout(Duration::from_secs(5))))
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();

        let metrics = limiter.metrics().await;
        assert_eq!(metrics.backoff_retries, 1);
        assert_eq!(metrics.requests_allowed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_context_stops_before_calling() {
        let ctx = ctx();
        ctx.cancel();
        let calls = AtomicU32::new(0);
        let result: ConnectorResult<()> = executor()
            .execute(&ctx, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
