//! Rate limiting for upstream requests.
//!
//! Combines three gates:
//! - a local token bucket (sustained rate plus burst)
//! - the server quota learned from response headers and 429s
//! - an optional cap on in-flight requests
//!
//! Every wait honours the caller's cancellation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use issuemirror_core::{CallContext, Cancelled};
use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::backoff::Backoff;
use crate::config::RateLimitConfig;
use crate::error::{ConnectorError, ConnectorResult};
use crate::metrics::RateLimitMetrics;
use crate::response::ResponseMetadata;

/// Fallback block when a 429 carries neither Retry-After nor a reset time.
const DEFAULT_SERVER_BACKOFF: Duration = Duration::from_secs(1);

/// Longest block a server hint can impose.
const MAX_SERVER_BLOCK: Duration = Duration::from_secs(3600);

/// Continuously refilling token bucket.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a full bucket.
    pub fn new(rate: f64, capacity: u32) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            capacity,
            tokens: capacity,
            rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Takes one token, or returns how long until one is available.
    pub fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(missing / self.rate))
        }
    }

    pub fn available(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Changes the refill rate; tokens accrued so far are kept.
    pub fn set_rate(&mut self, rate: f64, now: Instant) {
        self.refill(now);
        self.rate = rate;
    }
}

/// Quota advertised by the upstream.
#[derive(Debug, Clone, Default)]
pub struct ServerQuota {
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    pub reset_at: Option<Instant>,
}

impl ServerQuota {
    /// How long callers must block, if the quota is exhausted.
    pub fn blocked_for(&self, now: Instant) -> Option<Duration> {
        match (self.remaining, self.reset_at) {
            (Some(0), Some(reset)) if reset > now => Some(reset - now),
            _ => None,
        }
    }

    /// Restores the quota once its reset time has passed.
    pub fn refresh(&mut self, now: Instant) {
        if self.reset_at.is_some_and(|reset| reset <= now) {
            self.remaining = self.limit;
            self.reset_at = None;
        }
    }

    fn consume(&mut self) {
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
        }
    }
}

/// Slot granted by [`RateLimiter::wait`]. Holds the concurrency permit until
/// dropped.
#[derive(Debug)]
pub struct RatePermit {
    _permit: Option<OwnedSemaphorePermit>,
}

/// Rate limiter for upstream requests.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    bucket: Mutex<TokenBucket>,
    quota: RwLock<ServerQuota>,
    concurrency: Option<Arc<Semaphore>>,
    metrics: RwLock<RateLimitMetrics>,
    backoff: Backoff,
}

impl RateLimiter {
    /// Creates a new rate limiter with the given configuration.
    pub fn new(config: RateLimitConfig) -> ConnectorResult<Self> {
        config
            .validate()
            .map_err(ConnectorError::invalid_configuration)?;

        let concurrency =
            (config.max_concurrent > 0).then(|| Arc::new(Semaphore::new(config.max_concurrent)));
        let mut metrics = RateLimitMetrics::new(config.wait_samples);
        metrics.current_rate = config.requests_per_second;

        Ok(Self {
            bucket: Mutex::new(TokenBucket::new(config.requests_per_second, config.burst)),
            quota: RwLock::new(ServerQuota::default()),
            concurrency,
            metrics: RwLock::new(metrics),
            backoff: Backoff::from_config(&config.backoff),
            config,
        })
    }

    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Blocks until a request may be sent.
    ///
    /// Waits for the server quota to reset, then for a local token, then for
    /// a concurrency slot. Returns `Cancelled` as soon as `ctx` is cancelled.
    pub async fn wait(&self, ctx: &CallContext) -> ConnectorResult<RatePermit> {
        let started = Instant::now();
        let mut throttled = false;

        loop {
            ctx.check_cancelled()?;

            if let Some(delay) = self.server_block().await {
                throttled = true;
                debug!(delay_ms = delay.as_millis() as u64, "Server quota exhausted, waiting for reset");
                ctx.sleep(delay).await?;
                continue;
            }

            let deficit = self.bucket.lock().await.try_take(Instant::now());
            match deficit {
                Ok(()) => break,
                Err(delay) => {
                    throttled = true;
                    ctx.sleep(delay).await?;
                }
            }
        }

        let permit = match &self.concurrency {
            Some(semaphore) => {
                let semaphore = Arc::clone(semaphore);
                tokio::select! {
                    biased;
                    () = ctx.cancelled() => return Err(ConnectorError::Cancelled),
                    permit = semaphore.acquire_owned() => Some(
                        permit.map_err(|_| ConnectorError::internal("concurrency semaphore closed"))?,
                    ),
                }
            }
            None => None,
        };

        if self.config.respect_server_limits {
            self.quota.write().await.consume();
        }

        let mut metrics = self.metrics.write().await;
        metrics.increment_allowed();
        if throttled {
            metrics.increment_throttled();
        }
        metrics.record_wait(started.elapsed());

        Ok(RatePermit { _permit: permit })
    }

    /// Non-blocking check: takes a slot if one is free right now.
    pub async fn try_acquire(&self) -> Option<RatePermit> {
        if self.server_block().await.is_some() {
            self.metrics.write().await.increment_throttled();
            return None;
        }

        let permit = match &self.concurrency {
            Some(semaphore) => match Arc::clone(semaphore).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    self.metrics.write().await.increment_throttled();
                    return None;
                }
            },
            None => None,
        };

        if self.bucket.lock().await.try_take(Instant::now()).is_err() {
            self.metrics.write().await.increment_throttled();
            return None;
        }

        if self.config.respect_server_limits {
            self.quota.write().await.consume();
        }
        self.metrics.write().await.increment_allowed();
        Some(RatePermit { _permit: permit })
    }

    /// Returns whether a request may be sent right now, consuming a token if so.
    pub async fn allow(&self) -> bool {
        self.try_acquire().await.is_some()
    }

    /// Feeds quota information from a response into the limiter.
    pub async fn handle_response(&self, meta: &ResponseMetadata) {
        if !self.config.respect_server_limits {
            return;
        }

        let now = Instant::now();
        let wall_now = Utc::now();
        let mut quota = self.quota.write().await;

        if let Some(limit) = meta.limit {
            quota.limit = Some(limit);
        }
        if let Some(remaining) = meta.remaining {
            quota.remaining = Some(remaining);
        }
        if let Some(reset_at) = meta.reset_at {
            let until = (reset_at - wall_now).to_std().unwrap_or(Duration::ZERO);
            quota.reset_at = Some(block_until(now, until));
        }

        if meta.is_too_many_requests() {
            quota.remaining = Some(0);
            match meta.retry_after {
                Some(retry_after) => quota.reset_at = Some(block_until(now, retry_after)),
                None if quota.reset_at.is_some_and(|reset| reset > now) => {}
                None => quota.reset_at = Some(now + DEFAULT_SERVER_BACKOFF),
            }
            warn!(
                retry_after_ms = meta.retry_after.map(|d| d.as_millis() as u64),
                "Upstream answered 429, blocking until quota resets"
            );
        }

        let exhausted = quota.remaining == Some(0);
        drop(quota);

        if exhausted {
            self.metrics.write().await.increment_server_limit_hits();
        }
    }

    /// Runs `operation`, retrying failures with exponential backoff.
    ///
    /// Makes at most `1 + backoff.max_retries` attempts and returns the last
    /// error once they are spent.
    pub async fn with_backoff<F, Fut, T, E>(&self, ctx: &CallContext, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<Cancelled> + std::fmt::Display,
    {
        let max_retries = self.config.backoff.max_retries;
        let mut attempt = 0;

        loop {
            ctx.check_cancelled()?;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= max_retries => return Err(e),
                Err(e) => {
                    let delay = self.backoff.delay(attempt);
                    debug!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Attempt failed, backing off"
                    );
                    self.record_backoff_retry().await;
                    ctx.sleep(delay).await?;
                    attempt += 1;
                }
            }
        }
    }

    /// Changes the local sustained rate.
    pub async fn set_rate(&self, rate: f64) {
        self.bucket.lock().await.set_rate(rate, Instant::now());
        self.metrics.write().await.current_rate = rate;
    }

    pub async fn current_rate(&self) -> f64 {
        self.bucket.lock().await.rate()
    }

    pub(crate) async fn record_backoff_retry(&self) {
        self.metrics.write().await.increment_backoff_retries();
    }

    /// Snapshot of the limiter statistics.
    pub async fn metrics(&self) -> RateLimitMetrics {
        self.metrics.read().await.clone()
    }

    pub async fn reset_metrics(&self) {
        self.metrics.write().await.reset();
    }

    pub async fn server_quota(&self) -> ServerQuota {
        self.quota.read().await.clone()
    }

    async fn server_block(&self) -> Option<Duration> {
        if !self.config.respect_server_limits {
            return None;
        }
        let now = Instant::now();
        {
            let quota = self.quota.read().await;
            if quota.reset_at.is_none() {
                return None;
            }
        }
        let mut quota = self.quota.write().await;
        quota.refresh(now);
        quota.blocked_for(now)
    }
}

fn block_until(now: Instant, wait: Duration) -> Instant {
    let wait = wait.min(MAX_SERVER_BLOCK);
    now.checked_add(wait).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use reqwest::header::{HeaderMap, HeaderValue};

    fn config(rate: f64, burst: u32) -> RateLimitConfig {
        RateLimitConfig {
            requests_per_second: rate,
            burst,
            max_concurrent: 0,
            respect_server_limits: true,
            wait_samples: 100,
            backoff: RetryConfig::for_testing(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_refills_continuously() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(2.0, 2);
        assert!(bucket.try_take(start).is_ok());
        assert!(bucket.try_take(start).is_ok());

        let wait = bucket.try_take(start).unwrap_err();
        assert_eq!(wait, Duration::from_millis(500));

        assert!(bucket.try_take(start + Duration::from_millis(500)).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_paced() {
        let limiter = RateLimiter::new(config(10.0, 3)).unwrap();
        let ctx = CallContext::new("test", "wait");
        let start = Instant::now();

        for _ in 0..3 {
            limiter.wait(&ctx).await.unwrap();
        }
        assert_eq!(start.elapsed(), Duration::ZERO);

        limiter.wait(&ctx).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(100));

        let metrics = limiter.metrics().await;
        assert_eq!(metrics.requests_allowed, 4);
        assert_eq!(metrics.requests_throttled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_allow_does_not_block() {
        let limiter = RateLimiter::new(config(1.0, 1)).unwrap();
        assert!(limiter.allow().await);
        assert!(!limiter.allow().await);
        assert_eq!(limiter.metrics().await.requests_throttled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_429_blocks_for_retry_after() {
        let limiter = RateLimiter::new(config(100.0, 10)).unwrap();
        let ctx = CallContext::new("test", "wait");

        limiter
            .handle_response(&ResponseMetadata::too_many_requests(Some(Duration::from_secs(2))))
            .await;

        let start = Instant::now();
        limiter.wait(&ctx).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert_eq!(limiter.metrics().await.server_limit_hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_retry_after_is_capped() {
        let limiter = RateLimiter::new(config(100.0, 10)).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("18446744073709551615"));
        let meta = ResponseMetadata::from_headers(429, &headers);
        assert_eq!(meta.retry_after, Some(Duration::from_secs(u64::MAX)));

        limiter.handle_response(&meta).await;

        let blocked = limiter.quota.read().await.blocked_for(Instant::now());
        assert_eq!(blocked, Some(MAX_SERVER_BLOCK));
    }

    #[tokio::test(start_paused = true)]
    async fn test_429_without_hint_uses_default() {
        let limiter = RateLimiter::new(config(100.0, 10)).unwrap();
        let ctx = CallContext::new("test", "wait");

        limiter
            .handle_response(&ResponseMetadata::too_many_requests(None))
            .await;

        let start = Instant::now();
        limiter.wait(&ctx).await.unwrap();
        assert!(start.elapsed() >= DEFAULT_SERVER_BACKOFF);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_restored_after_reset() {
        let limiter = RateLimiter::new(config(100.0, 10)).unwrap();
        let ctx = CallContext::new("test", "wait");
        let reset = Utc::now() + chrono::Duration::seconds(5);

        limiter
            .handle_response(&ResponseMetadata::ok().with_quota(50, 0, reset))
            .await;
        limiter.wait(&ctx).await.unwrap();

        let quota = limiter.server_quota().await;
        assert_eq!(quota.limit, Some(50));
        assert_eq!(quota.remaining, Some(49));
        assert!(quota.reset_at.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_limits_can_be_ignored() {
        let mut cfg = config(100.0, 10);
        cfg.respect_server_limits = false;
        let limiter = RateLimiter::new(cfg).unwrap();
        let ctx = CallContext::new("test", "wait");

        limiter
            .handle_response(&ResponseMetadata::too_many_requests(Some(Duration::from_secs(60))))
            .await;

        let start = Instant::now();
        limiter.wait(&ctx).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_is_cancellable() {
        let limiter = RateLimiter::new(config(100.0, 10)).unwrap();
        let ctx = CallContext::new("test", "wait");

        limiter
            .handle_response(&ResponseMetadata::too_many_requests(Some(Duration::from_secs(3600))))
            .await;

        let cancel = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });

        let err = limiter.wait(&ctx).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_cap_holds_until_permit_dropped() {
        let mut cfg = config(1000.0, 100);
        cfg.max_concurrent = 1;
        let limiter = RateLimiter::new(cfg).unwrap();
        let ctx = CallContext::new("test", "wait");

        let permit = limiter.wait(&ctx).await.unwrap();
        assert!(limiter.try_acquire().await.is_none());
        drop(permit);
        assert!(limiter.try_acquire().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_backoff_retries_then_succeeds() {
        let limiter = RateLimiter::new(config(100.0, 10)).unwrap();
        let ctx = CallContext::new("test", "backoff");
        let mut calls = 0;

        let result: Result<u32, ConnectorError> = limiter
            .with_backoff(&ctx, || {
                calls += 1;
                let attempt = calls;
                async move {
                    if attempt < 3 {
                        Err(ConnectorError::internal("flaky"))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(limiter.metrics().await.backoff_retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_backoff_returns_last_error() {
        let limiter = RateLimiter::new(config(100.0, 10)).unwrap();
        let ctx = CallContext::new("test", "backoff");
        let mut calls = 0u32;

        let result: Result<(), ConnectorError> = limiter
            .with_backoff(&ctx, || {
                calls += 1;
                async { Err(ConnectorError::internal("down")) }
            })
            .await;

        assert!(result.is_err());
        // One initial attempt plus max_retries.
        assert_eq!(calls, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_rate() {
        let limiter = RateLimiter::new(config(10.0, 1)).unwrap();
        limiter.set_rate(2.5).await;
        assert_eq!(limiter.current_rate().await, 2.5);
        assert_eq!(limiter.metrics().await.current_rate, 2.5);
    }
}
