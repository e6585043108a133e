//! Adaptive rate limiting.
//!
//! Tracks an exponential moving average of call outcomes and periodically
//! nudges the wrapped limiter's local rate up (healthy) or down (unhealthy),
//! bounded by the configured minimum and maximum.

use std::sync::Arc;

use issuemirror_core::CallContext;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::info;

use crate::config::AdaptiveConfig;
use crate::error::{ConnectorError, ConnectorResult};
use crate::rate_limit::{RateLimiter, RatePermit};
use crate::response::ResponseMetadata;

/// Weight of the newest outcome in the moving average.
const EMA_ALPHA: f64 = 0.1;

#[derive(Debug)]
struct AdaptiveState {
    success_rate: f64,
    last_adjustment: Instant,
}

/// Rate limiter that adjusts its own rate from observed outcomes.
#[derive(Debug)]
pub struct AdaptiveRateLimiter {
    limiter: Arc<RateLimiter>,
    config: AdaptiveConfig,
    state: Mutex<AdaptiveState>,
}

impl AdaptiveRateLimiter {
    pub fn new(limiter: Arc<RateLimiter>, config: AdaptiveConfig) -> ConnectorResult<Self> {
        config
            .validate()
            .map_err(ConnectorError::invalid_configuration)?;
        Ok(Self {
            limiter,
            config,
            state: Mutex::new(AdaptiveState {
                success_rate: 1.0,
                last_adjustment: Instant::now(),
            }),
        })
    }

    /// The wrapped limiter, e.g. for handing to a retry executor.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub async fn wait(&self, ctx: &CallContext) -> ConnectorResult<RatePermit> {
        self.limiter.wait(ctx).await
    }

    pub async fn allow(&self) -> bool {
        self.limiter.allow().await
    }

    pub async fn handle_response(&self, meta: &ResponseMetadata) {
        self.limiter.handle_response(meta).await;
    }

    /// Current moving-average success rate in `[0, 1]`.
    pub async fn success_rate(&self) -> f64 {
        self.state.lock().await.success_rate
    }

    /// Folds one outcome into the average and adjusts the rate when the
    /// adjustment interval has elapsed.
    pub async fn record_outcome(&self, success: bool) {
        let due = {
            let mut state = self.state.lock().await;
            let sample = if success { 1.0 } else { 0.0 };
            state.success_rate = EMA_ALPHA * sample + (1.0 - EMA_ALPHA) * state.success_rate;
            state.last_adjustment.elapsed() >= self.config.adjust_interval()
        };
        if due {
            self.adjust().await;
        }
    }

    /// Applies one adjustment step immediately and returns the new rate.
    pub async fn adjust(&self) -> f64 {
        let success_rate = {
            let mut state = self.state.lock().await;
            state.last_adjustment = Instant::now();
            state.success_rate
        };

        let current = self.limiter.current_rate().await;
        let factor = if success_rate > self.config.success_threshold {
            self.config.increase_factor
        } else {
            self.config.decrease_factor
        };
        let next = (current * factor).clamp(self.config.min_rate, self.config.max_rate);

        if (next - current).abs() > f64::EPSILON {
            info!(
                previous_rate = current,
                rate = next,
                success_rate,
                "Adjusted upstream request rate"
            );
            self.limiter.set_rate(next).await;
        }
        next
    }
}
