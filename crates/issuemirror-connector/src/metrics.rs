//! Rate limiter statistics.
//!
//! Counters for allowed, throttled and retried requests plus a rolling
//! average of time spent waiting for a slot.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;

/// Statistics kept by a `RateLimiter` instance.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitMetrics {
    /// Requests granted a slot.
    pub requests_allowed: u64,
    /// Requests that had to wait, or were refused by `allow()`.
    pub requests_throttled: u64,
    /// Times the upstream reported an exhausted quota or answered 429.
    pub server_limit_hits: u64,
    /// Retries scheduled by backoff.
    pub backoff_retries: u64,
    /// Current local rate in requests per second.
    pub current_rate: f64,
    #[serde(skip)]
    wait_samples: VecDeque<Duration>,
    #[serde(skip)]
    window: usize,
}

impl RateLimitMetrics {
    /// Creates metrics keeping the last `window` wait samples.
    #[must_use]
    pub fn new(window: usize) -> Self {
        Self {
            requests_allowed: 0,
            requests_throttled: 0,
            server_limit_hits: 0,
            backoff_retries: 0,
            current_rate: 0.0,
            wait_samples: VecDeque::with_capacity(window),
            window: window.max(1),
        }
    }

    pub fn increment_allowed(&mut self) {
        self.requests_allowed += 1;
    }

    pub fn increment_throttled(&mut self) {
        self.requests_throttled += 1;
    }

    pub fn increment_server_limit_hits(&mut self) {
        self.server_limit_hits += 1;
    }

    pub fn increment_backoff_retries(&mut self) {
        self.backoff_retries += 1;
    }

    /// Records how long a caller waited, evicting the oldest sample when full.
    pub fn record_wait(&mut self, wait: Duration) {
        if self.wait_samples.len() == self.window {
            self.wait_samples.pop_front();
        }
        self.wait_samples.push_back(wait);
    }

    /// Average wait over the retained samples.
    #[must_use]
    pub fn average_wait(&self) -> Duration {
        if self.wait_samples.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.wait_samples.iter().sum();
        total / u32::try_from(self.wait_samples.len()).unwrap_or(u32::MAX)
    }

    /// Share of requests that were throttled.
    #[must_use]
    pub fn throttle_ratio(&self) -> f64 {
        let total = self.requests_allowed + self.requests_throttled;
        if total == 0 {
            0.0
        } else {
            self.requests_throttled as f64 / total as f64
        }
    }

    pub fn reset(&mut self) {
        let window = self.window;
        let rate = self.current_rate;
        *self = Self::new(window);
        self.current_rate = rate;
    }
}
