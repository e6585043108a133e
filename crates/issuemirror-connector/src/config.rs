//! Configuration for upstream protection.
//!
//! All structs deserialize with defaults so partial configuration files work,
//! and every struct has a `validate()` that rejects nonsensical values.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Local and server-driven rate limiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Sustained request rate (default: 10).
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,

    /// Token bucket capacity (default: 10).
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// In-flight request cap; `0` disables the cap (default: 5).
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Block on quotas advertised in response headers (default: true).
    #[serde(default = "default_true")]
    pub respect_server_limits: bool,

    /// Wait samples kept for the rolling average (default: 100).
    #[serde(default = "default_wait_samples")]
    pub wait_samples: usize,

    /// Backoff used by `RateLimiter::with_backoff`.
    #[serde(default)]
    pub backoff: RetryConfig,
}

fn default_requests_per_second() -> f64 {
    10.0
}

fn default_burst() -> u32 {
    10
}

fn default_max_concurrent() -> usize {
    5
}

fn default_true() -> bool {
    true
}

fn default_wait_samples() -> usize {
    100
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_requests_per_second(),
            burst: default_burst(),
            max_concurrent: default_max_concurrent(),
            respect_server_limits: true,
            wait_samples: default_wait_samples(),
            backoff: RetryConfig::default(),
        }
    }
}

impl RateLimitConfig {
    /// Creates a configuration optimized for testing (high rate, short delays).
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            requests_per_second: 1000.0,
            burst: 100,
            max_concurrent: 0,
            respect_server_limits: true,
            wait_samples: 10,
            backoff: RetryConfig::for_testing(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(self.requests_per_second.is_finite() && self.requests_per_second > 0.0) {
            return Err("requests_per_second must be > 0".to_string());
        }
        if self.burst == 0 {
            return Err("burst must be > 0".to_string());
        }
        if self.wait_samples == 0 {
            return Err("wait_samples must be > 0".to_string());
        }
        self.backoff.validate()
    }
}

/// Exponential backoff shared by the retry executor and `with_backoff`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt (default: 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry in milliseconds (default: 500).
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Delay cap in milliseconds (default: 30000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Growth factor per attempt (default: 2.0).
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Apply ±25% jitter to each delay (default: true).
    #[serde(default = "default_true")]
    pub jitter: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: true,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 10,
            max_delay_ms: 100,
            multiplier: 2.0,
            jitter: false,
        }
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.initial_delay_ms == 0 {
            return Err("initial_delay_ms must be > 0".to_string());
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err("max_delay_ms must be >= initial_delay_ms".to_string());
        }
        if !(self.multiplier.is_finite() && self.multiplier >= 1.0) {
            return Err("multiplier must be >= 1.0".to_string());
        }
        Ok(())
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit (default: 5).
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    /// Seconds the circuit stays open before a probe (default: 60).
    #[serde(default = "default_reset_timeout_secs")]
    pub reset_timeout_secs: u64,
}

fn default_max_failures() -> u32 {
    5
}

fn default_reset_timeout_secs() -> u64 {
    60
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: default_max_failures(),
            reset_timeout_secs: default_reset_timeout_secs(),
        }
    }
}

impl CircuitBreakerConfig {
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            max_failures: 3,
            reset_timeout_secs: 1,
        }
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_failures == 0 {
            return Err("max_failures must be > 0".to_string());
        }
        Ok(())
    }
}

/// Tuning for `AdaptiveRateLimiter`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    /// Lower bound for the adjusted rate (default: 1).
    #[serde(default = "default_min_rate")]
    pub min_rate: f64,

    /// Upper bound for the adjusted rate (default: 50).
    #[serde(default = "default_max_rate")]
    pub max_rate: f64,

    /// Rate multiplier applied when healthy (default: 1.1).
    #[serde(default = "default_increase_factor")]
    pub increase_factor: f64,

    /// Rate multiplier applied when unhealthy (default: 0.5).
    #[serde(default = "default_decrease_factor")]
    pub decrease_factor: f64,

    /// Success rate above which the rate increases (default: 0.95).
    #[serde(default = "default_success_threshold")]
    pub success_threshold: f64,

    /// Minimum milliseconds between adjustments (default: 10000).
    #[serde(default = "default_adjust_interval_ms")]
    pub adjust_interval_ms: u64,
}

fn default_min_rate() -> f64 {
    1.0
}

fn default_max_rate() -> f64 {
    50.0
}

fn default_increase_factor() -> f64 {
    1.1
}

fn default_decrease_factor() -> f64 {
    0.5
}

fn default_success_threshold() -> f64 {
    0.95
}

fn default_adjust_interval_ms() -> u64 {
    10_000
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            min_rate: default_min_rate(),
            max_rate: default_max_rate(),
            increase_factor: default_increase_factor(),
            decrease_factor: default_decrease_factor(),
            success_threshold: default_success_threshold(),
            adjust_interval_ms: default_adjust_interval_ms(),
        }
    }
}

impl AdaptiveConfig {
    pub fn adjust_interval(&self) -> Duration {
        Duration::from_millis(self.adjust_interval_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(self.min_rate > 0.0 && self.min_rate <= self.max_rate) {
            return Err("min_rate must be > 0 and <= max_rate".to_string());
        }
        if self.increase_factor < 1.0 {
            return Err("increase_factor must be >= 1.0".to_string());
        }
        if !(self.decrease_factor > 0.0 && self.decrease_factor <= 1.0) {
            return Err("decrease_factor must be in range (0.0, 1.0]".to_string());
        }
        if !(0.0..=1.0).contains(&self.success_threshold) {
            return Err("success_threshold must be in range [0.0, 1.0]".to_string());
        }
        Ok(())
    }
}
