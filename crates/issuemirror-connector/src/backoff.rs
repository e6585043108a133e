//! Exponential backoff with optional jitter.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// Fraction of the delay applied as jitter in either direction.
const JITTER_FACTOR: f64 = 0.25;

/// Computes retry delays: `initial * multiplier^attempt`, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: bool,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: bool) -> Self {
        Self {
            initial,
            max,
            multiplier,
            jitter,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.initial_delay(),
            config.max_delay(),
            config.multiplier,
            config.jitter,
        )
    }

    pub fn max_delay(&self) -> Duration {
        self.max
    }

    /// Delay before retry number `attempt` (zero-based), without jitter.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let initial = self.initial.as_secs_f64();
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = (initial * self.multiplier.powi(exponent)).min(self.max.as_secs_f64());
        Duration::from_secs_f64(delay)
    }

    /// Delay before retry number `attempt`, jittered ±25% when enabled.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter {
            add_jitter(base)
        } else {
            base
        }
    }
}

fn add_jitter(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(-JITTER_FACTOR..=JITTER_FACTOR);
    Duration::from_secs_f64((delay.as_secs_f64() * (1.0 + factor)).max(0.0))
}
