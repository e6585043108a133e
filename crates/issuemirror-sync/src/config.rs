//! Engine and processor configuration.

use std::env::VarError;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use issuemirror_connector::{AdaptiveConfig, CircuitBreakerConfig, RateLimitConfig, RetryConfig};
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::types::DeletionPolicy;

/// Operation processor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Commit each batch as a single commit (default: true).
    #[serde(default = "default_true")]
    pub batch_commit: bool,

    /// Retry budget per operation (default: 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for linear operation retries in milliseconds (default: 1000).
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Author recorded on batch commits.
    #[serde(default = "default_commit_author")]
    pub commit_author: String,

    /// What to do with records deleted upstream (default: skip).
    #[serde(default)]
    pub deletion_policy: DeletionPolicy,

    /// Processing-time samples kept for the rolling average (default: 100).
    #[serde(default = "default_metrics_window")]
    pub metrics_window: usize,
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_commit_author() -> String {
    "issuemirror <issuemirror@localhost>".to_string()
}

fn default_metrics_window() -> usize {
    100
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_commit: true,
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            commit_author: default_commit_author(),
            deletion_policy: DeletionPolicy::default(),
            metrics_window: default_metrics_window(),
        }
    }
}

impl ProcessorConfig {
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            retry_delay_ms: 10,
            metrics_window: 10,
            ..Self::default()
        }
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.commit_author.trim().is_empty() {
            return Err("commit_author must not be empty".to_string());
        }
        if self.metrics_window == 0 {
            return Err("metrics_window must be > 0".to_string());
        }
        Ok(())
    }
}

/// Top-level configuration for a [`SyncEngine`](crate::engine::SyncEngine).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Enables the adaptive rate limiter when present.
    #[serde(default)]
    pub adaptive: Option<AdaptiveConfig>,

    /// Retry policy for upstream calls.
    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub processor: ProcessorConfig,

    /// Operations per batch commit (default: 50).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Records requested per upstream page (default: 100).
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Push after every successful batch commit (default: true).
    #[serde(default = "default_true")]
    pub push_after_commit: bool,
}

fn default_batch_size() -> usize {
    50
}

fn default_page_size() -> u32 {
    100
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            adaptive: None,
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            processor: ProcessorConfig::default(),
            batch_size: default_batch_size(),
            page_size: default_page_size(),
            push_after_commit: true,
        }
    }
}

impl EngineConfig {
    /// Creates a configuration optimized for testing (high rate, short delays).
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            rate_limit: RateLimitConfig::for_testing(),
            adaptive: None,
            retry: RetryConfig::for_testing(),
            circuit_breaker: CircuitBreakerConfig::for_testing(),
            processor: ProcessorConfig::for_testing(),
            batch_size: 10,
            page_size: 10,
            push_after_commit: true,
        }
    }

    pub fn validate(&self) -> SyncResult<()> {
        let checks = [
            ("rate_limit", self.rate_limit.validate()),
            ("retry", self.retry.validate()),
            ("circuit_breaker", self.circuit_breaker.validate()),
            ("processor", self.processor.validate()),
            (
                "adaptive",
                self.adaptive.as_ref().map_or(Ok(()), AdaptiveConfig::validate),
            ),
        ];
        for (section, result) in checks {
            result.map_err(|e| SyncError::configuration(format!("{section}: {e}")))?;
        }
        if self.batch_size == 0 {
            return Err(SyncError::configuration("batch_size must be > 0"));
        }
        if self.page_size == 0 {
            return Err(SyncError::configuration("page_size must be > 0"));
        }
        Ok(())
    }

    /// Load configuration from `ISSUEMIRROR_*` environment variables.
    pub fn from_env() -> SyncResult<Self> {
        Self::from_reader(|key| std::env::var(key))
    }

    /// Load configuration from a custom variable reader.
    ///
    /// Unset variables keep their defaults; malformed ones are rejected.
    pub fn from_reader<F>(reader: F) -> SyncResult<Self>
    where
        F: Fn(&str) -> Result<String, VarError>,
    {
        let mut config = Self::default();

        override_var(&reader, "ISSUEMIRROR_REQUESTS_PER_SECOND", &mut config.rate_limit.requests_per_second)?;
        override_var(&reader, "ISSUEMIRROR_BURST", &mut config.rate_limit.burst)?;
        override_var(&reader, "ISSUEMIRROR_MAX_CONCURRENT", &mut config.rate_limit.max_concurrent)?;
        override_var(
            &reader,
            "ISSUEMIRROR_RESPECT_SERVER_LIMITS",
            &mut config.rate_limit.respect_server_limits,
        )?;
        override_var(&reader, "ISSUEMIRROR_MAX_RETRIES", &mut config.retry.max_retries)?;
        override_var(&reader, "ISSUEMIRROR_INITIAL_DELAY_MS", &mut config.retry.initial_delay_ms)?;
        override_var(&reader, "ISSUEMIRROR_MAX_DELAY_MS", &mut config.retry.max_delay_ms)?;
        override_var(
            &reader,
            "ISSUEMIRROR_CIRCUIT_MAX_FAILURES",
            &mut config.circuit_breaker.max_failures,
        )?;
        override_var(
            &reader,
            "ISSUEMIRROR_CIRCUIT_RESET_TIMEOUT_SECS",
            &mut config.circuit_breaker.reset_timeout_secs,
        )?;
        override_var(&reader, "ISSUEMIRROR_BATCH_SIZE", &mut config.batch_size)?;
        override_var(&reader, "ISSUEMIRROR_BATCH_COMMIT", &mut config.processor.batch_commit)?;
        override_var(&reader, "ISSUEMIRROR_PAGE_SIZE", &mut config.page_size)?;
        override_var(&reader, "ISSUEMIRROR_COMMIT_AUTHOR", &mut config.processor.commit_author)?;
        override_var(&reader, "ISSUEMIRROR_PUSH_AFTER_COMMIT", &mut config.push_after_commit)?;
        override_var(
            &reader,
            "ISSUEMIRROR_DELETION_POLICY",
            &mut config.processor.deletion_policy,
        )?;

        // One budget governs both upstream calls and per-operation retries.
        config.processor.max_retries = config.retry.max_retries;

        config.validate()?;
        Ok(config)
    }
}

fn override_var<F, T>(reader: &F, key: &str, target: &mut T) -> SyncResult<()>
where
    F: Fn(&str) -> Result<String, VarError>,
    T: FromStr,
    T::Err: Display,
{
    match reader(key) {
        Ok(raw) => {
            *target = raw
                .trim()
                .parse()
                .map_err(|e| SyncError::configuration(format!("invalid value for {key}: {e}")))?;
            Ok(())
        }
        Err(VarError::NotPresent) => Ok(()),
        Err(e) => Err(SyncError::configuration(format!("invalid value for {key}: {e}"))),
    }
}
