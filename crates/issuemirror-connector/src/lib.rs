//! issuemirror Connector
//!
//! Protects the upstream issue tracker from the sync engine and the engine
//! from a misbehaving upstream.
//!
//! # Components
//!
//! - [`RateLimiter`] - token bucket plus server-advertised quota and an
//!   in-flight cap
//! - [`AdaptiveRateLimiter`] - adjusts the local rate from observed outcomes
//! - [`CircuitBreaker`] - stops calling an upstream that keeps failing
//! - [`RetryExecutor`] - classified retries with exponential backoff
//! - [`ResilientSource`] - applies all of the above to a [`RecordSource`]
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use issuemirror_connector::{
//!     CircuitBreaker, CircuitBreakerConfig, RateLimitConfig, RateLimiter, RetryConfig,
//!     RetryExecutor,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let limiter = Arc::new(RateLimiter::new(RateLimitConfig::default())?);
//! let breaker = Arc::new(CircuitBreaker::new("tracker", CircuitBreakerConfig::default()));
//! let executor = RetryExecutor::new(RetryConfig::default())?
//!     .with_rate_limiter(limiter)
//!     .with_circuit_breaker(breaker);
//! # let _ = executor;
//! # Ok(())
//! # }
//! ```

pub mod adaptive;
pub mod backoff;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod metrics;
pub mod rate_limit;
pub mod response;
pub mod retry;
pub mod source;

pub use adaptive::AdaptiveRateLimiter;
pub use backoff::Backoff;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerState, CircuitSnapshot};
pub use config::{AdaptiveConfig, CircuitBreakerConfig, RateLimitConfig, RetryConfig};
pub use error::{ConnectorError, ConnectorResult};
pub use metrics::RateLimitMetrics;
pub use rate_limit::{RateLimiter, RatePermit, ServerQuota, TokenBucket};
pub use response::ResponseMetadata;
pub use retry::RetryExecutor;
pub use source::{
    ChangeQuery, CredentialRefresher, RecordPage, RecordSource, ResilientSource, UpstreamRecord,
};
