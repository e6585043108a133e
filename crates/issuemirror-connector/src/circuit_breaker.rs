//! Circuit breaker for upstream calls.
//!
//! Closed until `max_failures` consecutive failures, then Open for
//! `reset_timeout`. After the timeout exactly one probe is let through
//! (HalfOpen); its success closes the circuit, its failure reopens it.
//! No lock is held while the protected call runs.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;
use crate::error::{ConnectorError, ConnectorResult};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitBreakerState {
    /// Normal operation - requests allowed.
    Closed,
    /// Circuit tripped - requests blocked.
    Open,
    /// Testing if service recovered - a single probe allowed.
    HalfOpen,
}

impl fmt::Display for CircuitBreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitBreakerState::Closed => write!(f, "closed"),
            CircuitBreakerState::Open => write!(f, "open"),
            CircuitBreakerState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Point-in-time view of the breaker.
#[derive(Debug, Clone, Copy)]
pub struct CircuitSnapshot {
    pub state: CircuitBreakerState,
    pub failure_count: u32,
    pub last_failure_time: Option<Instant>,
    pub opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl CircuitSnapshot {
    fn closed() -> Self {
        Self {
            state: CircuitBreakerState::Closed,
            failure_count: 0,
            last_failure_time: None,
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

/// How a call was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Probe,
}

/// Circuit breaker protecting one upstream.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: RwLock<CircuitSnapshot>,
    opens: AtomicU64,
    rejects: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: RwLock::new(CircuitSnapshot::closed()),
            opens: AtomicU64::new(0),
            rejects: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn state(&self) -> CircuitBreakerState {
        self.state.read().await.state
    }

    pub async fn failure_count(&self) -> u32 {
        self.state.read().await.failure_count
    }

    pub async fn snapshot(&self) -> CircuitSnapshot {
        *self.state.read().await
    }

    /// Times the circuit has opened.
    pub fn open_count(&self) -> u64 {
        self.opens.load(Ordering::Relaxed)
    }

    /// Calls rejected without reaching the upstream.
    pub fn reject_count(&self) -> u64 {
        self.rejects.load(Ordering::Relaxed)
    }

    /// Forces the circuit closed.
    pub async fn reset(&self) {
        *self.state.write().await = CircuitSnapshot::closed();
        info!(circuit = %self.name, "Circuit breaker reset");
    }

    /// Executes `operation`, counting every error except cancellation.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> ConnectorResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ConnectorResult<T>>,
    {
        self.execute_filtered(operation, |_| true).await
    }

    /// Executes `operation`, counting only errors for which
    /// `counts_as_failure` returns true. Other errors leave the failure count
    /// untouched. Cancellation never counts.
    pub async fn execute_filtered<F, Fut, T, P>(
        &self,
        operation: F,
        counts_as_failure: P,
    ) -> ConnectorResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ConnectorResult<T>>,
        P: Fn(&ConnectorError) -> bool,
    {
        let admission = self.admit().await?;
        let result = operation().await;

        match &result {
            Ok(_) => self.on_success(admission).await,
            Err(e) if e.is_cancelled() => self.on_abandoned(admission).await,
            Err(e) if counts_as_failure(e) => self.on_failure(admission).await,
            Err(_) => self.on_abandoned(admission).await,
        }
        result
    }

    async fn admit(&self) -> ConnectorResult<Admission> {
        if self.state.read().await.state == CircuitBreakerState::Closed {
            return Ok(Admission::Normal);
        }

        let mut state = self.state.write().await;
        match state.state {
            CircuitBreakerState::Closed => Ok(Admission::Normal),
            CircuitBreakerState::Open
                if state
                    .opened_at
                    .map_or(true, |at| at.elapsed() >= self.config.reset_timeout()) =>
            {
                debug!(circuit = %self.name, "Circuit breaker transitioning to HALF_OPEN");
                state.state = CircuitBreakerState::HalfOpen;
                state.probe_in_flight = true;
                Ok(Admission::Probe)
            }
            CircuitBreakerState::HalfOpen if !state.probe_in_flight => {
                state.probe_in_flight = true;
                Ok(Admission::Probe)
            }
            _ => {
                self.rejects.fetch_add(1, Ordering::Relaxed);
                Err(ConnectorError::circuit_open(&self.name))
            }
        }
    }

    async fn on_success(&self, admission: Admission) {
        let mut state = self.state.write().await;
        match state.state {
            CircuitBreakerState::HalfOpen if admission == Admission::Probe => {
                info!(circuit = %self.name, "Circuit breaker transitioning to CLOSED after successful probe");
                *state = CircuitSnapshot::closed();
            }
            CircuitBreakerState::Closed => state.failure_count = 0,
            _ => {}
        }
    }

    async fn on_failure(&self, admission: Admission) {
        let now = Instant::now();
        let mut state = self.state.write().await;
        state.last_failure_time = Some(now);

        match state.state {
            CircuitBreakerState::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.config.max_failures {
                    warn!(
                        circuit = %self.name,
                        failures = state.failure_count,
                        "Circuit breaker transitioning to OPEN"
                    );
                    state.state = CircuitBreakerState::Open;
                    state.opened_at = Some(now);
                    self.opens.fetch_add(1, Ordering::Relaxed);
                }
            }
            CircuitBreakerState::HalfOpen if admission == Admission::Probe => {
                warn!(circuit = %self.name, "Circuit breaker probe failed, transitioning back to OPEN");
                state.failure_count += 1;
                state.state = CircuitBreakerState::Open;
                state.opened_at = Some(now);
                state.probe_in_flight = false;
                self.opens.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    /// The call neither succeeded nor failed in a way that counts. A probe
    /// slot is released so the next caller can probe.
    async fn on_abandoned(&self, admission: Admission) {
        if admission == Admission::Probe {
            self.state.write().await.probe_in_flight = false;
        }
    }
}
