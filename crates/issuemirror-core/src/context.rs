//! Call context passed explicitly through every call chain.
//!
//! Carries request metadata (request id, correlation id, component and
//! operation name) and the cooperative cancellation signal. Every blocking
//! point in the engine takes a `&CallContext` and returns early once the
//! context is cancelled.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::Cancelled;
use crate::ids::RequestId;

/// Request-scoped metadata and cancellation handle.
#[derive(Debug, Clone)]
pub struct CallContext {
    request_id: RequestId,
    correlation_id: Option<String>,
    component: String,
    operation: String,
    cancel: CancellationToken,
}

impl CallContext {
    /// Creates a root context with a fresh request id and cancellation token.
    pub fn new(component: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            request_id: RequestId::new(),
            correlation_id: None,
            component: component.into(),
            operation: operation.into(),
            cancel: CancellationToken::new(),
        }
    }

    /// Replaces the cancellation token, e.g. with one owned by a worker.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Attaches a correlation id supplied by the caller.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Derives a context for a nested operation of the same component.
    ///
    /// The child shares the request and correlation ids. Cancelling the parent
    /// cancels the child; cancelling the child leaves the parent untouched.
    #[must_use]
    pub fn child(&self, operation: impl Into<String>) -> Self {
        self.for_component(self.component.clone(), operation)
    }

    /// Derives a context for a call into another component.
    #[must_use]
    pub fn for_component(
        &self,
        component: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            request_id: self.request_id,
            correlation_id: self.correlation_id.clone(),
            component: component.into(),
            operation: operation.into(),
            cancel: self.cancel.child_token(),
        }
    }

    /// Derives a context that keeps the request metadata but ignores the
    /// parent's cancellation. For work that must run to completion once
    /// started.
    #[must_use]
    pub fn detached(&self, operation: impl Into<String>) -> Self {
        self.child(operation)
            .with_cancellation(CancellationToken::new())
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Returns the underlying cancellation token.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Requests cancellation of this context and all of its children.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Completes once cancellation has been requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Fails fast when the context has already been cancelled.
    pub fn check_cancelled(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleeps for `duration` unless cancelled first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        if duration.is_zero() {
            return self.check_cancelled();
        }
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Cancelled),
            () = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_shares_request_metadata() {
        let ctx = CallContext::new("engine", "run_task").with_correlation_id("corr-1");
        let child = ctx.child("process_batch");

        assert_eq!(child.request_id(), ctx.request_id());
        assert_eq!(child.correlation_id(), Some("corr-1"));
        assert_eq!(child.component(), "engine");
        assert_eq!(child.operation(), "process_batch");
    }

    #[test]
    fn test_parent_cancellation_reaches_children_only_downwards() {
        let parent = CallContext::new("engine", "run_task");
        let child = parent.for_component("upstream", "search");

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let other = parent.child("other");
        parent.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn test_detached_ignores_parent_cancellation() {
        let parent = CallContext::new("engine", "run_task").with_correlation_id("corr-1");
        let detached = parent.detached("batch");

        parent.cancel();
        assert!(!detached.is_cancelled());
        assert_eq!(detached.request_id(), parent.request_id());
        assert_eq!(detached.correlation_id(), Some("corr-1"));
        assert_eq!(detached.operation(), "batch");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_completes_when_not_cancelled() {
        let ctx = CallContext::new("test", "sleep");
        assert!(ctx.sleep(Duration::from_secs(5)).await.is_ok());
    }

    #[tokio::test]
    async fn test_sleep_returns_immediately_on_cancel() {
        let ctx = CallContext::new("test", "sleep");
        let handle = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle.cancel();
        });

        let start = std::time::Instant::now();
        let result = ctx.sleep(Duration::from_secs(30)).await;
        assert_eq!(result, Err(Cancelled));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_check_cancelled() {
        let ctx = CallContext::new("test", "check");
        assert!(ctx.check_cancelled().is_ok());
        ctx.cancel();
        assert_eq!(ctx.check_cancelled(), Err(Cancelled));
    }
}
