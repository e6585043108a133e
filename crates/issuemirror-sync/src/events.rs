//! Structured sync events for the API/UI layer.
//!
//! Sinks must never stall or fail the processing loop. [`emit`] logs sink
//! errors instead of propagating them.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use issuemirror_core::{OperationId, TaskId};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::{SyncError, SyncResult};
use crate::operation::{BatchOperationResult, OperationResult};
use crate::types::{OperationStatus, OperationType};

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEventKind {
    TaskStarted,
    OperationProcessed,
    BatchCommitted,
    BatchFailed,
    TaskCompleted,
    TaskFailed,
    TaskCancelled,
}

impl SyncEventKind {
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, SyncEventKind::BatchFailed | SyncEventKind::TaskFailed)
    }
}

/// One progress or error event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEvent {
    pub task_id: TaskId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<OperationId>,
    pub kind: SyncEventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_type: Option<OperationType>,
    /// Operation status, or a batch/task outcome.
    pub outcome: String,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl SyncEvent {
    pub fn new(task_id: TaskId, kind: SyncEventKind, outcome: impl Into<String>) -> Self {
        Self {
            task_id,
            operation_id: None,
            kind,
            operation_type: None,
            outcome: outcome.into(),
            duration_ms: 0,
            message: None,
            timestamp: Utc::now(),
        }
    }

    /// Event for one processed operation.
    pub fn operation(task_id: TaskId, result: &OperationResult) -> Self {
        let mut event = Self::new(
            task_id,
            SyncEventKind::OperationProcessed,
            result.status.as_str(),
        )
        .with_duration(result.duration);
        event.operation_id = Some(result.operation_id);
        event.operation_type = Some(result.operation_type);
        if result.status == OperationStatus::Failed {
            event.message = result.error.as_ref().map(|e| e.message.clone());
        }
        event
    }

    /// Event summarising one batch.
    pub fn batch(task_id: TaskId, result: &BatchOperationResult) -> Self {
        let (kind, outcome) = match (&result.commit_error, &result.commit_id) {
            (Some(_), _) => (SyncEventKind::BatchFailed, "commit_failed"),
            (None, Some(_)) => (SyncEventKind::BatchCommitted, "committed"),
            (None, None) => (SyncEventKind::BatchCommitted, "no_changes"),
        };
        let message = match &result.commit_error {
            Some(err) => err.clone(),
            None => format!(
                "{} succeeded, {} failed, {} skipped",
                result.successful_ops, result.failed_ops, result.skipped_ops
            ),
        };
        Self::new(task_id, kind, outcome)
            .with_duration(result.duration)
            .with_message(message)
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self
    }
}

/// Consumer of sync events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: SyncEvent) -> SyncResult<()>;
}

/// Sends `event` to `sink`, logging failures.
pub async fn emit(sink: &dyn EventSink, event: SyncEvent) {
    let task_id = event.task_id;
    let kind = event.kind;
    if let Err(e) = sink.emit(event).await {
        warn!(task_id = %task_id, kind = ?kind, error = %e, "Failed to emit sync event");
    }
}

/// Writes events to the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn emit(&self, event: SyncEvent) -> SyncResult<()> {
        let operation_id = event.operation_id.map(|id| id.to_string());
        let operation_type = event.operation_type.map(|t| t.as_str());
        if event.kind.is_failure() || event.outcome == OperationStatus::Failed.as_str() {
            warn!(
                task_id = %event.task_id,
                operation_id = ?operation_id,
                operation_type = ?operation_type,
                kind = ?event.kind,
                outcome = %event.outcome,
                duration_ms = event.duration_ms,
                message = ?event.message,
                "Sync event"
            );
        } else {
            info!(
                task_id = %event.task_id,
                operation_id = ?operation_id,
                operation_type = ?operation_type,
                kind = ?event.kind,
                outcome = %event.outcome,
                duration_ms = event.duration_ms,
                "Sync event"
            );
        }
        Ok(())
    }
}

/// Forwards events into a bounded channel.
///
/// A full or closed channel is reported as an error, never awaited.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    sender: mpsc::Sender<SyncEvent>,
}

impl ChannelEventSink {
    pub fn new(sender: mpsc::Sender<SyncEvent>) -> Self {
        Self { sender }
    }

    /// Creates a sink and the receiving end of its channel.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SyncEvent>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self::new(sender), receiver)
    }
}

#[async_trait]
impl EventSink for ChannelEventSink {
    async fn emit(&self, event: SyncEvent) -> SyncResult<()> {
        self.sender
            .try_send(event)
            .map_err(|e| SyncError::internal(format!("event channel unavailable: {e}")))
    }
}
