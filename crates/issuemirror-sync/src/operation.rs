//! Sync operations and their results.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use issuemirror_connector::UpstreamRecord;
use issuemirror_core::{OperationId, TaskId};
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::render::RenderedFile;
use crate::types::{OperationStatus, OperationType};

/// Default retry budget per operation.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Failure recorded on an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl From<&SyncError> for OperationError {
    fn from(err: &SyncError) -> Self {
        Self {
            code: err.error_code().to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

/// A single proposed mutation derived from one upstream record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOperation {
    pub id: OperationId,
    pub task_id: TaskId,
    /// Stable upstream identifier.
    pub record_key: String,
    #[serde(rename = "type")]
    pub operation_type: OperationType,
    pub status: OperationStatus,
    /// Upstream snapshot. Required unless the operation is a delete.
    pub source_data: Option<UpstreamRecord>,
    /// Rendered file to stage.
    pub target_data: Option<RenderedFile>,
    /// Path the record was mirrored at before a move.
    pub previous_path: Option<String>,
    pub error_details: Option<OperationError>,
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub priority: i64,
    /// Operations that must complete first.
    pub dependencies: BTreeSet<OperationId>,
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl SyncOperation {
    /// Creates a pending operation for `record`.
    pub fn new(task_id: TaskId, record: UpstreamRecord, operation_type: OperationType) -> Self {
        Self {
            id: OperationId::new(),
            task_id,
            record_key: record.key.clone(),
            operation_type,
            status: OperationStatus::Pending,
            source_data: Some(record),
            target_data: None,
            previous_path: None,
            error_details: None,
            processed_at: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            priority: 0,
            dependencies: BTreeSet::new(),
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn depends_on(mut self, other: OperationId) -> Self {
        self.dependencies.insert(other);
        self
    }

    /// Moves to `next`, rejecting backward transitions.
    pub fn transition_to(&mut self, next: OperationStatus) -> SyncResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(SyncError::invalid_state_transition(self.status, next));
        }
        self.status = next;
        if next.is_terminal() || next == OperationStatus::Failed {
            self.processed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Marks the operation failed with `err`.
    pub fn fail(&mut self, err: &SyncError) {
        self.error_details = Some(OperationError::from(err));
        if self.status.can_transition_to(OperationStatus::Failed) {
            self.status = OperationStatus::Failed;
        }
        self.processed_at = Some(Utc::now());
    }

    /// Whether another retry fits in the budget.
    #[must_use]
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// Outcome of processing one operation.
#[derive(Debug, Clone, Serialize)]
pub struct OperationResult {
    pub operation_id: OperationId,
    pub record_key: String,
    pub operation_type: OperationType,
    pub status: OperationStatus,
    /// Paths staged by this operation.
    pub paths: Vec<String>,
    pub files_touched: u32,
    pub bytes_processed: u64,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,
}

impl OperationResult {
    /// Result mirroring the current state of `op`.
    pub fn from_operation(op: &SyncOperation, duration: Duration) -> Self {
        Self {
            operation_id: op.id,
            record_key: op.record_key.clone(),
            operation_type: op.operation_type,
            status: op.status,
            paths: Vec::new(),
            files_touched: 0,
            bytes_processed: 0,
            duration,
            error: op.error_details.clone(),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == OperationStatus::Completed
    }
}

/// Aggregate outcome of processing a list of operations.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchOperationResult {
    pub total_ops: usize,
    pub successful_ops: usize,
    pub failed_ops: usize,
    pub skipped_ops: usize,
    pub results: Vec<OperationResult>,
    /// Commit covering every successful operation. Only set when
    /// `successful_ops > 0`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_id: Option<String>,
    /// Set when the commit was attempted and failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_error: Option<String>,
    /// Cancellation stopped the batch early; unprocessed operations are
    /// still `pending`.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
    pub files_touched: u32,
    pub bytes_processed: u64,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
}

impl BatchOperationResult {
    /// Adds one operation result to the totals.
    pub fn record(&mut self, result: OperationResult) {
        self.total_ops += 1;
        match result.status {
            OperationStatus::Completed => self.successful_ops += 1,
            OperationStatus::Skipped => self.skipped_ops += 1,
            _ => self.failed_ops += 1,
        }
        self.files_touched += result.files_touched;
        self.bytes_processed += result.bytes_processed;
        self.results.push(result);
    }

    /// Sets the commit id, upholding the "only with successes" invariant.
    pub fn set_commit(&mut self, commit_id: String) {
        if self.successful_ops > 0 {
            self.commit_id = Some(commit_id);
        }
    }

    /// Whether the batch result as a whole is usable (no commit failure).
    #[must_use]
    pub fn is_committed_or_clean(&self) -> bool {
        self.commit_error.is_none()
    }

    /// Calculate success rate as percentage.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.total_ops == 0 {
            return 100.0;
        }
        (self.successful_ops as f64 / self.total_ops as f64) * 100.0
    }
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
