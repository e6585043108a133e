//! Operation Processor
//!
//! Turns upstream records into [`SyncOperation`]s and applies them to the
//! file store.
//!
//! ## Behaviour
//!
//! - **Render and stage**: create, update and move operations stage the
//!   rendered file; staging is idempotent so re-running a batch is safe
//! - **Deletes**: handled per [`DeletionPolicy`], either skipped or replaced
//!   with a tombstone
//! - **Batch commits**: one commit per batch, only when something succeeded
//!   and the store actually has staged changes
//! - **Linear retries**: failed operations are retried with a delay of
//!   `retry_delay * retry_count` until the budget runs out

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use issuemirror_connector::UpstreamRecord;
use issuemirror_core::{CallContext, OperationId, TaskId};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::ProcessorConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::{self, EventSink, SyncEvent, TracingEventSink};
use crate::operation::{BatchOperationResult, OperationResult, SyncOperation};
use crate::priority::priority_score;
use crate::render::{render_record, render_tombstone, target_path, RenderedFile};
use crate::store::FileStore;
use crate::types::{DeletionPolicy, OperationStatus, OperationType};

/// Metadata key holding the upstream target an operation belongs to.
pub const META_TARGET: &str = "target";
/// Metadata key holding the SHA-256 of the rendered content.
pub const META_CONTENT_SHA256: &str = "content_sha256";

/// Snapshot of processor counters.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessorMetrics {
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    pub skipped_operations: u64,
    /// Mean over the most recent samples.
    pub average_processing_time: Duration,
    /// Throughput since creation or the last reset.
    pub operations_per_second: f64,
}

#[derive(Debug)]
struct MetricsState {
    total: u64,
    successful: u64,
    failed: u64,
    skipped: u64,
    samples: VecDeque<Duration>,
    window: usize,
    since: Instant,
}

impl MetricsState {
    fn new(window: usize) -> Self {
        Self {
            total: 0,
            successful: 0,
            failed: 0,
            skipped: 0,
            samples: VecDeque::with_capacity(window),
            window,
            since: Instant::now(),
        }
    }

    fn record(&mut self, status: OperationStatus, duration: Duration) {
        self.total += 1;
        match status {
            OperationStatus::Completed => self.successful += 1,
            OperationStatus::Skipped => self.skipped += 1,
            _ => self.failed += 1,
        }
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(duration);
    }

    fn snapshot(&self) -> ProcessorMetrics {
        let average_processing_time = if self.samples.is_empty() {
            Duration::ZERO
        } else {
            let sum: Duration = self.samples.iter().sum();
            sum / u32::try_from(self.samples.len()).unwrap_or(u32::MAX)
        };
        let secs = self.since.elapsed().as_secs_f64();
        ProcessorMetrics {
            total_operations: self.total,
            successful_operations: self.successful,
            failed_operations: self.failed,
            skipped_operations: self.skipped,
            average_processing_time,
            operations_per_second: if secs > 0.0 {
                self.total as f64 / secs
            } else {
                0.0
            },
        }
    }
}

/// What applying an operation did to the store.
#[derive(Debug, Default)]
struct Applied {
    skipped: bool,
    paths: Vec<String>,
    files_touched: u32,
    bytes_processed: u64,
}

/// Applies sync operations to a [`FileStore`].
pub struct OperationProcessor {
    store: Arc<dyn FileStore>,
    config: ProcessorConfig,
    events: Arc<dyn EventSink>,
    metrics: RwLock<MetricsState>,
    /// Completed operation ids, per task.
    completed: RwLock<HashMap<TaskId, HashSet<OperationId>>>,
}

impl std::fmt::Debug for OperationProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationProcessor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OperationProcessor {
    pub fn new(store: Arc<dyn FileStore>, config: ProcessorConfig) -> Self {
        let window = config.metrics_window.max(1);
        Self {
            store,
            config,
            events: Arc::new(TracingEventSink),
            metrics: RwLock::new(MetricsState::new(window)),
            completed: RwLock::new(HashMap::new()),
        }
    }

    /// Set the sink receiving per-operation and per-batch events.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn FileStore> {
        &self.store
    }

    /// Builds a pending operation for `record` in the mirror of `target`.
    pub fn create_operation(
        &self,
        task_id: TaskId,
        target: &str,
        record: UpstreamRecord,
        operation_type: OperationType,
    ) -> SyncOperation {
        let priority = priority_score(&record, Utc::now());
        let rendered = match operation_type {
            OperationType::Delete => render_tombstone(target, &record.key, record.updated_at),
            _ => render_record(target, &record),
        };
        let previous_path = match operation_type {
            OperationType::Move => record
                .previous_key
                .as_deref()
                .map(|key| target_path(target, key))
                .filter(|path| *path != rendered.path),
            _ => None,
        };

        let mut op = SyncOperation::new(task_id, record, operation_type)
            .with_max_retries(self.config.max_retries);
        op.priority = priority;
        op.previous_path = previous_path;
        op.metadata.insert(META_TARGET.to_string(), target.to_string());
        op.metadata
            .insert(META_CONTENT_SHA256.to_string(), rendered.digest());
        op.target_data = Some(rendered);
        op
    }

    /// Checks that `op` is complete and its dependencies are done.
    pub async fn validate_operation(&self, op: &SyncOperation) -> SyncResult<()> {
        if op.record_key.trim().is_empty() {
            return Err(SyncError::validation("record_key must not be empty"));
        }
        if op.operation_type != OperationType::Delete {
            if op.source_data.is_none() {
                return Err(SyncError::validation(format!(
                    "{} operation for {} has no source data",
                    op.operation_type, op.record_key
                )));
            }
            if op.target_data.is_none() {
                return Err(SyncError::validation(format!(
                    "{} operation for {} has no rendered target",
                    op.operation_type, op.record_key
                )));
            }
        }
        if op.retry_count > op.max_retries {
            return Err(SyncError::validation(format!(
                "retry_count {} exceeds max_retries {}",
                op.retry_count, op.max_retries
            )));
        }

        let completed = self.completed.read().await;
        let done = completed.get(&op.task_id);
        if let Some(missing) = op
            .dependencies
            .iter()
            .find(|id| !done.is_some_and(|done| done.contains(*id)))
        {
            return Err(SyncError::validation(format!(
                "dependency {missing} of operation {} has not completed",
                op.id
            )));
        }
        Ok(())
    }

    /// Processes one pending operation and counts it in the metrics.
    ///
    /// Failures are recorded on the operation and in the returned result;
    /// only cancellation and an illegal starting state return `Err`.
    #[instrument(skip(self, ctx, op), fields(
        operation_id = %op.id,
        record_key = %op.record_key,
        operation_type = %op.operation_type,
    ))]
    pub async fn process_operation(
        &self,
        ctx: &CallContext,
        op: &mut SyncOperation,
    ) -> SyncResult<OperationResult> {
        let result = self.start(ctx, op).await?;
        self.record_metrics(std::slice::from_ref(&result)).await;
        Ok(result)
    }

    async fn start(&self, ctx: &CallContext, op: &mut SyncOperation) -> SyncResult<OperationResult> {
        ctx.check_cancelled()?;
        op.transition_to(OperationStatus::Processing)?;
        Ok(self.run(op).await)
    }

    /// Processes `ops` in the given order and commits the batch.
    ///
    /// Individual failures never abort the batch. Cancellation is checked
    /// between operations: before the first one it returns `Err(Cancelled)`;
    /// later, the remaining operations stay `pending`, what was already
    /// staged is committed and the result is marked `cancelled`.
    ///
    /// Metrics are recorded once the batch outcome is final. A batch whose
    /// commit failed is left out; the caller either re-runs it or reports
    /// it with [`record_batch_metrics`](Self::record_batch_metrics).
    #[instrument(skip(self, ctx, ops), fields(batch_size = ops.len()))]
    pub async fn process_batch(
        &self,
        ctx: &CallContext,
        ops: &mut [SyncOperation],
    ) -> SyncResult<BatchOperationResult> {
        let started = Instant::now();
        let mut batch = BatchOperationResult::default();

        for op in ops.iter_mut() {
            if ctx.is_cancelled() {
                if batch.total_ops == 0 {
                    return Err(SyncError::Cancelled);
                }
                info!(processed = batch.total_ops, "Batch cancelled, committing processed operations");
                batch.cancelled = true;
                break;
            }
            match self.start(ctx, op).await {
                Ok(result) => batch.record(result),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(operation_id = %op.id, error = %e, "Operation could not be processed");
                    let mut result = OperationResult::from_operation(op, Duration::ZERO);
                    result.status = OperationStatus::Failed;
                    result.error = Some((&e).into());
                    batch.record(result);
                }
            }
        }

        if batch.successful_ops > 0 && self.config.batch_commit {
            self.commit_batch(ops, &mut batch).await;
        }
        batch.duration = started.elapsed();
        if batch.commit_error.is_none() {
            self.record_batch_metrics(&batch).await;
        }

        info!(
            total = batch.total_ops,
            successful = batch.successful_ops,
            failed = batch.failed_ops,
            skipped = batch.skipped_ops,
            commit_id = ?batch.commit_id,
            "Batch processed"
        );
        if let Some(task_id) = ops.first().map(|op| op.task_id) {
            events::emit(self.events.as_ref(), SyncEvent::batch(task_id, &batch)).await;
        }
        Ok(batch)
    }

    /// Retries a failed operation after a linear delay.
    ///
    /// Rejected once `retry_count` reaches `max_retries`, or when the
    /// recorded failure is not retryable.
    #[instrument(skip(self, ctx, op), fields(
        operation_id = %op.id,
        retry_count = op.retry_count,
    ))]
    pub async fn retry_operation(
        &self,
        ctx: &CallContext,
        op: &mut SyncOperation,
    ) -> SyncResult<OperationResult> {
        if op.status != OperationStatus::Failed {
            return Err(SyncError::invalid_state_transition(
                op.status,
                OperationStatus::Processing,
            ));
        }
        if !op.can_retry() {
            return Err(SyncError::RetryBudgetExhausted {
                operation_id: op.id,
                max_retries: op.max_retries,
            });
        }
        if let Some(details) = op.error_details.as_ref().filter(|d| !d.retryable) {
            return Err(SyncError::validation(format!(
                "operation {} failed permanently: {}",
                op.id, details.message
            )));
        }

        op.retry_count += 1;
        let delay = self.config.retry_delay().saturating_mul(op.retry_count);
        debug!(delay_ms = delay.as_millis() as u64, "Retrying operation");
        ctx.sleep(delay).await?;

        op.error_details = None;
        op.transition_to(OperationStatus::Processing)?;
        let result = self.run(op).await;
        self.record_metrics(std::slice::from_ref(&result)).await;
        Ok(result)
    }

    pub async fn metrics(&self) -> ProcessorMetrics {
        self.metrics.read().await.snapshot()
    }

    pub async fn reset_metrics(&self) {
        let mut metrics = self.metrics.write().await;
        *metrics = MetricsState::new(metrics.window);
    }

    /// Counts every operation of `batch` in the metrics.
    pub async fn record_batch_metrics(&self, batch: &BatchOperationResult) {
        self.record_metrics(&batch.results).await;
    }

    async fn record_metrics(&self, results: &[OperationResult]) {
        let mut metrics = self.metrics.write().await;
        for result in results {
            metrics.record(result.status, result.duration);
        }
    }

    pub async fn is_completed(&self, task_id: TaskId, id: OperationId) -> bool {
        self.completed
            .read()
            .await
            .get(&task_id)
            .is_some_and(|done| done.contains(&id))
    }

    /// Forgets the completed operations of `task_id` once it finishes.
    pub async fn clear_completed(&self, task_id: TaskId) {
        self.completed.write().await.remove(&task_id);
    }

    /// Runs an operation already in `processing`.
    async fn run(&self, op: &mut SyncOperation) -> OperationResult {
        let started = Instant::now();

        let outcome = match self.validate_operation(op).await {
            Ok(()) => self.apply(op).await,
            Err(e) => Err(e),
        };

        let mut applied = Applied::default();
        match outcome {
            Ok(done) => {
                let next = if done.skipped {
                    OperationStatus::Skipped
                } else {
                    OperationStatus::Completed
                };
                match op.transition_to(next) {
                    Ok(()) => {
                        self.completed
                            .write()
                            .await
                            .entry(op.task_id)
                            .or_default()
                            .insert(op.id);
                        applied = done;
                    }
                    Err(e) => op.fail(&e),
                }
            }
            Err(e) => {
                warn!(error = %e, retryable = e.is_retryable(), "Operation failed");
                op.fail(&e);
            }
        }

        let duration = started.elapsed();
        let mut result = OperationResult::from_operation(op, duration);
        result.paths = applied.paths;
        result.files_touched = applied.files_touched;
        result.bytes_processed = applied.bytes_processed;

        events::emit(self.events.as_ref(), SyncEvent::operation(op.task_id, &result)).await;
        result
    }

    async fn apply(&self, op: &SyncOperation) -> SyncResult<Applied> {
        let mut applied = Applied::default();
        match op.operation_type {
            OperationType::Create | OperationType::Update => {
                self.stage(required_target(op)?, &mut applied).await?;
            }
            OperationType::Move => {
                self.stage(required_target(op)?, &mut applied).await?;
                if self.config.deletion_policy == DeletionPolicy::Tombstone {
                    if let Some(tombstone) = previous_tombstone(op) {
                        self.stage(&tombstone, &mut applied).await?;
                    }
                }
            }
            OperationType::Delete => match self.config.deletion_policy {
                DeletionPolicy::Skip => {
                    debug!("Deletion kept in history, skipping");
                    applied.skipped = true;
                }
                DeletionPolicy::Tombstone => {
                    let tombstone = match op.target_data.as_ref() {
                        Some(file) => file.clone(),
                        None => {
                            let target = op.metadata.get(META_TARGET).ok_or_else(|| {
                                SyncError::validation("delete operation has no target")
                            })?;
                            render_tombstone(target, &op.record_key, None)
                        }
                    };
                    self.stage(&tombstone, &mut applied).await?;
                }
            },
        }
        Ok(applied)
    }

    async fn stage(&self, file: &RenderedFile, applied: &mut Applied) -> SyncResult<()> {
        let changed = self.store.stage_file(&file.path, &file.content).await?;
        if changed {
            applied.files_touched += 1;
        }
        applied.bytes_processed += file.len() as u64;
        applied.paths.push(file.path.clone());
        Ok(())
    }

    async fn commit_batch(&self, ops: &[SyncOperation], batch: &mut BatchOperationResult) {
        let staged = match self.store.has_staged_changes().await {
            Ok(staged) => staged,
            Err(e) => {
                batch.commit_error = Some(e.to_string());
                return;
            }
        };
        if !staged {
            debug!("Nothing staged, batch produced no changes");
            return;
        }

        let message = commit_message(ops);
        match self
            .store
            .commit(&message, &self.config.commit_author)
            .await
        {
            Ok(commit_id) => batch.set_commit(commit_id),
            Err(e) => {
                warn!(error = %e, "Batch commit failed");
                batch.commit_error = Some(e.to_string());
            }
        }
    }
}

fn required_target(op: &SyncOperation) -> SyncResult<&RenderedFile> {
    op.target_data
        .as_ref()
        .ok_or_else(|| SyncError::validation(format!("{} has no rendered target", op.record_key)))
}

fn previous_tombstone(op: &SyncOperation) -> Option<RenderedFile> {
    let path = op.previous_path.as_ref()?;
    let target = op.metadata.get(META_TARGET)?;
    let previous_key = op.source_data.as_ref()?.previous_key.as_deref()?;
    let tombstone = render_tombstone(target, previous_key, None);
    (tombstone.path == *path).then_some(tombstone)
}

/// Conventional-commit message for the completed operations in `ops`.
fn commit_message(ops: &[SyncOperation]) -> String {
    let done: Vec<&SyncOperation> = ops
        .iter()
        .filter(|op| op.status == OperationStatus::Completed)
        .collect();
    let target = ops
        .iter()
        .find_map(|op| op.metadata.get(META_TARGET))
        .map_or("upstream", String::as_str);
    let noun = if done.len() == 1 { "issue" } else { "issues" };

    let mut message = format!("chore(sync): mirror {} {noun} from {target}\n", done.len());
    if !done.is_empty() {
        message.push('\n');
        for op in done {
            message.push_str(&format!("- {} {}\n", op.operation_type, op.record_key));
        }
    }
    message
}
