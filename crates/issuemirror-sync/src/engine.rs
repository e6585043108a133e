//! The synchronization loop.
//!
//! One [`SyncEngine::run_task`] call drives one task from `pending` to a
//! terminal state: fetch the change set through the protected upstream
//! source, turn records into prioritized operations, and process them in
//! batches with one commit each. Cancellation, from the caller's context or
//! the task store, is honoured at batch boundaries only: a started batch runs
//! on a detached context through to its commit, so a batch is either
//! committed and reported or never started.
//!
//! The engine does not serialize tasks for the same target; callers must.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use issuemirror_connector::{
    AdaptiveRateLimiter, ChangeQuery, CircuitBreaker, CredentialRefresher, RateLimiter,
    RecordSource, ResilientSource, RetryExecutor, UpstreamRecord,
};
use issuemirror_core::{CallContext, TaskId};
use tracing::{debug, info, instrument, warn};

use crate::config::EngineConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::{self, EventSink, SyncEvent, SyncEventKind, TracingEventSink};
use crate::operation::{BatchOperationResult, SyncOperation};
use crate::priority::sort_by_priority;
use crate::processor::OperationProcessor;
use crate::progress::{ProgressTracker, TaskProgress};
use crate::render::target_path;
use crate::store::FileStore;
use crate::task::{NewTask, Task, TaskConfig, TaskFilter, TaskStore, TaskSummary};
use crate::types::{OperationStatus, OperationType, TaskStatus, TaskType};

const MAINTENANCE_COMMIT_MESSAGE: &str = "chore(sync): commit pending mirror changes\n";

/// How a run ended when no error escaped.
enum RunOutcome {
    Completed {
        summary: TaskSummary,
        cutoff: Option<DateTime<Utc>>,
    },
    Cancelled(TaskSummary),
}

/// Mirrors upstream records into a file store, one task at a time.
pub struct SyncEngine {
    config: EngineConfig,
    source: ResilientSource<Arc<dyn RecordSource>>,
    store: Arc<dyn FileStore>,
    tasks: Arc<dyn TaskStore>,
    processor: OperationProcessor,
    progress: Arc<ProgressTracker>,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.config)
            .field("executor", self.source.executor())
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Builds an engine with a rate limiter, circuit breaker and retry
    /// executor configured from `config`.
    pub fn new(
        config: EngineConfig,
        source: Arc<dyn RecordSource>,
        store: Arc<dyn FileStore>,
        tasks: Arc<dyn TaskStore>,
    ) -> SyncResult<Self> {
        config.validate()?;

        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone())?);
        let breaker = Arc::new(CircuitBreaker::new(
            "upstream",
            config.circuit_breaker.clone(),
        ));
        let mut executor = RetryExecutor::new(config.retry.clone())?
            .with_rate_limiter(Arc::clone(&limiter))
            .with_circuit_breaker(breaker);
        if let Some(adaptive) = &config.adaptive {
            let adaptive = AdaptiveRateLimiter::new(Arc::clone(&limiter), adaptive.clone())?;
            executor = executor.with_adaptive_rate_limiter(Arc::new(adaptive));
        }

        let events: Arc<dyn EventSink> = Arc::new(TracingEventSink);
        let processor = OperationProcessor::new(Arc::clone(&store), config.processor.clone())
            .with_event_sink(Arc::clone(&events));

        Ok(Self {
            config,
            source: ResilientSource::new(source, executor),
            store,
            tasks,
            processor,
            progress: Arc::new(ProgressTracker::new()),
            events,
        })
    }

    /// Set the sink receiving task, batch and operation events.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.processor = OperationProcessor::new(
            Arc::clone(&self.store),
            self.config.processor.clone(),
        )
        .with_event_sink(Arc::clone(&events));
        self.events = events;
        self
    }

    /// Refresh credentials when the upstream rejects authentication.
    #[must_use]
    pub fn with_credential_refresher(mut self, refresher: Arc<dyn CredentialRefresher>) -> Self {
        let inner = Arc::clone(self.source.inner());
        let executor = self
            .source
            .executor()
            .clone()
            .with_credential_refresher(refresher);
        self.source = ResilientSource::new(inner, executor);
        self
    }

    /// Share a progress tracker with other components.
    #[must_use]
    pub fn with_progress_tracker(mut self, progress: Arc<ProgressTracker>) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn source(&self) -> &ResilientSource<Arc<dyn RecordSource>> {
        &self.source
    }

    pub fn processor(&self) -> &OperationProcessor {
        &self.processor
    }

    pub fn progress(&self) -> &Arc<ProgressTracker> {
        &self.progress
    }

    pub fn tasks(&self) -> &Arc<dyn TaskStore> {
        &self.tasks
    }

    /// Creates a task using the engine's batch size and retry budget.
    pub async fn create_task(&self, task_type: TaskType, target: &str) -> SyncResult<Task> {
        let config = TaskConfig {
            batch_size: self.config.batch_size,
            max_retries: self.config.processor.max_retries,
            ..TaskConfig::default()
        };
        self.tasks
            .create_task(NewTask::new(task_type, target).with_config(config))
            .await
    }

    pub async fn get_progress(&self, task_id: TaskId) -> Option<TaskProgress> {
        self.progress.get_progress(task_id).await
    }

    /// Requests cooperative cancellation. A running task stops at its next
    /// batch boundary.
    pub async fn cancel_task(&self, task_id: TaskId) -> SyncResult<Task> {
        self.tasks.cancel_task(task_id).await
    }

    /// Drops the in-memory progress of a finished task.
    pub async fn cleanup_task(&self, task_id: TaskId) -> Option<TaskProgress> {
        self.progress.remove(task_id).await
    }

    /// Runs a pending task to completion, failure or cancellation.
    ///
    /// Errors inside the run mark the task `failed` and are reported through
    /// the returned task's `error_message`. `Err` is returned only when the
    /// task cannot be loaded or started.
    #[instrument(skip(self, ctx), fields(task_id = %task_id))]
    pub async fn run_task(&self, task_id: TaskId, ctx: &CallContext) -> SyncResult<Task> {
        let mut task = self.tasks.get_task(task_id).await?;
        task.transition_to(TaskStatus::Running)?;
        self.tasks.update_task(&task).await?;

        info!(task_type = %task.task_type, target = %task.target, "Task started");
        events::emit(
            self.events.as_ref(),
            SyncEvent::new(task_id, SyncEventKind::TaskStarted, TaskStatus::Running.as_str()),
        )
        .await;

        let ctx = ctx.child("run_task");
        let outcome = self.execute(&task, &ctx).await;
        self.processor.clear_completed(task_id).await;

        match outcome {
            Ok(RunOutcome::Completed { summary, cutoff }) => {
                self.progress.complete(task_id).await?;
                task.summary = Some(summary);
                task.sync_cutoff = cutoff;
                self.finish(task, TaskStatus::Completed).await
            }
            Ok(RunOutcome::Cancelled(summary)) => {
                task.summary = Some(summary);
                self.finish(task, TaskStatus::Cancelled).await
            }
            Err(e) if e.is_cancelled() => self.finish(task, TaskStatus::Cancelled).await,
            Err(e) => {
                warn!(error = %e, code = e.error_code(), "Task failed");
                task.error_message = Some(e.to_string());
                self.finish(task, TaskStatus::Failed).await
            }
        }
    }

    async fn execute(&self, task: &Task, ctx: &CallContext) -> SyncResult<RunOutcome> {
        self.store.pull().await?;

        if task.task_type == TaskType::Maintenance {
            return self.run_maintenance(task).await;
        }

        let previous_checkpoint = self.last_checkpoint(&task.target).await?;
        let query = self.build_query(task, previous_checkpoint);
        let fetch_started = Utc::now();
        let records = self
            .source
            .fetch_all_changed(ctx, &query, u64::from(self.config.page_size))
            .await?;
        debug!(query = %query, records = records.len(), "Fetched change set");

        let mut ops = Vec::with_capacity(records.len());
        for record in records {
            let operation_type = self.detect_operation_type(&task.target, &record).await?;
            let op = self
                .processor
                .create_operation(task.id, &task.target, record, operation_type)
                .with_max_retries(task.config.max_retries);
            ops.push(op);
        }
        sort_by_priority(&mut ops);

        let mut summary = TaskSummary {
            total_items: ops.len() as u64,
            ..TaskSummary::default()
        };
        self.progress.start_tracking(task.id, summary.total_items).await;

        let mut processed = 0u64;
        for chunk in ops.chunks_mut(task.config.batch_size.max(1)) {
            if ctx.is_cancelled() || self.cancel_requested(task.id).await? {
                info!(processed, "Cancellation observed at batch boundary");
                return Ok(RunOutcome::Cancelled(summary));
            }

            let batch = self.run_batch(&ctx.detached("batch"), task, chunk).await?;
            processed += batch.total_ops as u64;
            self.record_batch(task.id, &batch, chunk, &mut summary).await?;
            self.progress.update_progress(task.id, processed).await?;

            if batch.commit_id.is_some() && self.config.push_after_commit {
                self.store.push().await?;
            }
        }

        // Failed records are only picked up again if the checkpoint stays put.
        let cutoff = if summary.failed == 0 {
            Some(fetch_started)
        } else {
            warn!(failed = summary.failed, "Keeping previous checkpoint after failures");
            previous_checkpoint
        };
        Ok(RunOutcome::Completed { summary, cutoff })
    }

    /// Processes one batch, re-running it while the commit keeps failing.
    ///
    /// `ctx` must not be tied to the caller's cancellation.
    async fn run_batch(
        &self,
        ctx: &CallContext,
        task: &Task,
        chunk: &mut [SyncOperation],
    ) -> SyncResult<BatchOperationResult> {
        let pristine = chunk.to_vec();
        let mut attempt = 0u32;

        loop {
            let batch = self.processor.process_batch(ctx, chunk).await?;
            let Some(commit_error) = batch.commit_error.clone() else {
                return Ok(batch);
            };
            if attempt >= task.config.max_retries {
                self.processor.record_batch_metrics(&batch).await;
                return Err(SyncError::commit(format!(
                    "batch commit failed after {attempt} retries: {commit_error}"
                )));
            }

            attempt += 1;
            warn!(attempt, error = %commit_error, "Re-running batch after commit failure");
            ctx.sleep(self.config.processor.retry_delay().saturating_mul(attempt))
                .await?;
            chunk.clone_from_slice(&pristine);
        }
    }

    async fn record_batch(
        &self,
        task_id: TaskId,
        batch: &BatchOperationResult,
        ops: &[SyncOperation],
        summary: &mut TaskSummary,
    ) -> SyncResult<()> {
        summary.successful += batch.successful_ops as u64;
        summary.failed += batch.failed_ops as u64;
        summary.skipped += batch.skipped_ops as u64;
        if let Some(commit_id) = &batch.commit_id {
            summary.commits.push(commit_id.clone());
        }

        for op in ops.iter().filter(|op| op.status == OperationStatus::Failed) {
            let message = op
                .error_details
                .as_ref()
                .map_or_else(|| "unknown error".to_string(), |e| e.message.clone());
            self.progress
                .set_error(task_id, format!("{}: {message}", op.record_key))
                .await?;
        }
        if batch.skipped_ops > 0 {
            self.progress
                .record_skipped(task_id, batch.skipped_ops as u64)
                .await?;
        }
        Ok(())
    }

    async fn run_maintenance(&self, task: &Task) -> SyncResult<RunOutcome> {
        self.progress.start_tracking(task.id, 0).await;
        let mut summary = TaskSummary::default();

        if self.store.has_staged_changes().await? {
            let commit_id = self
                .store
                .commit(MAINTENANCE_COMMIT_MESSAGE, &self.config.processor.commit_author)
                .await?;
            info!(commit = %commit_id, "Committed leftover staged changes");
            summary.commits.push(commit_id);
        }
        self.store.push().await?;

        Ok(RunOutcome::Completed {
            summary,
            cutoff: None,
        })
    }

    fn build_query(&self, task: &Task, checkpoint: Option<DateTime<Utc>>) -> ChangeQuery {
        let mut query = ChangeQuery::new(task.target.clone());
        if let Some(filter) = &task.config.filter {
            query = query.with_filter(filter.clone());
        }
        if task.task_type == TaskType::Reconciliation && !task.config.force_refresh {
            if let Some(since) = checkpoint {
                query = query.updated_since(since);
            }
        }
        query
    }

    /// Latest cutoff recorded by a completed task for `target`.
    async fn last_checkpoint(&self, target: &str) -> SyncResult<Option<DateTime<Utc>>> {
        let filter = TaskFilter {
            status: Some(TaskStatus::Completed),
            target: Some(target.to_string()),
            ..TaskFilter::default()
        };
        let tasks = self.tasks.list_tasks(&filter).await?;
        Ok(tasks.iter().filter_map(|t| t.sync_cutoff).max())
    }

    async fn detect_operation_type(
        &self,
        target: &str,
        record: &UpstreamRecord,
    ) -> SyncResult<OperationType> {
        if record.deleted {
            return Ok(OperationType::Delete);
        }
        if let Some(previous) = record.previous_key.as_deref() {
            if previous != record.key && self.store.file_exists(&target_path(target, previous)).await? {
                return Ok(OperationType::Move);
            }
        }
        if self.store.file_exists(&target_path(target, &record.key)).await? {
            Ok(OperationType::Update)
        } else {
            Ok(OperationType::Create)
        }
    }

    async fn cancel_requested(&self, task_id: TaskId) -> SyncResult<bool> {
        Ok(self.tasks.get_task(task_id).await?.status == TaskStatus::Cancelled)
    }

    /// Moves `task` to its terminal `status` and persists it.
    ///
    /// If the store already holds a terminal status (a cancellation that
    /// raced the end of the run), the stored task wins.
    async fn finish(&self, mut task: Task, status: TaskStatus) -> SyncResult<Task> {
        let stored = self.tasks.get_task(task.id).await?;
        if stored.status.is_terminal() && stored.status != status {
            info!(status = %stored.status, "Task already finished elsewhere");
            return Ok(stored);
        }

        task.transition_to(status)?;
        self.tasks.update_task(&task).await?;

        let kind = match status {
            TaskStatus::Completed => SyncEventKind::TaskCompleted,
            TaskStatus::Cancelled => SyncEventKind::TaskCancelled,
            _ => SyncEventKind::TaskFailed,
        };
        let mut event = SyncEvent::new(task.id, kind, status.as_str());
        if let Some(message) = &task.error_message {
            event = event.with_message(message.clone());
        }
        if let Some(started) = task.started_at {
            let elapsed = (Utc::now() - started).to_std().unwrap_or_default();
            event = event.with_duration(elapsed);
        }
        events::emit(self.events.as_ref(), event).await;

        info!(status = %task.status, "Task finished");
        Ok(task)
    }
}
