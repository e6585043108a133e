//! Per-task progress tracking.
//!
//! Updates are serialized through one lock and `processed_items` only grows.
//! Each observer drains its own bounded queue on a spawned task, so it sees
//! snapshots in update order and a slow or failing observer never blocks the
//! processing loop. Observer errors are logged, not returned. A full queue
//! drops the snapshot.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use issuemirror_core::TaskId;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};

const OBSERVER_QUEUE_CAPACITY: usize = 256;

/// Progress counters for one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskProgress {
    pub task_id: TaskId,
    pub total_items: u64,
    pub processed_items: u64,
    /// `processed_items / total_items * 100`, or 0 when there is nothing to do.
    pub percent_complete: f64,
    pub start_time: DateTime<Utc>,
    pub last_update_time: DateTime<Utc>,
    pub average_time_per_item: Option<Duration>,
    pub estimated_remaining: Option<Duration>,
    pub items_per_second: f64,
    pub error_count: u64,
    pub skipped_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub completed: bool,
    #[serde(skip)]
    started: Instant,
}

impl TaskProgress {
    fn new(task_id: TaskId, total_items: u64) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            total_items,
            processed_items: 0,
            percent_complete: 0.0,
            start_time: now,
            last_update_time: now,
            average_time_per_item: None,
            estimated_remaining: None,
            items_per_second: 0.0,
            error_count: 0,
            skipped_count: 0,
            last_error: None,
            completed: false,
            started: Instant::now(),
        }
    }

    /// Time since tracking started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn recompute(&mut self) {
        self.percent_complete = if self.total_items == 0 {
            0.0
        } else {
            (self.processed_items as f64 / self.total_items as f64 * 100.0).min(100.0)
        };

        let elapsed = self.elapsed();
        if self.processed_items > 0 {
            let per_item_nanos = elapsed.as_nanos() / u128::from(self.processed_items);
            let per_item = Duration::from_nanos(u64::try_from(per_item_nanos).unwrap_or(u64::MAX));
            self.average_time_per_item = Some(per_item);
            self.estimated_remaining = if self.processed_items < self.total_items {
                let remaining = self.total_items - self.processed_items;
                Some(per_item.saturating_mul(u32::try_from(remaining).unwrap_or(u32::MAX)))
            } else {
                Some(Duration::ZERO)
            };
        }
        let secs = elapsed.as_secs_f64();
        self.items_per_second = if secs > 0.0 {
            self.processed_items as f64 / secs
        } else {
            0.0
        };
        self.last_update_time = Utc::now();
    }
}

/// Receives progress snapshots.
#[async_trait]
pub trait ProgressObserver: Send + Sync {
    async fn on_progress(&self, progress: &TaskProgress) -> SyncResult<()>;
}

/// Tracks progress for every running task.
#[derive(Default)]
pub struct ProgressTracker {
    tasks: RwLock<HashMap<TaskId, TaskProgress>>,
    observers: RwLock<Vec<mpsc::Sender<Arc<TaskProgress>>>>,
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker").finish_non_exhaustive()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `observer`. Must be called from within a Tokio runtime.
    pub async fn add_observer(&self, observer: Arc<dyn ProgressObserver>) {
        let (tx, mut rx) = mpsc::channel::<Arc<TaskProgress>>(OBSERVER_QUEUE_CAPACITY);
        tokio::spawn(async move {
            while let Some(progress) = rx.recv().await {
                if let Err(e) = observer.on_progress(&progress).await {
                    warn!(task_id = %progress.task_id, error = %e, "Progress observer failed");
                }
            }
        });
        self.observers.write().await.push(tx);
    }

    /// Starts (or restarts) tracking `task_id` at 0%.
    pub async fn start_tracking(&self, task_id: TaskId, total_items: u64) -> TaskProgress {
        let progress = TaskProgress::new(task_id, total_items);
        let mut tasks = self.tasks.write().await;
        tasks.insert(task_id, progress.clone());
        self.notify(&progress).await;
        drop(tasks);
        debug!(task_id = %task_id, total_items, "Started progress tracking");
        progress
    }

    /// Records `processed_items` done. Lower values than already recorded
    /// are ignored.
    pub async fn update_progress(&self, task_id: TaskId, processed_items: u64) -> SyncResult<TaskProgress> {
        self.mutate_and_notify(task_id, |p| {
            p.processed_items = p.processed_items.max(processed_items);
            p.recompute();
        })
        .await
    }

    /// Counts a per-item error. The task keeps running.
    pub async fn set_error(&self, task_id: TaskId, error: impl Display) -> SyncResult<TaskProgress> {
        let message = error.to_string();
        warn!(task_id = %task_id, error = %message, "Item failed");
        self.mutate(task_id, |p| {
            p.error_count += 1;
            p.last_error = Some(message);
            p.last_update_time = Utc::now();
        })
        .await
    }

    pub async fn record_skipped(&self, task_id: TaskId, count: u64) -> SyncResult<TaskProgress> {
        self.mutate(task_id, |p| {
            p.skipped_count += count;
            p.last_update_time = Utc::now();
        })
        .await
    }

    /// Forces 100% with nothing remaining.
    pub async fn complete(&self, task_id: TaskId) -> SyncResult<TaskProgress> {
        self.mutate_and_notify(task_id, |p| {
            p.processed_items = p.processed_items.max(p.total_items);
            p.recompute();
            p.percent_complete = 100.0;
            p.estimated_remaining = Some(Duration::ZERO);
            p.completed = true;
        })
        .await
    }

    pub async fn get_progress(&self, task_id: TaskId) -> Option<TaskProgress> {
        self.tasks.read().await.get(&task_id).cloned()
    }

    /// Drops the progress entry of a finished task.
    pub async fn remove(&self, task_id: TaskId) -> Option<TaskProgress> {
        self.tasks.write().await.remove(&task_id)
    }

    pub async fn tracked_tasks(&self) -> Vec<TaskId> {
        self.tasks.read().await.keys().copied().collect()
    }

    async fn mutate<F>(&self, task_id: TaskId, f: F) -> SyncResult<TaskProgress>
    where
        F: FnOnce(&mut TaskProgress),
    {
        let mut tasks = self.tasks.write().await;
        let progress = tasks
            .get_mut(&task_id)
            .ok_or_else(|| SyncError::not_found("Task progress", task_id.to_string()))?;
        f(progress);
        Ok(progress.clone())
    }

    /// Like `mutate`, but queues the snapshot for observers before the
    /// lock is released so queues receive snapshots in update order.
    async fn mutate_and_notify<F>(&self, task_id: TaskId, f: F) -> SyncResult<TaskProgress>
    where
        F: FnOnce(&mut TaskProgress),
    {
        let mut tasks = self.tasks.write().await;
        let progress = tasks
            .get_mut(&task_id)
            .ok_or_else(|| SyncError::not_found("Task progress", task_id.to_string()))?;
        f(progress);
        let snapshot = progress.clone();
        self.notify(&snapshot).await;
        Ok(snapshot)
    }

    async fn notify(&self, progress: &TaskProgress) {
        let observers = self.observers.read().await;
        if observers.is_empty() {
            return;
        }
        let progress = Arc::new(progress.clone());
        for queue in observers.iter() {
            match queue.try_send(Arc::clone(&progress)) {
                Ok(()) | Err(TrySendError::Closed(_)) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(task_id = %progress.task_id, "Progress observer is behind, dropping snapshot");
                }
            }
        }
    }
}
