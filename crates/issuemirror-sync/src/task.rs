//! Synchronization tasks and their persistence contract.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use issuemirror_core::TaskId;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{SyncError, SyncResult};
use crate::operation::DEFAULT_MAX_RETRIES;
use crate::types::{TaskStatus, TaskType};

/// Configuration snapshot taken when a task is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Ignore the reconciliation checkpoint and fetch everything.
    #[serde(default)]
    pub force_refresh: bool,

    /// Upstream filter expression, passed through verbatim.
    #[serde(default)]
    pub filter: Option<String>,

    /// Operations per batch commit (default: 50).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Retry budget for operations and batch commits (default: 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_batch_size() -> usize {
    50
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            force_refresh: false,
            filter: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
        }
    }
}

/// Request to create a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub task_type: TaskType,
    /// Upstream project key to mirror.
    pub target: String,
    #[serde(default)]
    pub config: TaskConfig,
}

impl NewTask {
    pub fn new(task_type: TaskType, target: impl Into<String>) -> Self {
        Self {
            task_type,
            target: target.into(),
            config: TaskConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: TaskConfig) -> Self {
        self.config = config;
        self
    }
}

/// Totals recorded when a run finishes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub total_items: u64,
    pub successful: u64,
    pub failed: u64,
    pub skipped: u64,
    pub commits: Vec<String>,
}

/// A long-running synchronization run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: TaskType,
    pub target: String,
    pub status: TaskStatus,
    pub config: TaskConfig,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// Upper bound of the change window this run covered. The next
    /// reconciliation fetches records updated after it.
    pub sync_cutoff: Option<DateTime<Utc>>,
    pub summary: Option<TaskSummary>,
}

impl Task {
    pub fn new(new_task: NewTask) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            task_type: new_task.task_type,
            target: new_task.target,
            status: TaskStatus::Pending,
            config: new_task.config,
            error_message: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            sync_cutoff: None,
            summary: None,
        }
    }

    /// Moves to `next`, stamping start/finish times.
    pub fn transition_to(&mut self, next: TaskStatus) -> SyncResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(SyncError::invalid_state_transition(self.status, next));
        }
        let now = Utc::now();
        if next == TaskStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>) -> SyncResult<()> {
        self.error_message = Some(message.into());
        self.transition_to(TaskStatus::Failed)
    }
}

/// Filters for [`TaskStore::list_tasks`]. Empty fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<TaskType>,
    pub target: Option<String>,
}

impl TaskFilter {
    #[must_use]
    pub fn matches(&self, task: &Task) -> bool {
        self.status.map_or(true, |s| s == task.status)
            && self.task_type.map_or(true, |t| t == task.task_type)
            && self.target.as_deref().map_or(true, |t| t == task.target)
    }
}

/// Task persistence.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create_task(&self, new_task: NewTask) -> SyncResult<Task>;

    async fn get_task(&self, id: TaskId) -> SyncResult<Task>;

    /// Replaces the stored task. Status changes must be legal transitions.
    async fn update_task(&self, task: &Task) -> SyncResult<()>;

    /// Matching tasks, oldest first.
    async fn list_tasks(&self, filter: &TaskFilter) -> SyncResult<Vec<Task>>;

    /// Requests cancellation. Running tasks stop at the next batch boundary.
    async fn cancel_task(&self, id: TaskId) -> SyncResult<Task>;
}

/// Task store held in memory.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create_task(&self, new_task: NewTask) -> SyncResult<Task> {
        if new_task.target.trim().is_empty() {
            return Err(SyncError::validation("task target must not be empty"));
        }
        if new_task.config.batch_size == 0 {
            return Err(SyncError::validation("batch_size must be > 0"));
        }

        let task = Task::new(new_task);
        self.tasks.write().await.insert(task.id, task.clone());
        info!(task_id = %task.id, task_type = %task.task_type, target = %task.target, "Created task");
        Ok(task)
    }

    async fn get_task(&self, id: TaskId) -> SyncResult<Task> {
        self.tasks
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| SyncError::not_found("Task", id.to_string()))
    }

    async fn update_task(&self, task: &Task) -> SyncResult<()> {
        let mut tasks = self.tasks.write().await;
        let stored = tasks
            .get_mut(&task.id)
            .ok_or_else(|| SyncError::not_found("Task", task.id.to_string()))?;

        if stored.status != task.status && !stored.status.can_transition_to(task.status) {
            return Err(SyncError::invalid_state_transition(stored.status, task.status));
        }
        *stored = task.clone();
        Ok(())
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> SyncResult<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn cancel_task(&self, id: TaskId) -> SyncResult<Task> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(&id)
            .ok_or_else(|| SyncError::not_found("Task", id.to_string()))?;

        if task.status != TaskStatus::Cancelled {
            task.transition_to(TaskStatus::Cancelled)?;
            info!(task_id = %id, "Task cancellation requested");
        }
        Ok(task.clone())
    }
}
