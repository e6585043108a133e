//! Common enums for operations and tasks.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of mutation an operation applies to the file store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Record seen for the first time.
    Create,
    /// Record already mirrored, content may have changed.
    Update,
    /// Record deleted upstream.
    Delete,
    /// Record re-keyed upstream (e.g. moved between projects).
    Move,
}

impl OperationType {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "create",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
            OperationType::Move => "move",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "create" => Ok(OperationType::Create),
            "update" => Ok(OperationType::Update),
            "delete" => Ok(OperationType::Delete),
            "move" => Ok(OperationType::Move),
            _ => Err(format!("Unknown operation type: {s}")),
        }
    }
}

/// Processing status of a single operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Waiting to be processed.
    Pending,
    /// Currently being processed.
    Processing,
    /// Successfully applied.
    Completed,
    /// Processing failed (may be retried).
    Failed,
    /// Intentionally not applied.
    Skipped,
}

impl OperationStatus {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Processing => "processing",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
            OperationStatus::Skipped => "skipped",
        }
    }

    /// Check if this is a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Completed | OperationStatus::Skipped)
    }

    /// Forward-only transitions. `Failed -> Processing` is the retry edge.
    #[must_use]
    pub fn can_transition_to(&self, next: OperationStatus) -> bool {
        use OperationStatus::{Completed, Failed, Pending, Processing, Skipped};
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed | Failed | Skipped)
                | (Failed, Processing)
        )
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for OperationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(OperationStatus::Pending),
            "processing" => Ok(OperationStatus::Processing),
            "completed" => Ok(OperationStatus::Completed),
            "failed" => Ok(OperationStatus::Failed),
            "skipped" => Ok(OperationStatus::Skipped),
            _ => Err(format!("Unknown operation status: {s}")),
        }
    }
}

/// Kind of synchronization run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Full resync of every record.
    Bootstrap,
    /// Incremental resync since the last checkpoint.
    Reconciliation,
    /// Housekeeping: commit leftovers and push, no upstream fetch.
    Maintenance,
}

impl TaskType {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Bootstrap => "bootstrap",
            TaskType::Reconciliation => "reconciliation",
            TaskType::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bootstrap" => Ok(TaskType::Bootstrap),
            "reconciliation" => Ok(TaskType::Reconciliation),
            "maintenance" => Ok(TaskType::Maintenance),
            _ => Err(format!("Unknown task type: {s}")),
        }
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Check if this is a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    #[must_use]
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::{Cancelled, Completed, Failed, Pending, Running};
        matches!(
            (self, next),
            (Pending, Running | Cancelled) | (Running, Completed | Failed | Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            _ => Err(format!("Unknown task status: {s}")),
        }
    }
}

/// What to do with records deleted upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionPolicy {
    /// Leave the mirrored file untouched and mark the operation skipped.
    #[default]
    Skip,
    /// Replace the mirrored file with a tombstone.
    Tombstone,
}

impl DeletionPolicy {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DeletionPolicy::Skip => "skip",
            DeletionPolicy::Tombstone => "tombstone",
        }
    }
}

impl fmt::Display for DeletionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DeletionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "skip" => Ok(DeletionPolicy::Skip),
            "tombstone" => Ok(DeletionPolicy::Tombstone),
            _ => Err(format!("Unknown deletion policy: {s}")),
        }
    }
}
