//! # issuemirror-sync
//!
//! Change-data-capture engine mirroring issue tracker state into a
//! versioned file store.
//!
//! ## Pipeline
//!
//! 1. A [`Task`] is created through a [`TaskStore`]
//! 2. [`SyncEngine::run_task`] fetches changed records through the protected
//!    upstream source
//! 3. The [`OperationProcessor`] turns records into prioritized
//!    [`SyncOperation`]s and stages rendered files
//! 4. Each batch becomes one commit in the [`FileStore`]
//! 5. The [`ProgressTracker`] and [`EventSink`] report what happened
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use issuemirror_connector::RecordSource;
//! use issuemirror_core::CallContext;
//! use issuemirror_sync::{EngineConfig, InMemoryFileStore, InMemoryTaskStore, SyncEngine, TaskType};
//!
//! # async fn example(source: Arc<dyn RecordSource>) -> issuemirror_sync::SyncResult<()> {
//! let engine = SyncEngine::new(
//!     EngineConfig::from_env()?,
//!     source,
//!     Arc::new(InMemoryFileStore::new()),
//!     Arc::new(InMemoryTaskStore::new()),
//! )?;
//!
//! let task = engine.create_task(TaskType::Bootstrap, "PROJ").await?;
//! let finished = engine.run_task(task.id, &CallContext::new("sync", "bootstrap")).await?;
//! println!("{}: {:?}", finished.status, finished.summary);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod operation;
pub mod priority;
pub mod processor;
pub mod progress;
pub mod render;
pub mod store;
pub mod task;
pub mod telemetry;
pub mod types;

pub use config::{EngineConfig, ProcessorConfig};
pub use engine::SyncEngine;
pub use error::{SyncError, SyncResult};
pub use events::{ChannelEventSink, EventSink, SyncEvent, SyncEventKind, TracingEventSink};
pub use operation::{BatchOperationResult, OperationError, OperationResult, SyncOperation};
pub use processor::{OperationProcessor, ProcessorMetrics};
pub use progress::{ProgressObserver, ProgressTracker, TaskProgress};
pub use render::RenderedFile;
pub use store::{CommitInfo, FileStore, InMemoryFileStore, LocalFileStore};
pub use task::{InMemoryTaskStore, NewTask, Task, TaskConfig, TaskFilter, TaskStore, TaskSummary};
pub use types::{DeletionPolicy, OperationStatus, OperationType, TaskStatus, TaskType};
