//! Integration tests for the operation processor against file stores.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use common::*;
use issuemirror_core::{CallContext, TaskId};
use issuemirror_sync::{
    DeletionPolicy, EventSink, FileStore, InMemoryFileStore, OperationProcessor, OperationStatus,
    OperationType, ProcessorConfig, SyncError, SyncEvent, SyncEventKind, SyncOperation, SyncResult,
};

fn processor_for(store: Arc<dyn FileStore>) -> OperationProcessor {
    init_test_logging();
    OperationProcessor::new(store, ProcessorConfig::for_testing())
}

fn create_ops(processor: &OperationProcessor, task_id: TaskId, count: u32) -> Vec<SyncOperation> {
    create_test_records(count)
        .into_iter()
        .map(|r| processor.create_operation(task_id, TARGET, r, OperationType::Create))
        .collect()
}

#[tokio::test]
async fn test_reprocessing_unchanged_record_is_idempotent() {
    let store = Arc::new(InMemoryFileStore::new());
    let processor = processor_for(store.clone());
    let task_id = TaskId::new();

    let mut first = create_ops(&processor, task_id, 1);
    let batch = processor.process_batch(&test_ctx(), &mut first).await.unwrap();
    assert!(batch.commit_id.is_some());
    let content = store.committed_content("PROJ/PROJ-1.md").await.unwrap();

    for _ in 0..3 {
        let record = create_test_record(1);
        let mut again = vec![processor.create_operation(task_id, TARGET, record, OperationType::Update)];
        let batch = processor.process_batch(&test_ctx(), &mut again).await.unwrap();

        assert_eq!(batch.successful_ops, 1);
        assert_eq!(batch.files_touched, 0);
        assert!(batch.commit_id.is_none());
    }

    assert_eq!(store.commits().await.len(), 1);
    assert_eq!(store.committed_content("PROJ/PROJ-1.md").await.unwrap(), content);
}

#[tokio::test]
async fn test_batch_keeps_supplied_order() {
    let store = Arc::new(InMemoryFileStore::new());
    let processor = processor_for(store.clone());
    let task_id = TaskId::new();

    let mut ops = create_ops(&processor, task_id, 3);
    for (op, priority) in ops.iter_mut().zip([10, 100, 50]) {
        op.priority = priority;
    }
    issuemirror_sync::priority::sort_by_priority(&mut ops);

    let batch = processor.process_batch(&test_ctx(), &mut ops).await.unwrap();
    let keys: Vec<&str> = batch.results.iter().map(|r| r.record_key.as_str()).collect();
    assert_eq!(keys, vec!["PROJ-2", "PROJ-3", "PROJ-1"]);

    let commits = store.commits().await;
    assert_eq!(commits.len(), 1);
    assert!(commits[0]
        .message
        .ends_with("- create PROJ-2\n- create PROJ-3\n- create PROJ-1\n"));
}

#[tokio::test(start_paused = true)]
async fn test_retry_budget_is_exhausted_not_exceeded() {
    let store = Arc::new(FlakyFileStore::new());
    store.fail_all_stages();
    let processor = processor_for(store.clone());

    let mut op = create_ops(&processor, TaskId::new(), 1).remove(0);
    assert_eq!(op.max_retries, 3);

    let result = processor.process_operation(&test_ctx(), &mut op).await.unwrap();
    assert_eq!(result.status, OperationStatus::Failed);

    for attempt in 1..=3 {
        let result = processor.retry_operation(&test_ctx(), &mut op).await.unwrap();
        assert_eq!(result.status, OperationStatus::Failed);
        assert_eq!(op.retry_count, attempt);
    }

    let err = processor.retry_operation(&test_ctx(), &mut op).await.unwrap_err();
    assert!(matches!(err, SyncError::RetryBudgetExhausted { max_retries: 3, .. }));
    assert_eq!(op.status, OperationStatus::Failed);
    assert_eq!(op.retry_count, 3);
    assert_eq!(store.stage_count(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_retry_succeeds_after_transient_failure() {
    let store = Arc::new(FlakyFileStore::new());
    store.fail_stage_for("PROJ/PROJ-1.md").await;
    let processor = processor_for(store.clone());

    let mut op = create_ops(&processor, TaskId::new(), 1).remove(0);
    processor.process_operation(&test_ctx(), &mut op).await.unwrap();
    assert_eq!(op.status, OperationStatus::Failed);
    assert!(op.error_details.as_ref().unwrap().retryable);

    store.clear_failures().await;
    let result = processor.retry_operation(&test_ctx(), &mut op).await.unwrap();

    assert_eq!(result.status, OperationStatus::Completed);
    assert_eq!(op.retry_count, 1);
    assert!(op.error_details.is_none());
}

#[tokio::test]
async fn test_all_failures_produce_no_commit() {
    let store = Arc::new(FlakyFileStore::new());
    store.fail_all_stages();
    let processor = processor_for(store.clone());

    let mut ops = create_ops(&processor, TaskId::new(), 5);
    let batch = processor.process_batch(&test_ctx(), &mut ops).await.unwrap();

    assert_eq!(batch.total_ops, 5);
    assert_eq!(batch.successful_ops, 0);
    assert_eq!(batch.failed_ops, 5);
    assert!(batch.commit_id.is_none());
    assert_eq!(store.commit_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_one_success_produces_exactly_one_commit() {
    let store = Arc::new(FlakyFileStore::new());
    for n in 2..=5 {
        store.fail_stage_for(&format!("PROJ/PROJ-{n}.md")).await;
    }
    let processor = processor_for(store.clone());

    let mut ops = create_ops(&processor, TaskId::new(), 5);
    let batch = processor.process_batch(&test_ctx(), &mut ops).await.unwrap();

    assert_eq!(batch.successful_ops, 1);
    assert_eq!(batch.failed_ops, 4);
    let commit_id = batch.commit_id.expect("one commit");
    let commits = store.inner.commits().await;
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].id, commit_id);
    assert_eq!(commits[0].files, vec!["PROJ/PROJ-1.md"]);
}

#[tokio::test]
async fn test_commit_failure_keeps_operation_status() {
    let store = Arc::new(FlakyFileStore::new());
    store.fail_commits(1);
    let processor = processor_for(store.clone());

    let mut ops = create_ops(&processor, TaskId::new(), 2);
    let batch = processor.process_batch(&test_ctx(), &mut ops).await.unwrap();

    assert!(batch.commit_id.is_none());
    assert!(batch.commit_error.as_deref().unwrap().contains("remote rejected"));
    assert!(ops.iter().all(|op| op.status == OperationStatus::Completed));
    assert!(store.inner.has_staged_changes().await.unwrap());
}

#[tokio::test]
async fn test_rerun_after_commit_failure_counts_operations_once() {
    let store = Arc::new(FlakyFileStore::new());
    store.fail_commits(1);
    let processor = processor_for(store.clone());

    let pristine = create_ops(&processor, TaskId::new(), 2);
    let mut ops = pristine.clone();
    let failed = processor.process_batch(&test_ctx(), &mut ops).await.unwrap();
    assert!(failed.commit_error.is_some());
    assert_eq!(processor.metrics().await.total_operations, 0);

    let mut ops = pristine;
    let batch = processor.process_batch(&test_ctx(), &mut ops).await.unwrap();
    assert!(batch.commit_id.is_some());

    let metrics = processor.metrics().await;
    assert_eq!(metrics.total_operations, 2);
    assert_eq!(metrics.successful_operations, 2);
}

#[tokio::test]
async fn test_cancellation_before_first_operation_skips_commit() {
    let store = Arc::new(InMemoryFileStore::new());
    let processor = processor_for(store.clone());
    let ctx = test_ctx();
    ctx.cancel();

    let mut ops = create_ops(&processor, TaskId::new(), 3);
    let err = processor.process_batch(&ctx, &mut ops).await.unwrap_err();

    assert!(err.is_cancelled());
    assert!(ops.iter().all(|op| op.status == OperationStatus::Pending));
    assert!(store.commits().await.is_empty());
}

/// Cancels the wrapped context after the first processed operation.
struct CancelOnFirstOperation {
    ctx: CallContext,
}

#[async_trait]
impl EventSink for CancelOnFirstOperation {
    async fn emit(&self, event: SyncEvent) -> SyncResult<()> {
        if event.kind == SyncEventKind::OperationProcessed {
            self.ctx.cancel();
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_cancellation_mid_batch_commits_processed_operations() {
    let store = Arc::new(InMemoryFileStore::new());
    let ctx = test_ctx();
    let processor = processor_for(store.clone())
        .with_event_sink(Arc::new(CancelOnFirstOperation { ctx: ctx.clone() }));

    let mut ops = create_ops(&processor, TaskId::new(), 5);
    let batch = processor.process_batch(&ctx, &mut ops).await.unwrap();

    assert!(batch.cancelled);
    assert_eq!(batch.total_ops, 1);
    assert!(batch.commit_id.is_some());
    assert_eq!(ops[0].status, OperationStatus::Completed);
    assert!(ops[1..].iter().all(|op| op.status == OperationStatus::Pending));
    assert_eq!(store.committed_paths().await, vec!["PROJ/PROJ-1.md"]);
    assert!(!store.has_staged_changes().await.unwrap());
}

#[tokio::test]
async fn test_move_tombstones_previous_path() {
    let store = Arc::new(InMemoryFileStore::new());
    let config = ProcessorConfig {
        deletion_policy: DeletionPolicy::Tombstone,
        ..ProcessorConfig::for_testing()
    };
    let processor = OperationProcessor::new(store.clone(), config);
    let task_id = TaskId::new();

    let mut create = vec![processor.create_operation(
        task_id,
        TARGET,
        create_test_record(1),
        OperationType::Create,
    )];
    processor.process_batch(&test_ctx(), &mut create).await.unwrap();

    let moved = create_test_record(1);
    let moved = issuemirror_connector::UpstreamRecord {
        key: "PROJ-100".to_string(),
        ..moved
    }
    .with_previous_key("PROJ-1");
    let mut ops = vec![processor.create_operation(task_id, TARGET, moved, OperationType::Move)];
    let batch = processor.process_batch(&test_ctx(), &mut ops).await.unwrap();

    assert_eq!(batch.successful_ops, 1);
    assert_eq!(batch.results[0].paths, vec!["PROJ/PROJ-100.md", "PROJ/PROJ-1.md"]);
    let tombstone = store.committed_content("PROJ/PROJ-1.md").await.unwrap();
    assert!(tombstone.contains("deleted: true"));
    assert!(store.committed_content("PROJ/PROJ-100.md").await.is_some());
}
