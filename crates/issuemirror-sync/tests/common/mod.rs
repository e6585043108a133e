//! Common test utilities for issuemirror-sync integration tests.

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use issuemirror_connector::{
    ChangeQuery, ConnectorError, ConnectorResult, RecordPage, RecordSource, UpstreamRecord,
};
use issuemirror_core::{CallContext, UpstreamError};
use issuemirror_sync::{
    EngineConfig, FileStore, InMemoryFileStore, InMemoryTaskStore, SyncEngine, SyncError,
    SyncResult,
};
use tokio::sync::Mutex;

pub use issuemirror_sync::telemetry::init_test_logging;

pub const TARGET: &str = "PROJ";

/// Test data factory for upstream records.
pub fn create_test_record(n: u32) -> UpstreamRecord {
    let updated = base_time() + Duration::minutes(i64::from(n));
    UpstreamRecord::new(format!("PROJ-{n}"), format!("Issue number {n}"))
        .with_status("Open")
        .with_priority("Medium")
        .with_description(format!("Description of issue {n}."))
        .with_updated_at(updated)
}

pub fn create_test_records(count: u32) -> Vec<UpstreamRecord> {
    (1..=count).map(create_test_record).collect()
}

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Mutable in-memory record source that remembers every query.
#[derive(Default)]
pub struct FakeRecordSource {
    records: Mutex<Vec<UpstreamRecord>>,
    failures: Mutex<VecDeque<UpstreamError>>,
    queries: Mutex<Vec<ChangeQuery>>,
    pub searches: AtomicU32,
}

impl FakeRecordSource {
    pub fn new(records: Vec<UpstreamRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            ..Self::default()
        }
    }

    /// The next calls fail with these errors, in order.
    pub async fn fail_next(&self, failures: impl IntoIterator<Item = UpstreamError>) {
        self.failures.lock().await.extend(failures);
    }

    /// Replaces the record with the same key, or appends it.
    pub async fn upsert(&self, record: UpstreamRecord) {
        let mut records = self.records.lock().await;
        match records.iter_mut().find(|r| r.key == record.key) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
    }

    pub async fn queries(&self) -> Vec<ChangeQuery> {
        self.queries.lock().await.clone()
    }

    async fn next_failure(&self) -> ConnectorResult<()> {
        match self.failures.lock().await.pop_front() {
            Some(err) => Err(ConnectorError::Upstream(err)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RecordSource for FakeRecordSource {
    async fn search_changed_records(
        &self,
        _ctx: &CallContext,
        query: &ChangeQuery,
        offset: u64,
        limit: u64,
    ) -> ConnectorResult<RecordPage> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().await.push(query.clone());
        self.next_failure().await?;

        let records = self.records.lock().await;
        let matching: Vec<&UpstreamRecord> = records
            .iter()
            .filter(|r| match (query.updated_since, r.updated_at) {
                (Some(since), Some(updated)) => updated > since,
                _ => true,
            })
            .collect();
        let total = matching.len() as u64;
        let page = matching
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(RecordPage::new(page, total))
    }

    async fn get_record(&self, _ctx: &CallContext, key: &str) -> ConnectorResult<UpstreamRecord> {
        self.next_failure().await?;
        self.records
            .lock()
            .await
            .iter()
            .find(|r| r.key == key)
            .cloned()
            .ok_or_else(|| {
                ConnectorError::Upstream(UpstreamError::status(404, format!("issue {key} does not exist")))
            })
    }
}

/// File store wrapper that injects staging and commit failures.
#[derive(Default)]
pub struct FlakyFileStore {
    pub inner: InMemoryFileStore,
    fail_all_stages: AtomicBool,
    failing_paths: Mutex<HashSet<String>>,
    commit_failures: AtomicU32,
    pub stage_calls: AtomicU32,
    pub commit_calls: AtomicU32,
}

impl FlakyFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_all_stages(&self) {
        self.fail_all_stages.store(true, Ordering::SeqCst);
    }

    pub async fn fail_stage_for(&self, path: &str) {
        self.failing_paths.lock().await.insert(path.to_string());
    }

    pub async fn clear_failures(&self) {
        self.fail_all_stages.store(false, Ordering::SeqCst);
        self.failing_paths.lock().await.clear();
        self.commit_failures.store(0, Ordering::SeqCst);
    }

    /// The next `count` commits fail.
    pub fn fail_commits(&self, count: u32) {
        self.commit_failures.store(count, Ordering::SeqCst);
    }

    pub fn stage_count(&self) -> u32 {
        self.stage_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FileStore for FlakyFileStore {
    async fn stage_file(&self, path: &str, content: &str) -> SyncResult<bool> {
        self.stage_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_all_stages.load(Ordering::SeqCst) || self.failing_paths.lock().await.contains(path) {
            return Err(SyncError::store(format!("cannot stage {path}")));
        }
        self.inner.stage_file(path, content).await
    }

    async fn has_staged_changes(&self) -> SyncResult<bool> {
        self.inner.has_staged_changes().await
    }

    async fn file_exists(&self, path: &str) -> SyncResult<bool> {
        self.inner.file_exists(path).await
    }

    async fn commit(&self, message: &str, author: &str) -> SyncResult<String> {
        self.commit_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.commit_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.commit_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(SyncError::commit("remote rejected the commit"));
        }
        self.inner.commit(message, author).await
    }

    async fn push(&self) -> SyncResult<()> {
        self.inner.push().await
    }

    async fn pull(&self) -> SyncResult<()> {
        self.inner.pull().await
    }
}

/// Everything an engine test needs to inspect.
pub struct TestHarness {
    pub engine: SyncEngine,
    pub source: Arc<FakeRecordSource>,
    pub store: Arc<FlakyFileStore>,
    pub tasks: Arc<InMemoryTaskStore>,
}

pub fn create_test_harness(records: Vec<UpstreamRecord>) -> TestHarness {
    create_test_harness_with(records, EngineConfig::for_testing())
}

pub fn create_test_harness_with(records: Vec<UpstreamRecord>, config: EngineConfig) -> TestHarness {
    init_test_logging();
    let source = Arc::new(FakeRecordSource::new(records));
    let store = Arc::new(FlakyFileStore::new());
    let tasks = Arc::new(InMemoryTaskStore::new());
    let engine = SyncEngine::new(
        config,
        Arc::clone(&source) as Arc<dyn RecordSource>,
        Arc::clone(&store) as Arc<dyn FileStore>,
        Arc::clone(&tasks) as Arc<dyn issuemirror_sync::TaskStore>,
    )
    .expect("engine config is valid");
    TestHarness {
        engine,
        source,
        store,
        tasks,
    }
}

pub fn test_ctx() -> CallContext {
    CallContext::new("sync-test", "run")
}
