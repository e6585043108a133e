//! Common test utilities for issuemirror-connector integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Once;

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use issuemirror_connector::{
    ChangeQuery, ConnectorError, ConnectorResult, RecordPage, RecordSource, ResponseMetadata,
    UpstreamRecord,
};
use issuemirror_core::{CallContext, UpstreamError};
use tokio::sync::Mutex;

static INIT: Once = Once::new();

/// Initializes test logging once per test binary.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .try_init();
    });
}

/// Test data factory for upstream records.
pub fn create_test_record(n: u32) -> UpstreamRecord {
    let updated = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(i64::from(n));
    UpstreamRecord::new(format!("PROJ-{n}"), format!("Issue number {n}"))
        .with_status("Open")
        .with_priority("Medium")
        .with_updated_at(updated)
}

pub fn create_test_records(count: u32) -> Vec<UpstreamRecord> {
    (1..=count).map(create_test_record).collect()
}

/// In-memory record source with scripted failures.
#[derive(Default)]
pub struct FakeRecordSource {
    records: Vec<UpstreamRecord>,
    failures: Mutex<VecDeque<UpstreamError>>,
    page_metadata: Option<ResponseMetadata>,
    /// Overrides the reported total, e.g. to simulate a shrinking result set.
    reported_total: Option<u64>,
    pub searches: AtomicU32,
    pub gets: AtomicU32,
}

impl FakeRecordSource {
    pub fn new(records: Vec<UpstreamRecord>) -> Self {
        Self {
            records,
            ..Self::default()
        }
    }

    /// The next calls fail with these errors, in order.
    pub fn failing_with(mut self, failures: impl IntoIterator<Item = UpstreamError>) -> Self {
        self.failures = Mutex::new(failures.into_iter().collect());
        self
    }

    pub fn with_page_metadata(mut self, metadata: ResponseMetadata) -> Self {
        self.page_metadata = Some(metadata);
        self
    }

    pub fn reporting_total(mut self, total: u64) -> Self {
        self.reported_total = Some(total);
        self
    }

    pub fn search_count(&self) -> u32 {
        self.searches.load(Ordering::SeqCst)
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
        self.next_failure().await?;

        let matching: Vec<&UpstreamRecord> = self
            .records
            .iter()
            .filter(|r| match (query.updated_since, r.updated_at) {
                (Some(since), Some(updated)) => updated > since,
                _ => true,
            })
            .collect();
        let total = self.reported_total.unwrap_or(matching.len() as u64);
        let page = matching
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .cloned()
            .collect();

        let mut page = RecordPage::new(page, total);
        if let Some(meta) = &self.page_metadata {
            page = page.with_metadata(meta.clone());
        }
        Ok(page)
    }

    async fn get_record(&self, _ctx: &CallContext, key: &str) -> ConnectorResult<UpstreamRecord> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.next_failure().await?;

        self.records
            .iter()
            .find(|r| r.key == key)
            .cloned()
            .ok_or_else(|| ConnectorError::Upstream(UpstreamError::status(404, format!("issue {key} does not exist"))))
    }
}
