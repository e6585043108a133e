//! Upstream record source.
//!
//! The engine never talks to a tracker directly; it goes through a
//! [`RecordSource`] wrapped in a [`ResilientSource`], which applies rate
//! limiting, circuit breaking and classified retries to every call.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use issuemirror_core::CallContext;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::ConnectorResult;
use crate::response::ResponseMetadata;
use crate::retry::RetryExecutor;

/// One issue as reported by the upstream tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamRecord {
    pub key: String,
    /// Key the record had before being moved, if it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_key: Option<String>,
    pub summary: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub issue_type: Option<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub reporter: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    /// Upstream reports the record as deleted.
    #[serde(default)]
    pub deleted: bool,
    /// Remaining upstream fields, rendered after the well-known ones.
    #[serde(default)]
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl UpstreamRecord {
    pub fn new(key: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            previous_key: None,
            summary: summary.into(),
            description: None,
            status: None,
            priority: None,
            issue_type: None,
            assignee: None,
            reporter: None,
            labels: Vec::new(),
            created_at: None,
            updated_at: None,
            deleted: false,
            fields: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: impl Into<String>) -> Self {
        self.priority = Some(priority.into());
        self
    }

    #[must_use]
    pub fn with_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = Some(updated_at);
        self
    }

    #[must_use]
    pub fn with_previous_key(mut self, previous_key: impl Into<String>) -> Self {
        self.previous_key = Some(previous_key.into());
        self
    }

    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn mark_deleted(mut self) -> Self {
        self.deleted = true;
        self
    }
}

/// One page of search results.
#[derive(Debug, Clone, Default)]
pub struct RecordPage {
    pub records: Vec<UpstreamRecord>,
    /// Total matches across all pages.
    pub total: u64,
    /// Quota headers of the response that produced this page.
    pub metadata: Option<ResponseMetadata>,
}

impl RecordPage {
    pub fn new(records: Vec<UpstreamRecord>, total: u64) -> Self {
        Self {
            records,
            total,
            metadata: None,
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: ResponseMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Which records to fetch.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChangeQuery {
    /// Upstream project key.
    pub target: String,
    /// Only records updated after this instant.
    #[serde(default)]
    pub updated_since: Option<DateTime<Utc>>,
    /// Filter expression passed to the upstream verbatim.
    #[serde(default)]
    pub filter: Option<String>,
}

impl ChangeQuery {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            updated_since: None,
            filter: None,
        }
    }

    #[must_use]
    pub fn updated_since(mut self, since: DateTime<Utc>) -> Self {
        self.updated_since = Some(since);
        self
    }

    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }
}

impl fmt::Display for ChangeQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "project = \"{}\"", self.target)?;
        if let Some(since) = self.updated_since {
            write!(f, " AND updated >= \"{}\"", since.format("%Y-%m-%d %H:%M"))?;
        }
        if let Some(filter) = &self.filter {
            write!(f, " AND ({filter})")?;
        }
        f.write_str(" ORDER BY updated ASC")
    }
}

/// Read access to the upstream tracker.
///
/// Failures should be reported as `ConnectorError::Upstream` so the
/// classifier can see status codes and retry hints.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn search_changed_records(
        &self,
        ctx: &CallContext,
        query: &ChangeQuery,
        offset: u64,
        limit: u64,
    ) -> ConnectorResult<RecordPage>;

    async fn get_record(&self, ctx: &CallContext, key: &str) -> ConnectorResult<UpstreamRecord>;
}

#[async_trait]
impl<S: RecordSource + ?Sized> RecordSource for Arc<S> {
    async fn search_changed_records(
        &self,
        ctx: &CallContext,
        query: &ChangeQuery,
        offset: u64,
        limit: u64,
    ) -> ConnectorResult<RecordPage> {
        (**self)
            .search_changed_records(ctx, query, offset, limit)
            .await
    }

    async fn get_record(&self, ctx: &CallContext, key: &str) -> ConnectorResult<UpstreamRecord> {
        (**self).get_record(ctx, key).await
    }
}

/// Refreshes upstream credentials after an authentication failure.
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    async fn refresh_credentials(&self, ctx: &CallContext) -> ConnectorResult<()>;
}

/// Record source with upstream protection applied to every call.
#[derive(Debug)]
pub struct ResilientSource<S> {
    inner: S,
    executor: RetryExecutor,
}

impl<S: RecordSource> ResilientSource<S> {
    pub fn new(inner: S, executor: RetryExecutor) -> Self {
        Self { inner, executor }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn executor(&self) -> &RetryExecutor {
        &self.executor
    }

    /// Fetches one page and feeds its quota headers to the rate limiter.
    #[instrument(skip(self, ctx, query), fields(target = %query.target))]
    pub async fn search_page(
        &self,
        ctx: &CallContext,
        query: &ChangeQuery,
        offset: u64,
        limit: u64,
    ) -> ConnectorResult<RecordPage> {
        let ctx = ctx.for_component("upstream", "search_changed_records");
        let page = self
            .executor
            .execute(&ctx, || {
                self.inner.search_changed_records(&ctx, query, offset, limit)
            })
            .await?;

        if let (Some(meta), Some(limiter)) = (&page.metadata, self.executor.rate_limiter()) {
            limiter.handle_response(meta).await;
        }
        Ok(page)
    }

    #[instrument(skip(self, ctx))]
    pub async fn get_record(&self, ctx: &CallContext, key: &str) -> ConnectorResult<UpstreamRecord> {
        let ctx = ctx.for_component("upstream", "get_record");
        self.executor
            .execute(&ctx, || self.inner.get_record(&ctx, key))
            .await
    }

    /// Pages through every record matching `query`.
    ///
    /// Stops when the reported total is reached or a page comes back empty,
    /// checking cancellation between pages.
    #[instrument(skip(self, ctx, query), fields(target = %query.target))]
    pub async fn fetch_all_changed(
        &self,
        ctx: &CallContext,
        query: &ChangeQuery,
        page_size: u64,
    ) -> ConnectorResult<Vec<UpstreamRecord>> {
        let page_size = page_size.max(1);
        let mut offset = 0u64;
        let mut records = Vec::new();

        loop {
            ctx.check_cancelled()?;
            let page = self.search_page(ctx, query, offset, page_size).await?;
            let fetched = page.records.len() as u64;
            offset += fetched;
            records.extend(page.records);

            debug!(fetched, offset, total = page.total, "Fetched page of changed records");

            if fetched == 0 || offset >= page.total {
                break;
            }
        }

        Ok(records)
    }
}
