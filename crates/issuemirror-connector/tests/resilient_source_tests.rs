//! Integration tests for the resilient record source.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use common::*;
use issuemirror_connector::{
    ChangeQuery, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState, ConnectorError,
    RateLimitConfig, RateLimiter, ResilientSource, ResponseMetadata, RetryConfig, RetryExecutor,
};
use issuemirror_core::{CallContext, ErrorType, UpstreamError};

fn resilient(source: FakeRecordSource) -> ResilientSource<FakeRecordSource> {
    let limiter = Arc::new(RateLimiter::new(RateLimitConfig::for_testing()).unwrap());
    let breaker = Arc::new(CircuitBreaker::new(
        "tracker",
        CircuitBreakerConfig::for_testing(),
    ));
    let executor = RetryExecutor::new(RetryConfig::for_testing())
        .unwrap()
        .with_rate_limiter(limiter)
        .with_circuit_breaker(breaker);
    ResilientSource::new(source, executor)
}

fn ctx() -> CallContext {
    CallContext::new("engine", "fetch")
}

/// Tests that pagination collects every record across pages.
#[tokio::test(start_paused = true)]
async fn test_fetch_all_pages() {
    init_test_logging();
    let source = resilient(FakeRecordSource::new(create_test_records(25)));

    let records = source
        .fetch_all_changed(&ctx(), &ChangeQuery::new("PROJ"), 10)
        .await
        .unwrap();

    assert_eq!(records.len(), 25);
    assert_eq!(records[0].key, "PROJ-1");
    assert_eq!(records[24].key, "PROJ-25");
    assert_eq!(source.inner().search_count(), 3);
}

/// Tests that an empty page ends pagination even if the total claims more.
#[tokio::test(start_paused = true)]
async fn test_empty_page_stops_pagination() {
    let source = resilient(FakeRecordSource::new(create_test_records(5)).reporting_total(100));

    let records = source
        .fetch_all_changed(&ctx(), &ChangeQuery::new("PROJ"), 4)
        .await
        .unwrap();

    assert_eq!(records.len(), 5);
    // Two data pages, then the empty one.
    assert_eq!(source.inner().search_count(), 3);
}

/// Tests that the checkpoint restricts the query.
#[tokio::test(start_paused = true)]
async fn test_updated_since_filters_records() {
    let source = resilient(FakeRecordSource::new(create_test_records(10)));
    let since = Utc.with_ymd_and_hms(2024, 1, 1, 0, 7, 0).unwrap();

    let records = source
        .fetch_all_changed(&ctx(), &ChangeQuery::new("PROJ").updated_since(since), 50)
        .await
        .unwrap();

    let keys: Vec<_> = records.iter().map(|r| r.key.as_str()).collect();
    assert_eq!(keys, vec!["PROJ-8", "PROJ-9", "PROJ-10"]);
}

/// Tests that transient failures are retried transparently.
#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried() {
    let source = resilient(
        FakeRecordSource::new(create_test_records(3)).failing_with([
            UpstreamError::status(503, "unavailable"),
            UpstreamError::too_many_requests(Some(Duration::from_millis(50))),
        ]),
    );

    let records = source
        .fetch_all_changed(&ctx(), &ChangeQuery::new("PROJ"), 10)
        .await
        .unwrap();

    assert_eq!(records.len(), 3);
    assert_eq!(source.inner().search_count(), 3);

    let limiter = source.executor().rate_limiter().unwrap();
    let metrics = limiter.metrics().await;
    assert_eq!(metrics.backoff_retries, 2);
    assert!(metrics.server_limit_hits >= 1);
}

/// Tests that a missing record is not retried.
#[tokio::test(start_paused = true)]
async fn test_get_missing_record_is_not_found() {
    let source = resilient(FakeRecordSource::new(create_test_records(1)));

    let err = source.get_record(&ctx(), "PROJ-404").await.unwrap_err();
    assert_eq!(err.error_type(), Some(ErrorType::NotFound));
    assert_eq!(source.inner().gets.load(std::sync::atomic::Ordering::SeqCst), 1);

    let found = source.get_record(&ctx(), "PROJ-1").await.unwrap();
    assert_eq!(found.summary, "Issue number 1");
}

/// Tests that a persistently failing upstream opens the circuit.
#[tokio::test(start_paused = true)]
async fn test_sustained_outage_opens_circuit() {
    let outage = (0..10).map(|_| UpstreamError::connection("connection refused"));
    let source = resilient(FakeRecordSource::new(create_test_records(1)).failing_with(outage));

    let err = source
        .search_page(&ctx(), &ChangeQuery::new("PROJ"), 0, 10)
        .await
        .unwrap_err();

    assert!(matches!(err, ConnectorError::CircuitOpen { .. }));
    let breaker = source.executor().circuit_breaker().unwrap();
    assert_eq!(breaker.state().await, CircuitBreakerState::Open);
    // CircuitBreakerConfig::for_testing trips after 3 failures.
    assert_eq!(source.inner().search_count(), 3);
}

/// Tests that quota headers on a page reach the limiter.
#[tokio::test(start_paused = true)]
async fn test_page_metadata_feeds_limiter() {
    let reset = Utc::now() + chrono::Duration::seconds(30);
    let source = resilient(
        FakeRecordSource::new(create_test_records(2))
            .with_page_metadata(ResponseMetadata::ok().with_quota(100, 42, reset)),
    );

    source
        .search_page(&ctx(), &ChangeQuery::new("PROJ"), 0, 10)
        .await
        .unwrap();

    let quota = source.executor().rate_limiter().unwrap().server_quota().await;
    assert_eq!(quota.limit, Some(100));
    assert_eq!(quota.remaining, Some(42));
}

/// Tests that a cancelled context stops pagination.
#[tokio::test(start_paused = true)]
async fn test_cancelled_fetch() {
    let source = resilient(FakeRecordSource::new(create_test_records(3)));
    let ctx = ctx();
    ctx.cancel();

    let err = source
        .fetch_all_changed(&ctx, &ChangeQuery::new("PROJ"), 10)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(source.inner().search_count(), 0);
}
