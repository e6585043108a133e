//! Priority scoring for operations. Higher scores are processed sooner.

use chrono::{DateTime, Duration, Utc};
use issuemirror_connector::UpstreamRecord;

use crate::operation::SyncOperation;

/// Boost for records updated within the last day.
pub const RECENT_DAY_BOOST: i64 = 50;
/// Boost for records updated within the last week.
pub const RECENT_WEEK_BOOST: i64 = 20;

/// Base weight of an upstream priority name.
#[must_use]
pub fn priority_weight(priority: Option<&str>) -> i64 {
    let Some(name) = priority else {
        return 0;
    };
    match name.trim().to_lowercase().as_str() {
        "highest" | "blocker" | "critical" => 100,
        "high" | "major" => 75,
        "medium" | "normal" => 50,
        "low" | "minor" => 25,
        "lowest" | "trivial" => 10,
        _ => 0,
    }
}

/// Scores `record` as of `now`.
#[must_use]
pub fn priority_score(record: &UpstreamRecord, now: DateTime<Utc>) -> i64 {
    let recency = match record.updated_at {
        Some(updated) if now - updated <= Duration::hours(24) => RECENT_DAY_BOOST,
        Some(updated) if now - updated <= Duration::days(7) => RECENT_WEEK_BOOST,
        _ => 0,
    };
    priority_weight(record.priority.as_deref()) + recency
}

/// Sorts by descending priority. Equal priorities keep their input order.
pub fn sort_by_priority(operations: &mut [SyncOperation]) {
    operations.sort_by(|a, b| b.priority.cmp(&a.priority));
}
