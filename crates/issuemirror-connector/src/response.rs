//! Rate-limit metadata reported by the upstream.
//!
//! Trackers advertise their quota through `X-RateLimit-*` headers and answer
//! `429 Too Many Requests` with an optional `Retry-After`. Sources extract
//! those into [`ResponseMetadata`] so the rate limiter can honour them.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};

pub const RATE_LIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub const RATE_LIMIT_RESET: &str = "x-ratelimit-reset";

/// Values below this are treated as delta seconds rather than epoch seconds.
const EPOCH_THRESHOLD: i64 = 1_000_000_000;

/// Quota information extracted from one upstream response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseMetadata {
    pub status: u16,
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    pub reset_at: Option<DateTime<Utc>>,
    pub retry_after: Option<Duration>,
}

impl ResponseMetadata {
    /// Metadata for a successful response with no quota headers.
    pub fn ok() -> Self {
        Self {
            status: 200,
            ..Self::default()
        }
    }

    /// Metadata for a 429 response.
    pub fn too_many_requests(retry_after: Option<Duration>) -> Self {
        Self {
            status: 429,
            retry_after,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_quota(mut self, limit: u64, remaining: u64, reset_at: DateTime<Utc>) -> Self {
        self.limit = Some(limit);
        self.remaining = Some(remaining);
        self.reset_at = Some(reset_at);
        self
    }

    /// Extracts quota headers from a response.
    pub fn from_headers(status: u16, headers: &HeaderMap) -> Self {
        Self::from_headers_at(status, headers, Utc::now())
    }

    fn from_headers_at(status: u16, headers: &HeaderMap, now: DateTime<Utc>) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
        };

        Self {
            status,
            limit: header(RATE_LIMIT_LIMIT).and_then(|v| v.parse().ok()),
            remaining: header(RATE_LIMIT_REMAINING).and_then(|v| v.parse().ok()),
            reset_at: header(RATE_LIMIT_RESET).and_then(|v| parse_reset(v, now)),
            retry_after: header(RETRY_AFTER.as_str()).and_then(|v| parse_retry_after(v, now)),
        }
    }

    pub fn is_too_many_requests(&self) -> bool {
        self.status == 429
    }

    /// Whether the upstream reported an exhausted quota.
    pub fn quota_exhausted(&self) -> bool {
        self.is_too_many_requests() || self.remaining == Some(0)
    }
}

/// Parses `X-RateLimit-Reset`: epoch seconds, delta seconds or RFC 3339.
fn parse_reset(value: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Ok(secs) = value.parse::<i64>() {
        if secs >= EPOCH_THRESHOLD {
            return Utc.timestamp_opt(secs, 0).single();
        }
        return Some(now + chrono::Duration::seconds(secs.max(0)));
    }
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parses `Retry-After`: delta seconds or an HTTP date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_parses_quota_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from_static("100"));
        headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from_static("0"));
        headers.insert(RATE_LIMIT_RESET, HeaderValue::from_static("1709294460"));

        let meta = ResponseMetadata::from_headers_at(200, &headers, now());
        assert_eq!(meta.limit, Some(100));
        assert_eq!(meta.remaining, Some(0));
        assert_eq!(meta.reset_at, Utc.timestamp_opt(1_709_294_460, 0).single());
        assert!(meta.quota_exhausted());
        assert!(!meta.is_too_many_requests());
    }

    #[test]
    fn test_reset_as_delta_and_rfc3339() {
        assert_eq!(
            parse_reset("30", now()),
            Some(now() + chrono::Duration::seconds(30))
        );
        assert_eq!(
            parse_reset("2024-03-01T12:05:00Z", now()),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 5, 0).unwrap())
        );
        assert_eq!(parse_reset("soon", now()), None);
    }

    #[test]
    fn test_retry_after_seconds_and_http_date() {
        assert_eq!(parse_retry_after("7", now()), Some(Duration::from_secs(7)));
        assert_eq!(
            parse_retry_after("Fri, 01 Mar 2024 12:00:10 GMT", now()),
            Some(Duration::from_secs(10))
        );
        // Dates in the past mean "retry now".
        assert_eq!(
            parse_retry_after("Fri, 01 Mar 2024 11:00:00 GMT", now()),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn test_429_with_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("2"));
        let meta = ResponseMetadata::from_headers_at(429, &headers, now());
        assert!(meta.is_too_many_requests());
        assert_eq!(meta.retry_after, Some(Duration::from_secs(2)));
        assert_eq!(meta.remaining, None);
    }
}
