//! Rendering upstream records into mirrored files.
//!
//! Output is a `---` delimited header of `key: value` lines in a fixed order,
//! then a blank line and the description. Rendering is deterministic:
//! identical records always produce byte-identical files, which is what makes
//! re-staging idempotent.

use std::fmt::Write as _;

use chrono::{DateTime, SecondsFormat, Utc};
use issuemirror_connector::UpstreamRecord;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// File extension of mirrored records.
pub const FILE_EXTENSION: &str = "md";

/// A file ready to be staged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedFile {
    pub path: String,
    pub content: String,
}

impl RenderedFile {
    /// SHA-256 of the content, hex encoded.
    #[must_use]
    pub fn digest(&self) -> String {
        content_digest(&self.content)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.content.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

/// SHA-256 of `content`, hex encoded.
#[must_use]
pub fn content_digest(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Replaces every character outside `[A-Za-z0-9._-]` with `_`.
#[must_use]
pub fn sanitize_component(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    // Never produce "." or ".." as a path component.
    if sanitized.chars().all(|c| c == '.') {
        sanitized.replace('.', "_")
    } else {
        sanitized
    }
}

/// Path of the mirrored file for `key` under `target`.
#[must_use]
pub fn target_path(target: &str, key: &str) -> String {
    format!(
        "{}/{}.{FILE_EXTENSION}",
        sanitize_component(target),
        sanitize_component(key)
    )
}

/// Renders `record` for the mirror of `target`.
#[must_use]
pub fn render_record(target: &str, record: &UpstreamRecord) -> RenderedFile {
    let mut header = Header::default();
    header.push("key", &record.key);
    header.push("summary", &record.summary);
    header.push_opt("status", record.status.as_deref());
    header.push_opt("priority", record.priority.as_deref());
    header.push_opt("type", record.issue_type.as_deref());
    header.push_opt("assignee", record.assignee.as_deref());
    header.push_opt("reporter", record.reporter.as_deref());
    if !record.labels.is_empty() {
        header.push("labels", &record.labels.join(", "));
    }
    header.push_opt("created", record.created_at.map(format_time).as_deref());
    header.push_opt("updated", record.updated_at.map(format_time).as_deref());
    for (name, value) in &record.fields {
        let value = match value {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => continue,
            other => other.to_string(),
        };
        header.push(name, &value);
    }

    let mut content = header.finish();
    if let Some(description) = record.description.as_deref().map(str::trim_end) {
        if !description.is_empty() {
            content.push('\n');
            content.push_str(description);
            content.push('\n');
        }
    }

    RenderedFile {
        path: target_path(target, &record.key),
        content,
    }
}

/// Renders the tombstone that replaces a record deleted upstream.
#[must_use]
pub fn render_tombstone(target: &str, key: &str, deleted_at: Option<DateTime<Utc>>) -> RenderedFile {
    let mut header = Header::default();
    header.push("key", key);
    header.push("status", "deleted");
    header.push("deleted", "true");
    header.push_opt("updated", deleted_at.map(format_time).as_deref());

    RenderedFile {
        path: target_path(target, key),
        content: header.finish(),
    }
}

fn format_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Default)]
struct Header {
    buf: String,
}

impl Header {
    fn push(&mut self, key: &str, value: &str) {
        // Header values are single-line.
        let value = value.replace(['\r', '\n'], " ");
        let _ = writeln!(self.buf, "{}: {}", key, value.trim());
    }

    fn push_opt(&mut self, key: &str, value: Option<&str>) {
        if let Some(value) = value {
            self.push(key, value);
        }
    }

    fn finish(self) -> String {
        format!("---\n{}---\n", self.buf)
    }
}
