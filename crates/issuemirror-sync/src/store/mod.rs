//! Durable file/version store.
//!
//! The engine stages rendered files, commits them in batches and pushes the
//! result. Implementations must make staging idempotent: staging a path
//! with the content it already has produces no change.

mod local;
mod memory;

pub use local::LocalFileStore;
pub use memory::InMemoryFileStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::SyncResult;

/// Versioned file store the mirror is written to.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Stages `content` at `path`. Returns whether anything changed.
    async fn stage_file(&self, path: &str, content: &str) -> SyncResult<bool>;

    /// Whether staged changes are waiting for a commit.
    async fn has_staged_changes(&self) -> SyncResult<bool>;

    /// Whether `path` exists, committed or staged.
    async fn file_exists(&self, path: &str) -> SyncResult<bool>;

    /// Commits every staged change and returns the commit id.
    async fn commit(&self, message: &str, author: &str) -> SyncResult<String>;

    async fn push(&self) -> SyncResult<()>;

    async fn pull(&self) -> SyncResult<()>;
}

/// One entry of the commit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub id: String,
    pub parent: Option<String>,
    pub message: String,
    pub author: String,
    pub files: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Derives a commit id from its parent, message, author and staged entries.
///
/// Entries must be supplied in path order.
pub(crate) fn commit_id<'a>(
    parent: Option<&str>,
    message: &str,
    author: &str,
    entries: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parent.unwrap_or_default().as_bytes());
    hasher.update(b"\n");
    hasher.update(author.as_bytes());
    hasher.update(b"\n");
    hasher.update(message.as_bytes());
    hasher.update(b"\n");
    for (path, content) in entries {
        hasher.update(path.as_bytes());
        hasher.update(b"\0");
        hasher.update(content.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_id_depends_on_every_input() {
        let base = commit_id(None, "msg", "bot", [("a.md", "x")]);
        assert_eq!(base, commit_id(None, "msg", "bot", [("a.md", "x")]));
        assert_ne!(base, commit_id(Some("p"), "msg", "bot", [("a.md", "x")]));
        assert_ne!(base, commit_id(None, "other", "bot", [("a.md", "x")]));
        assert_ne!(base, commit_id(None, "msg", "bot", [("a.md", "y")]));
        assert_eq!(base.len(), 64);
    }
}
