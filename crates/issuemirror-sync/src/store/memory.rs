use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;

use super::{commit_id, CommitInfo, FileStore};
use crate::error::{SyncError, SyncResult};

#[derive(Debug, Default)]
struct State {
    committed: BTreeMap<String, String>,
    staged: BTreeMap<String, String>,
    history: Vec<CommitInfo>,
    pushed: usize,
    pulls: u32,
}

/// File store held entirely in memory.
///
/// Behaves like a repository with a single branch and a remote that accepts
/// every push. Useful for tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryFileStore {
    state: RwLock<State>,
}

impl InMemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed content of `path`.
    pub async fn committed_content(&self, path: &str) -> Option<String> {
        self.state.read().await.committed.get(path).cloned()
    }

    /// Paths in the committed tree, sorted.
    pub async fn committed_paths(&self) -> Vec<String> {
        self.state.read().await.committed.keys().cloned().collect()
    }

    pub async fn staged_paths(&self) -> Vec<String> {
        self.state.read().await.staged.keys().cloned().collect()
    }

    /// Commit log, oldest first.
    pub async fn commits(&self) -> Vec<CommitInfo> {
        self.state.read().await.history.clone()
    }

    pub async fn head(&self) -> Option<String> {
        self.state.read().await.history.last().map(|c| c.id.clone())
    }

    /// Commits not yet pushed.
    pub async fn unpushed_commits(&self) -> usize {
        let state = self.state.read().await;
        state.history.len() - state.pushed
    }

    pub async fn pull_count(&self) -> u32 {
        self.state.read().await.pulls
    }
}

#[async_trait]
impl FileStore for InMemoryFileStore {
    async fn stage_file(&self, path: &str, content: &str) -> SyncResult<bool> {
        let mut state = self.state.write().await;

        if state.committed.get(path).map(String::as_str) == Some(content) {
            // Back to the committed content: nothing left to stage.
            return Ok(state.staged.remove(path).is_some());
        }
        if state.staged.get(path).map(String::as_str) == Some(content) {
            return Ok(false);
        }
        state.staged.insert(path.to_string(), content.to_string());
        Ok(true)
    }

    async fn has_staged_changes(&self) -> SyncResult<bool> {
        Ok(!self.state.read().await.staged.is_empty())
    }

    async fn file_exists(&self, path: &str) -> SyncResult<bool> {
        let state = self.state.read().await;
        Ok(state.committed.contains_key(path) || state.staged.contains_key(path))
    }

    async fn commit(&self, message: &str, author: &str) -> SyncResult<String> {
        let mut state = self.state.write().await;
        if state.staged.is_empty() {
            return Err(SyncError::commit("nothing to commit"));
        }

        let parent = state.history.last().map(|c| c.id.clone());
        let id = commit_id(
            parent.as_deref(),
            message,
            author,
            state.staged.iter().map(|(p, c)| (p.as_str(), c.as_str())),
        );

        let staged = std::mem::take(&mut state.staged);
        let files: Vec<String> = staged.keys().cloned().collect();
        state.committed.extend(staged);
        state.history.push(CommitInfo {
            id: id.clone(),
            parent,
            message: message.to_string(),
            author: author.to_string(),
            files,
            timestamp: Utc::now(),
        });

        debug!(commit = %id, "Committed staged files");
        Ok(id)
    }

    async fn push(&self) -> SyncResult<()> {
        let mut state = self.state.write().await;
        state.pushed = state.history.len();
        Ok(())
    }

    async fn pull(&self) -> SyncResult<()> {
        self.state.write().await.pulls += 1;
        Ok(())
    }
}
