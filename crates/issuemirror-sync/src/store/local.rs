use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{commit_id, CommitInfo, FileStore};
use crate::error::{SyncError, SyncResult};

const META_DIR: &str = ".issuemirror";
const COMMIT_LOG: &str = "commits.jsonl";

#[derive(Debug)]
struct PendingFile {
    /// Content before the first stage since the last commit.
    original: Option<String>,
    content: String,
}

#[derive(Debug, Default)]
struct State {
    pending: BTreeMap<String, PendingFile>,
    head: Option<String>,
    pushes: u32,
    pulls: u32,
}

/// File store backed by a local directory.
///
/// Staged files are written straight into the working tree. Commits are
/// recorded as JSON lines in `.issuemirror/commits.jsonl` under the root.
/// There is no remote, so push and pull only count calls.
#[derive(Debug)]
pub struct LocalFileStore {
    root: PathBuf,
    state: Mutex<State>,
}

impl LocalFileStore {
    /// Opens (or creates) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> SyncResult<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(META_DIR)).await?;

        let head = read_log(&root)
            .await?
            .last()
            .map(|commit| commit.id.clone());
        info!(root = %root.display(), head = ?head, "Opened local file store");

        Ok(Self {
            root,
            state: Mutex::new(State {
                head,
                ..State::default()
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Commit log, oldest first.
    pub async fn commits(&self) -> SyncResult<Vec<CommitInfo>> {
        read_log(&self.root).await
    }

    pub async fn head(&self) -> Option<String> {
        self.state.lock().await.head.clone()
    }

    pub async fn push_count(&self) -> u32 {
        self.state.lock().await.pushes
    }

    fn resolve(&self, path: &str) -> SyncResult<PathBuf> {
        let relative = Path::new(path);
        let valid = !path.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
            && !relative.starts_with(META_DIR);
        if !valid {
            return Err(SyncError::store(format!("invalid store path: {path:?}")));
        }
        Ok(self.root.join(relative))
    }
}

async fn read_optional(path: &Path) -> SyncResult<Option<String>> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn read_log(root: &Path) -> SyncResult<Vec<CommitInfo>> {
    let Some(raw) = read_optional(&root.join(META_DIR).join(COMMIT_LOG)).await? else {
        return Ok(Vec::new());
    };
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(SyncError::from))
        .collect()
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn stage_file(&self, path: &str, content: &str) -> SyncResult<bool> {
        let full = self.resolve(path)?;
        let mut state = self.state.lock().await;

        let current = read_optional(&full).await?;
        if current.as_deref() == Some(content) {
            return Ok(false);
        }

        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&full, content).await?;

        let original = match state.pending.remove(path) {
            Some(pending) => pending.original,
            None => current,
        };
        if original.as_deref() != Some(content) {
            state.pending.insert(
                path.to_string(),
                PendingFile {
                    original,
                    content: content.to_string(),
                },
            );
        }

        debug!(path, "Staged file");
        Ok(true)
    }

    async fn has_staged_changes(&self) -> SyncResult<bool> {
        Ok(!self.state.lock().await.pending.is_empty())
    }

    async fn file_exists(&self, path: &str) -> SyncResult<bool> {
        let full = self.resolve(path)?;
        Ok(fs::try_exists(full).await?)
    }

    async fn commit(&self, message: &str, author: &str) -> SyncResult<String> {
        let mut state = self.state.lock().await;
        if state.pending.is_empty() {
            return Err(SyncError::commit("nothing to commit"));
        }

        let parent = state.head.clone();
        let id = commit_id(
            parent.as_deref(),
            message,
            author,
            state
                .pending
                .iter()
                .map(|(path, file)| (path.as_str(), file.content.as_str())),
        );
        let info = CommitInfo {
            id: id.clone(),
            parent,
            message: message.to_string(),
            author: author.to_string(),
            files: state.pending.keys().cloned().collect(),
            timestamp: Utc::now(),
        };

        let log_path = self.root.join(META_DIR).join(COMMIT_LOG);
        let mut log = read_optional(&log_path).await?.unwrap_or_default();
        log.push_str(&serde_json::to_string(&info)?);
        log.push('\n');
        fs::write(&log_path, log)
            .await
            .map_err(|e| SyncError::commit(format!("failed to write commit log: {e}")))?;

        state.pending.clear();
        state.head = Some(id.clone());
        info!(commit = %id, files = info.files.len(), "Committed staged files");
        Ok(id)
    }

    async fn push(&self) -> SyncResult<()> {
        self.state.lock().await.pushes += 1;
        Ok(())
    }

    async fn pull(&self) -> SyncResult<()> {
        self.state.lock().await.pulls += 1;
        Ok(())
    }
}
