//! JSON file backing for the task queue.
//!
//! The document is always read and written whole: `{ "tasks": [...],
//! "lastUpdated": "..." }`. Read failures degrade to an empty list so a
//! fresh or damaged data directory never blocks startup.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, warn};

use crate::types::TaskList;

#[derive(Debug, Clone)]
pub struct TaskStore {
    path: PathBuf,
}

impl TaskStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the task list. Missing, unreadable or corrupt files yield an empty list.
    pub async fn load(&self) -> TaskList {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "task store not found, starting empty");
                return TaskList::default();
            }
            Err(e) => {
                warn!(path = %self.path.display(), "task store unreadable, starting empty: {e}");
                return TaskList::default();
            }
        };
        match serde_json::from_str::<TaskList>(&raw) {
            Ok(list) => list,
            Err(e) => {
                warn!(path = %self.path.display(), "task store corrupt, starting empty: {e}");
                TaskList::default()
            }
        }
    }

    /// Stamp `last_updated` and write the whole document. Last writer wins.
    pub async fn save(&self, list: &mut TaskList) -> Result<()> {
        list.last_updated = Some(Utc::now());
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create task store dir {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(list).context("serialize task list")?;

        // Write-then-rename: readers never observe a partial document.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("rename {} -> {}", tmp.display(), self.path.display()))?;
        Ok(())
    }
}
