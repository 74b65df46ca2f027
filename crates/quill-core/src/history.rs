//! Bounded execution history kept in a JSON file, newest last on disk.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

use crate::types::ExecutionRecord;

pub const DEFAULT_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Default, Serialize, Deserialize)]
struct HistoryFile {
    #[serde(default)]
    executions: Vec<ExecutionRecord>,
}

pub struct ExecutionHistory {
    path: PathBuf,
    limit: usize,
    // Serializes read-modify-write of the file within this process.
    lock: Mutex<()>,
}

impl ExecutionHistory {
    pub fn new(path: impl Into<PathBuf>, limit: usize) -> Self {
        Self {
            path: path.into(),
            limit: limit.max(1),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> HistoryFile {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(path = %self.path.display(), "corrupt history file, starting empty: {e}");
                HistoryFile::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HistoryFile::default(),
            Err(e) => {
                warn!(path = %self.path.display(), "read history: {e}");
                HistoryFile::default()
            }
        }
    }

    /// Append one record, dropping the oldest beyond the limit.
    pub async fn append(&self, record: ExecutionRecord) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut file = self.read().await;
        file.executions.push(record);
        let excess = file.executions.len().saturating_sub(self.limit);
        file.executions.drain(..excess);

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("create {}", dir.display()))?;
        }
        let json = serde_json::to_string_pretty(&file).context("serialize history")?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("rename into {}", self.path.display()))?;
        Ok(())
    }

    /// Like [`append`](Self::append) but failures are only logged.
    pub async fn record(&self, record: ExecutionRecord) {
        let job = record.job_name.clone();
        if let Err(e) = self.append(record).await {
            warn!(job = %job, "failed to record execution history: {e:#}");
        }
    }

    /// Up to `n` records, newest first.
    pub async fn recent(&self, n: usize) -> Vec<ExecutionRecord> {
        let file = self.read().await;
        file.executions.into_iter().rev().take(n).collect()
    }
}
