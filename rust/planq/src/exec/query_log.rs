//! Append-only JSONL audit of executed statements.

use super::ExecutionMeta;
use crate::error::Result;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

pub const QUERY_LOG_FILE: &str = "query_logs.jsonl";
pub const DEFAULT_RECENT: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryLogEntry {
    pub ts: DateTime<Utc>,
    pub sql: String,
    #[serde(flatten)]
    pub meta: ExecutionMeta,
}

pub struct QueryLog {
    path: PathBuf,
    append_lock: Mutex<()>,
}

impl QueryLog {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create log directory {}", dir.display()))?;
        Ok(Self {
            path: dir.join(QUERY_LOG_FILE),
            append_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, sql: &str, meta: &ExecutionMeta) -> Result<()> {
        let entry = QueryLogEntry {
            ts: Utc::now(),
            sql: sql.to_string(),
            meta: meta.clone(),
        };
        let mut line = serde_json::to_vec(&entry).context("failed to serialize query log entry")?;
        line.push(b'\n');

        let _guard = self.append_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        file.write_all(&line)
            .await
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        Ok(())
    }

    /// The last `limit` readable entries, oldest first. Malformed lines are
    /// skipped.
    pub async fn read_recent(&self, limit: usize) -> Result<Vec<QueryLogEntry>> {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("failed to read {}", self.path.display()))
                    .into())
            }
        };

        let lines: Vec<&str> = data.lines().filter(|line| !line.trim().is_empty()).collect();
        let skip = lines.len().saturating_sub(limit);
        Ok(lines[skip..]
            .iter()
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(entry) => Some(entry),
                Err(err) => {
                    warn!(error = %err, "skipping malformed query log line");
                    None
                }
            })
            .collect())
    }
}
