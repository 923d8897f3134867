//! Execution and caching: content-addressed Parquet snapshots in front of a
//! pluggable query runner, registered in a local SQLite catalog.

pub mod catalog;
pub mod postgres;
pub mod query_log;
pub mod runner;
pub mod snapshot;

pub use catalog::Catalog;
pub use postgres::{PostgresRunner, SessionSettings};
pub use query_log::{QueryLog, QueryLogEntry};
pub use runner::{
    ingest, GuardFailure, GuardReport, IngestLimits, Ingested, QueryRunner, RowSource, StopReason,
};
pub use snapshot::{SnapshotInfo, SnapshotStore};

use crate::compiler::Params;
use crate::config::AppConfig;
use crate::error::{Result, ServiceError};
use crate::models::CatalogEntry;
use crate::result::ResultSet;
use crate::safety::tokenize;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::json;
use serde_with::{serde_as, DurationSecondsWithFrac};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Cache keys are hex fingerprints; anything else never names a snapshot.
fn check_key(key: &str) -> Result<&str> {
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ServiceError::InvalidRequest(format!("'{key}' is not a cache key")));
    }
    Ok(key)
}

/// SHA-256 over the statement's tokens joined by single spaces and the
/// parameters sorted by name. Whitespace inside literals is kept, and
/// parameter insertion order never changes the key.
pub fn fingerprint(sql: &str, params: &Params) -> String {
    let normalized = tokenize(sql)
        .iter()
        .map(|token| token.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    let pairs: Vec<serde_json::Value> = params
        .sorted()
        .into_iter()
        .map(|(name, value)| json!([name, value]))
        .collect();
    let payload = json!({ "sql": normalized, "params": pairs });

    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Cache,
    Source,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionMeta {
    pub fingerprint: String,
    pub cache_hit: bool,
    pub rows: usize,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub elapsed_seconds: Duration,
    pub mode: ExecutionMode,
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guards: Option<GuardReport>,
    pub snapshot_path: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CacheListing {
    #[serde(flatten)]
    pub entry: CatalogEntry,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct ClearReport {
    pub catalog_entries: usize,
    pub snapshots: usize,
}

pub struct Executor {
    runner: Option<Arc<dyn QueryRunner>>,
    snapshots: SnapshotStore,
    catalog: Arc<Catalog>,
    limits: IngestLimits,
    offline_only: bool,
    query_log: Option<QueryLog>,
}

impl Executor {
    pub fn new(
        runner: Option<Arc<dyn QueryRunner>>,
        snapshots: SnapshotStore,
        catalog: Arc<Catalog>,
        limits: IngestLimits,
        offline_only: bool,
    ) -> Self {
        Self {
            runner,
            snapshots,
            catalog,
            limits,
            offline_only,
            query_log: None,
        }
    }

    /// Records every successful execution in `log`.
    pub fn with_query_log(mut self, log: QueryLog) -> Self {
        self.query_log = Some(log);
        self
    }

    pub fn from_config(config: &AppConfig, runner: Option<Arc<dyn QueryRunner>>) -> anyhow::Result<Self> {
        let catalog = Catalog::open(&config.catalog_path)?;
        let query_log = QueryLog::new(&config.log_dir)?;
        Ok(Self::new(
            runner,
            SnapshotStore::new(&config.cache_dir),
            Arc::new(catalog),
            IngestLimits {
                max_rows: usize::try_from(config.max_returned_rows).unwrap_or(usize::MAX),
                chunk_size: config.fetch_chunk_size,
                timeout: config.statement_timeout,
            },
            config.offline_only,
        )
        .with_query_log(query_log))
    }

    pub fn max_rows(&self) -> usize {
        self.limits.max_rows
    }

    pub fn is_offline(&self) -> bool {
        self.offline_only || self.runner.is_none()
    }

    /// Serves a cached snapshot when one exists, otherwise streams from the
    /// source and caches the result. Successful executions are appended to
    /// the query log.
    pub async fn run(&self, sql: &str, params: &Params) -> Result<(ResultSet, ExecutionMeta)> {
        let (result, meta) = self.execute(sql, params).await?;
        if let Some(log) = &self.query_log {
            if let Err(err) = log.append(sql, &meta).await {
                warn!(fingerprint = %meta.fingerprint, error = %err, "failed to append query log");
            }
        }
        Ok((result, meta))
    }

    /// Most recent query log entries, oldest first.
    pub async fn recent_queries(&self, limit: usize) -> Result<Vec<QueryLogEntry>> {
        match &self.query_log {
            Some(log) => log.read_recent(limit).await,
            None => Ok(Vec::new()),
        }
    }

    async fn execute(&self, sql: &str, params: &Params) -> Result<(ResultSet, ExecutionMeta)> {
        let started = Instant::now();
        let key = fingerprint(sql, params);
        let path = self.snapshots.path_for(&key);

        if path.is_file() {
            let result = self.load_snapshot(path.clone()).await?;
            self.catalog.upsert(&key, &path)?;
            let meta = ExecutionMeta {
                fingerprint: key,
                cache_hit: true,
                rows: result.row_count(),
                elapsed_seconds: started.elapsed(),
                mode: ExecutionMode::Cache,
                truncated: false,
                stop_reason: None,
                guards: None,
                snapshot_path: path.to_string_lossy().into_owned(),
            };
            info!(fingerprint = %meta.fingerprint, rows = meta.rows, "served from cache");
            return Ok((result, meta));
        }

        let runner = match (&self.runner, self.offline_only) {
            (Some(runner), false) => runner,
            (_, true) => {
                return Err(ServiceError::Offline(format!(
                    "no cached snapshot for {key}; disable PLANQ_OFFLINE_ONLY and run the query once to populate the cache"
                )))
            }
            (None, false) => {
                return Err(ServiceError::Offline(format!(
                    "no cached snapshot for {key} and no source database is configured; set PLANQ_DATABASE_URL"
                )))
            }
        };

        let Ingested {
            result,
            truncated,
            stop_reason,
            guards,
        } = ingest(runner.as_ref(), sql, params, self.limits).await?;
        let (result, snapshot_path) = if stop_reason == Some(StopReason::Timeout) {
            warn!(fingerprint = %key, "partial result after timeout is not cached");
            (result, String::new())
        } else {
            let (result, written) = self.store_snapshot(key.clone(), result).await?;
            self.catalog.upsert(&key, &written)?;
            (result, written.to_string_lossy().into_owned())
        };

        let meta = ExecutionMeta {
            fingerprint: key,
            cache_hit: false,
            rows: result.row_count(),
            elapsed_seconds: started.elapsed(),
            mode: ExecutionMode::Source,
            truncated,
            stop_reason,
            guards,
            snapshot_path,
        };
        info!(
            fingerprint = %meta.fingerprint,
            rows = meta.rows,
            truncated = meta.truncated,
            elapsed = meta.elapsed_seconds.as_secs_f64(),
            "executed against source"
        );
        Ok((result, meta))
    }

    async fn load_snapshot(&self, path: PathBuf) -> Result<ResultSet> {
        let store = self.snapshots.clone();
        let result = tokio::task::spawn_blocking(move || store.read(&path))
            .await
            .context("snapshot reader task failed")??;
        Ok(result)
    }

    async fn store_snapshot(&self, key: String, result: ResultSet) -> Result<(ResultSet, PathBuf)> {
        let store = self.snapshots.clone();
        let written = tokio::task::spawn_blocking(move || {
            store.write(&key, &result).map(|path| (result, path))
        })
        .await
        .context("snapshot writer task failed")??;
        Ok(written)
    }

    /// Catalog entries, newest first, with on-disk snapshot sizes.
    pub fn list_cache(&self) -> Result<Vec<CacheListing>> {
        let entries = self.catalog.list()?;
        Ok(entries
            .into_iter()
            .map(|entry| {
                let size_bytes = std::fs::metadata(&entry.snapshot_path).ok().map(|m| m.len());
                CacheListing { entry, size_bytes }
            })
            .collect())
    }

    pub fn snapshots(&self) -> Result<Vec<SnapshotInfo>> {
        Ok(self.snapshots.list()?)
    }

    /// Drops one key, or everything when `key` is `None`.
    pub fn clear_cache(&self, key: Option<&str>) -> Result<ClearReport> {
        let report = match key {
            Some(key) => ClearReport {
                catalog_entries: usize::from(self.catalog.remove(check_key(key)?)?),
                snapshots: usize::from(self.snapshots.remove(key)?),
            },
            None => ClearReport {
                catalog_entries: self.catalog.clear()?,
                snapshots: self.snapshots.clear()?,
            },
        };
        info!(key = key.unwrap_or("*"), ?report, "cache cleared");
        Ok(report)
    }

    /// Reads a cached snapshot without touching the source.
    pub async fn query_cached(
        &self,
        key: &str,
        columns: &[String],
        limit: Option<usize>,
    ) -> Result<ResultSet> {
        let path = match self.catalog.get(check_key(key)?)? {
            Some(entry) => PathBuf::from(entry.snapshot_path),
            None => self.snapshots.path_for(key),
        };
        if !path.is_file() {
            return Err(ServiceError::NotFound(format!("no cached snapshot for {key}")));
        }

        let store = self.snapshots.clone();
        let columns = columns.to_vec();
        let result = tokio::task::spawn_blocking(move || store.read_projected(&path, &columns, limit))
            .await
            .context("snapshot reader task failed")?
            .map_err(|err| ServiceError::InvalidRequest(format!("{err:#}")))?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::{ColumnKind, ResultColumn};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        opened: AtomicUsize,
    }

    struct FixedSource {
        columns: Vec<ResultColumn>,
        rows: Vec<Vec<Value>>,
    }

    #[async_trait]
    impl QueryRunner for Fixed {
        async fn open(&self, _sql: &str, _params: &Params) -> Result<Box<dyn RowSource>> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FixedSource {
                columns: vec![
                    ResultColumn::new("region", ColumnKind::Text),
                    ResultColumn::new("revenue", ColumnKind::Float64),
                ],
                rows: vec![
                    vec![json!("EU"), json!(10.5)],
                    vec![json!("US"), json!(4.0)],
                ],
            }))
        }
    }

    #[async_trait]
    impl RowSource for FixedSource {
        fn columns(&self) -> &[ResultColumn] {
            &self.columns
        }

        async fn next_chunk(&mut self, max_rows: usize) -> Result<Vec<Vec<Value>>> {
            let take = max_rows.min(self.rows.len());
            Ok(self.rows.drain(..take).collect())
        }
    }

    fn executor(dir: &std::path::Path, offline: bool) -> (Executor, Arc<Fixed>) {
        let runner = Arc::new(Fixed {
            opened: AtomicUsize::new(0),
        });
        let executor = Executor::new(
            Some(runner.clone() as Arc<dyn QueryRunner>),
            SnapshotStore::new(dir.join("cache")),
            Arc::new(Catalog::in_memory().unwrap()),
            IngestLimits {
                max_rows: 100,
                chunk_size: 1_000,
                timeout: Duration::from_secs(5),
            },
            offline,
        );
        (executor, runner)
    }

    #[test]
    fn fingerprint_ignores_whitespace_and_param_order() {
        let a: Params = [("p0", json!(1)), ("p1", json!("x"))].into_iter().collect();
        let b: Params = [("p1", json!("x")), ("p0", json!(1))].into_iter().collect();
        assert_eq!(
            fingerprint("SELECT  1\n FROM t", &a),
            fingerprint("SELECT 1 FROM t", &b)
        );
        assert_ne!(fingerprint("SELECT 1 FROM t", &a), fingerprint("SELECT 1 FROM t", &Params::new()));
        assert_eq!(fingerprint("SELECT 1", &a).len(), 64);
    }

    #[test]
    fn fingerprint_keeps_whitespace_inside_literals() {
        let params = Params::new();
        assert_ne!(
            fingerprint("SELECT a FROM t WHERE x = 'a  b'", &params),
            fingerprint("SELECT a FROM t WHERE x = 'a b'", &params)
        );
        assert_ne!(
            fingerprint("SELECT \"a  b\" FROM t", &params),
            fingerprint("SELECT \"a b\" FROM t", &params)
        );
        assert_eq!(
            fingerprint("SELECT a\n  FROM t WHERE x = 'a  b'", &params),
            fingerprint("SELECT a FROM t WHERE x = 'a  b'", &params)
        );
    }

    #[tokio::test]
    async fn second_run_is_served_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, runner) = executor(dir.path(), false);

        let (first, first_meta) = executor.run("SELECT 1", &Params::new()).await.unwrap();
        assert!(!first_meta.cache_hit);
        assert_eq!(first_meta.mode, ExecutionMode::Source);

        let (second, second_meta) = executor.run("SELECT   1", &Params::new()).await.unwrap();
        assert!(second_meta.cache_hit);
        assert_eq!(second_meta.mode, ExecutionMode::Cache);
        assert_eq!(second_meta.fingerprint, first_meta.fingerprint);
        assert_eq!(second, first);
        assert_eq!(runner.opened.load(Ordering::SeqCst), 1);

        let listing = executor.list_cache().unwrap();
        assert_eq!(listing.len(), 1);
        assert!(listing[0].size_bytes.unwrap_or(0) > 0);
    }

    #[tokio::test]
    async fn executions_are_appended_to_the_query_log() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, _) = executor(dir.path(), false);
        let executor = executor.with_query_log(QueryLog::new(&dir.path().join("logs")).unwrap());

        let (_, first) = executor.run("SELECT 1", &Params::new()).await.unwrap();
        let (_, second) = executor.run("SELECT 1", &Params::new()).await.unwrap();

        let recent = executor.recent_queries(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].meta.fingerprint, first.fingerprint);
        assert_eq!(recent[0].meta.mode, ExecutionMode::Source);
        assert_eq!(recent[1].meta.snapshot_path, second.snapshot_path);
        assert_eq!(recent[1].meta.mode, ExecutionMode::Cache);
        assert_eq!(recent[0].sql, "SELECT 1");

        let latest = executor.recent_queries(1).await.unwrap();
        assert_eq!(latest.len(), 1);
        assert!(latest[0].meta.cache_hit);
    }

    #[tokio::test]
    async fn offline_mode_requires_a_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, _) = executor(dir.path(), true);
        let err = executor.run("SELECT 1", &Params::new()).await.unwrap_err();
        assert!(matches!(err, ServiceError::Offline(ref msg) if msg.contains("PLANQ_OFFLINE_ONLY")));
    }

    #[tokio::test]
    async fn cached_snapshots_can_be_queried_and_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, _) = executor(dir.path(), false);
        let (_, meta) = executor.run("SELECT 1", &Params::new()).await.unwrap();

        let projected = executor
            .query_cached(&meta.fingerprint, &["revenue".to_string()], Some(1))
            .await
            .unwrap();
        assert_eq!(projected.rows, vec![vec![json!(10.5)]]);

        assert!(matches!(
            executor.query_cached("abc123", &[], None).await,
            Err(ServiceError::NotFound(_))
        ));
        assert!(matches!(
            executor.query_cached("../catalog", &[], None).await,
            Err(ServiceError::InvalidRequest(_))
        ));

        let report = executor.clear_cache(Some(&meta.fingerprint)).unwrap();
        assert_eq!(report, ClearReport { catalog_entries: 1, snapshots: 1 });
        assert!(executor.list_cache().unwrap().is_empty());
    }

    #[test]
    fn meta_serializes_elapsed_as_fractional_seconds() {
        let meta = ExecutionMeta {
            fingerprint: "abc".into(),
            cache_hit: false,
            rows: 2,
            elapsed_seconds: Duration::from_millis(1_500),
            mode: ExecutionMode::Source,
            truncated: false,
            stop_reason: None,
            guards: None,
            snapshot_path: String::new(),
        };
        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value["elapsed_seconds"], json!(1.5));
        assert_eq!(value["mode"], json!("source"));
        assert!(value.get("stop_reason").is_none());
    }
}
