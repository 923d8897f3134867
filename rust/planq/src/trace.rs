//! Durable run traces: one JSON document per run, rewritten atomically after
//! every stage.

use crate::error::{Result, ServiceError};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

const RUN_PREFIX: &str = "run_";
const RUN_ID_LEN: usize = 12;

/// Nodes compared by [`TraceStore::diff_runs`] when no keys are given.
pub const DEFAULT_DIFF_NODES: [&str; 4] = ["plan", "sql_generation", "insights", "dashboard"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Started,
    NeedsHumanReview,
    Rejected,
    Failed,
    FailedDataQuality,
    Success,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Started | RunStatus::NeedsHumanReview)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceNode {
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceError {
    pub timestamp: DateTime<Utc>,
    pub stage: String,
    pub message: String,
    pub detail: String,
}

/// Stage nodes in write order. Re-adding a node replaces it in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceNodes(Vec<(String, TraceNode)>);

impl TraceNodes {
    pub fn insert(&mut self, name: &str, node: TraceNode) {
        match self.0.iter_mut().find(|(existing, _)| existing == name) {
            Some(slot) => slot.1 = node,
            None => self.0.push((name.to_string(), node)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&TraceNode> {
        self.0
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, node)| node)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for TraceNodes {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, node) in &self.0 {
            map.serialize_entry(name, node)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for TraceNodes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct NodesVisitor;

        impl<'de> Visitor<'de> for NodesVisitor {
            type Value = TraceNodes;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of trace nodes")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<TraceNodes, A::Error> {
                let mut nodes = TraceNodes::default();
                while let Some((name, node)) = access.next_entry::<String, TraceNode>()? {
                    nodes.insert(&name, node);
                }
                Ok(nodes)
            }
        }

        deserializer.deserialize_map(NodesVisitor)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceRun {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub status: RunStatus,
    pub nodes: TraceNodes,
    pub errors: Vec<TraceError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalized_at: Option<DateTime<Utc>>,
}

impl TraceRun {
    pub fn payload(&self, node: &str) -> Option<&Value> {
        self.nodes.get(node).map(|n| &n.payload)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RunSummary {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub status: RunStatus,
    pub path: String,
}

/// One differing leaf between two runs; `path` is a JSON pointer.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NodeDiff {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub left: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub right: Option<Value>,
}

pub struct TraceStore {
    dir: PathBuf,
    // Serializes read-modify-write cycles on run documents.
    write_lock: Mutex<()>,
}

impl TraceStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create trace directory {}", dir.display()))?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{RUN_PREFIX}{run_id}.json"))
    }

    pub async fn new_run(&self) -> Result<TraceRun> {
        let mut run_id = Uuid::new_v4().simple().to_string();
        run_id.truncate(RUN_ID_LEN);
        let run = TraceRun {
            run_id,
            created_at: Utc::now(),
            status: RunStatus::Started,
            nodes: TraceNodes::default(),
            errors: Vec::new(),
            finalized_at: None,
        };
        let _guard = self.write_lock.lock().await;
        self.save(&run).await?;
        debug!(run_id = %run.run_id, "trace run created");
        Ok(run)
    }

    pub async fn add_node(&self, run_id: &str, node: &str, payload: Value) -> Result<()> {
        self.update(run_id, |run| {
            run.nodes.insert(
                node,
                TraceNode {
                    timestamp: Utc::now(),
                    payload,
                },
            );
        })
        .await
    }

    /// Records a stage failure and marks the run failed.
    pub async fn add_error(&self, run_id: &str, stage: &str, message: &str, detail: &str) -> Result<()> {
        self.update(run_id, |run| {
            run.errors.push(TraceError {
                timestamp: Utc::now(),
                stage: stage.to_string(),
                message: message.to_string(),
                detail: detail.to_string(),
            });
            run.status = RunStatus::Failed;
        })
        .await
    }

    pub async fn finalize(&self, run_id: &str, status: RunStatus) -> Result<()> {
        self.update(run_id, |run| {
            run.status = status;
            run.finalized_at = Some(Utc::now());
        })
        .await
    }

    /// Puts a run halted for review back into progress. The status check and
    /// the write happen under one lock, so only the first caller claims it.
    pub async fn claim_review(&self, run_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut run = self.load(run_id).await?;
        if run.status != RunStatus::NeedsHumanReview {
            return Err(ServiceError::InvalidRequest(format!(
                "run {run_id} is not awaiting review"
            )));
        }
        run.status = RunStatus::Started;
        run.finalized_at = None;
        self.save(&run).await
    }

    async fn update(&self, run_id: &str, apply: impl FnOnce(&mut TraceRun)) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut run = self.load(run_id).await?;
        apply(&mut run);
        self.save(&run).await
    }

    async fn save(&self, run: &TraceRun) -> Result<()> {
        let path = self.path(&run.run_id);
        let tmp = self.dir.join(format!(".{RUN_PREFIX}{}.json.tmp", run.run_id));
        let data = serde_json::to_vec_pretty(run).context("failed to serialize trace")?;
        tokio::fs::write(&tmp, &data)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to move trace into {}", path.display()))?;
        Ok(())
    }

    pub async fn load(&self, run_id: &str) -> Result<TraceRun> {
        if !is_valid_run_id(run_id) {
            return Err(ServiceError::NotFound(format!("run {run_id}")));
        }
        let path = self.path(run_id);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ServiceError::NotFound(format!("run {run_id}")))
            }
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("failed to read {}", path.display()))
                    .into())
            }
        };
        let run = serde_json::from_slice(&data)
            .with_context(|| format!("corrupt trace file {}", path.display()))?;
        Ok(run)
    }

    pub async fn get_node(&self, run_id: &str, node: &str) -> Result<Option<TraceNode>> {
        Ok(self.load(run_id).await?.nodes.get(node).cloned())
    }

    /// Summaries of every readable run, newest first.
    pub async fn list_runs(&self) -> Result<Vec<RunSummary>> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("failed to list {}", self.dir.display()))?;

        let mut runs = Vec::new();
        while let Some(entry) = entries.next_entry().await.context("failed to read trace entry")? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(run_id) = name
                .strip_prefix(RUN_PREFIX)
                .and_then(|rest| rest.strip_suffix(".json"))
            else {
                continue;
            };
            match self.load(run_id).await {
                Ok(run) => runs.push(RunSummary {
                    run_id: run.run_id,
                    created_at: run.created_at,
                    status: run.status,
                    path: entry.path().to_string_lossy().into_owned(),
                }),
                Err(err) => warn!(file = %name, error = %err, "skipping unreadable trace"),
            }
        }

        runs.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.run_id.cmp(&a.run_id))
        });
        Ok(runs)
    }

    /// Leaf-level differences of the selected node payloads.
    pub async fn diff_runs(&self, left: &str, right: &str, nodes: &[String]) -> Result<Vec<NodeDiff>> {
        let left_run = self.load(left).await?;
        let right_run = self.load(right).await?;
        let keys: Vec<String> = if nodes.is_empty() {
            DEFAULT_DIFF_NODES.iter().map(|k| k.to_string()).collect()
        } else {
            nodes.to_vec()
        };

        let mut diffs = Vec::new();
        for key in keys {
            diff_values(
                &format!("/{}", escape_pointer(&key)),
                left_run.payload(&key),
                right_run.payload(&key),
                &mut diffs,
            );
        }
        Ok(diffs)
    }
}

fn is_valid_run_id(run_id: &str) -> bool {
    !run_id.is_empty() && run_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn escape_pointer(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

fn diff_values(path: &str, left: Option<&Value>, right: Option<&Value>, out: &mut Vec<NodeDiff>) {
    match (left, right) {
        (Some(Value::Object(a)), Some(Value::Object(b))) => {
            let mut keys: Vec<&String> = a.keys().chain(b.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                diff_values(
                    &format!("{path}/{}", escape_pointer(key)),
                    a.get(key),
                    b.get(key),
                    out,
                );
            }
        }
        (Some(Value::Array(a)), Some(Value::Array(b))) => {
            for idx in 0..a.len().max(b.len()) {
                diff_values(&format!("{path}/{idx}"), a.get(idx), b.get(idx), out);
            }
        }
        (a, b) if a == b => {}
        (a, b) => out.push(NodeDiff {
            path: path.to_string(),
            left: a.cloned(),
            right: b.cloned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[tokio::test]
    async fn nodes_keep_write_order_across_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let store = TraceStore::new(dir.path()).unwrap();
        let run = store.new_run().await.unwrap();
        assert_eq!(run.run_id.len(), 12);

        for node in ["run_config", "intent", "intent__critique", "abc"] {
            store.add_node(&run.run_id, node, json!({"node": node})).await.unwrap();
        }
        store.add_node(&run.run_id, "intent", json!({"node": "again"})).await.unwrap();

        let loaded = store.load(&run.run_id).await.unwrap();
        assert_eq!(
            loaded.nodes.names().collect::<Vec<_>>(),
            vec!["run_config", "intent", "intent__critique", "abc"]
        );
        assert_eq!(loaded.payload("intent"), Some(&json!({"node": "again"})));
        assert!(!dir.path().join(format!(".run_{}.json.tmp", run.run_id)).exists());
    }

    #[tokio::test]
    async fn errors_mark_the_run_failed() {
        let dir = tempfile::tempdir().unwrap();
        let store = TraceStore::new(dir.path()).unwrap();
        let run = store.new_run().await.unwrap();
        store
            .add_error(&run.run_id, "execute", "source unavailable", "connection refused")
            .await
            .unwrap();

        let loaded = store.load(&run.run_id).await.unwrap();
        assert_eq!(loaded.status, RunStatus::Failed);
        assert_eq!(loaded.errors[0].stage, "execute");

        store.finalize(&run.run_id, RunStatus::Failed).await.unwrap();
        assert!(store.load(&run.run_id).await.unwrap().finalized_at.is_some());
    }

    #[tokio::test]
    async fn a_review_halt_is_claimed_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = TraceStore::new(dir.path()).unwrap();
        let run = store.new_run().await.unwrap();

        assert!(matches!(
            store.claim_review(&run.run_id).await,
            Err(ServiceError::InvalidRequest(_))
        ));

        store.finalize(&run.run_id, RunStatus::NeedsHumanReview).await.unwrap();
        let (first, second) = tokio::join!(
            store.claim_review(&run.run_id),
            store.claim_review(&run.run_id)
        );
        assert_eq!(
            [first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count(),
            1
        );

        let loaded = store.load(&run.run_id).await.unwrap();
        assert_eq!(loaded.status, RunStatus::Started);
        assert!(loaded.finalized_at.is_none());
    }

    #[tokio::test]
    async fn missing_and_malformed_ids_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = TraceStore::new(dir.path()).unwrap();
        assert!(matches!(store.load("abc123").await, Err(ServiceError::NotFound(_))));
        assert!(matches!(store.load("../etc").await, Err(ServiceError::NotFound(_))));
    }

    #[tokio::test]
    async fn lists_newest_first_and_diffs_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let store = TraceStore::new(dir.path()).unwrap();
        let first = store.new_run().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = store.new_run().await.unwrap();

        store
            .add_node(&first.run_id, "plan", json!({"tables": ["a"], "notes": "x"}))
            .await
            .unwrap();
        store
            .add_node(&second.run_id, "plan", json!({"tables": ["a", "b"], "notes": "x"}))
            .await
            .unwrap();

        let runs = store.list_runs().await.unwrap();
        assert_eq!(runs[0].run_id, second.run_id);
        assert_eq!(runs.len(), 2);

        let diffs = store.diff_runs(&first.run_id, &second.run_id, &[]).await.unwrap();
        assert_eq!(
            diffs,
            vec![NodeDiff {
                path: "/plan/tables/1".into(),
                left: None,
                right: Some(json!("b")),
            }]
        );
    }
}
