use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{self, Request, StatusCode},
    Router,
};
use planq::{
    collab::{PlanProposer, PlanRequest, Unavailable},
    compiler::{Compiler, Params},
    config::AppConfig,
    error::Result,
    exec::{Executor, QueryRunner, RowSource},
    pipeline::Pipeline,
    registry::SchemaRegistry,
    result::{ColumnKind, ResultColumn},
    safety::Validator,
    server::Server,
    telemetry,
    trace::TraceStore,
};
use serde_json::{json, Value};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tempfile::TempDir;
use tower::ServiceExt;

pub const API_KEY: &str = "test-api-key";
pub const EXPLORATORY_ROWS: i64 = 5;
pub const MAX_ROWS: i64 = 20;

pub const REGISTRY: &str = r#"{
    "tables": {
        "sales.orders": {
            "columns": [
                {"name": "order_id", "type": "bigint", "nullable": false},
                {"name": "customer_id", "type": "bigint"},
                {"name": "order_date", "type": "timestamp with time zone"},
                {"name": "region", "type": "text"},
                {"name": "revenue", "type": "numeric"},
                {"name": "status", "type": "text"}
            ],
            "row_count": 250000
        },
        "sales.customers": {
            "columns": [
                {"name": "customer_id", "type": "bigint", "nullable": false},
                {"name": "name", "type": "text"},
                {"name": "segment", "type": "text"}
            ],
            "row_count": 12000
        },
        "ops.events": {
            "columns": [
                {"name": "event_id", "type": "bigint"},
                {"name": "event_type", "type": "text"},
                {"name": "created_at", "type": "timestamp with time zone"}
            ],
            "row_count": 900000000000
        }
    }
}"#;

pub fn registry() -> Arc<SchemaRegistry> {
    Arc::new(SchemaRegistry::from_json(REGISTRY).expect("test registry should parse"))
}

/// Serves synthetic rows for whatever aliases the statement selects, honoring
/// its trailing `LIMIT`.
pub struct MemoryRunner {
    rows: usize,
    opened: AtomicUsize,
}

impl MemoryRunner {
    pub fn new(rows: usize) -> Arc<Self> {
        Arc::new(Self {
            rows,
            opened: AtomicUsize::new(0),
        })
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

fn selected_aliases(sql: &str) -> Vec<String> {
    let from = sql
        .find("\nFROM ")
        .or_else(|| sql.find(" FROM "))
        .unwrap_or(sql.len());
    sql[..from]
        .split(" AS \"")
        .skip(1)
        .filter_map(|part| part.split('"').next())
        .map(str::to_string)
        .collect()
}

fn trailing_limit(sql: &str) -> Option<usize> {
    let idx = sql.rfind("LIMIT")?;
    sql[idx + "LIMIT".len()..].trim().parse().ok()
}

struct MemorySource {
    columns: Vec<ResultColumn>,
    rows: Vec<Vec<Value>>,
}

#[async_trait]
impl QueryRunner for MemoryRunner {
    async fn open(&self, sql: &str, _params: &Params) -> Result<Box<dyn RowSource>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let aliases = selected_aliases(sql);
        let count = trailing_limit(sql).map_or(self.rows, |limit| limit.min(self.rows));

        let columns: Vec<ResultColumn> = aliases
            .iter()
            .map(|alias| {
                let kind = if alias.ends_with("_id") || alias == "revenue" || alias == "orders" {
                    ColumnKind::Int64
                } else {
                    ColumnKind::Text
                };
                ResultColumn::new(alias.clone(), kind)
            })
            .collect();
        let rows = (0..count)
            .map(|i| {
                columns
                    .iter()
                    .map(|c| match c.kind {
                        ColumnKind::Int64 => json!(i as i64),
                        _ => json!(format!("{}-{}", c.name, i % 3)),
                    })
                    .collect()
            })
            .collect();
        Ok(Box::new(MemorySource { columns, rows }))
    }
}

#[async_trait]
impl RowSource for MemorySource {
    fn columns(&self) -> &[ResultColumn] {
        &self.columns
    }

    async fn next_chunk(&mut self, max_rows: usize) -> Result<Vec<Vec<Value>>> {
        let take = max_rows.min(self.rows.len());
        Ok(self.rows.drain(..take).collect())
    }
}

/// Returns the same intent and plan documents for every run.
pub struct ScriptedProposer {
    pub intent: Value,
    pub plan: Value,
}

#[async_trait]
impl PlanProposer for ScriptedProposer {
    async fn extract_intent(&self, _question: &str, _allowed: &[String]) -> std::result::Result<Value, Unavailable> {
        Ok(self.intent.clone())
    }

    async fn propose_plan(&self, _request: &PlanRequest<'_>) -> std::result::Result<Value, Unavailable> {
        Ok(self.plan.clone())
    }
}

/// Always unavailable, like an unreachable reasoning service.
pub struct DownProposer;

#[async_trait]
impl PlanProposer for DownProposer {
    async fn extract_intent(&self, _question: &str, _allowed: &[String]) -> std::result::Result<Value, Unavailable> {
        Err(Unavailable("connection refused".into()))
    }

    async fn propose_plan(&self, _request: &PlanRequest<'_>) -> std::result::Result<Value, Unavailable> {
        Err(Unavailable("connection refused".into()))
    }
}

pub fn revenue_plan(risk: &str) -> Value {
    json!({
        "tables": ["sales.orders"],
        "metrics": [{"name": "revenue", "agg": "sum", "field": "sales.orders.revenue"}],
        "dimensions": ["sales.orders.region"],
        "filters": [{"field": "status", "op": "=", "value": "paid"}],
        "query_cost_risk": risk,
        "notes": "Revenue by region"
    })
}

/// Temporary data directory plus the pieces a pipeline is built from.
pub struct TestEnv {
    pub dir: TempDir,
    pub config: AppConfig,
    pub runner: Option<Arc<MemoryRunner>>,
}

impl TestEnv {
    pub fn new(source_rows: Option<usize>) -> Self {
        telemetry::init_tracing();
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = AppConfig::embedded(dir.path());
        config.exploratory_row_limit = EXPLORATORY_ROWS;
        config.max_returned_rows = MAX_ROWS;
        config.ensure_dirs().expect("data dirs");
        Self {
            dir,
            config,
            runner: source_rows.map(MemoryRunner::new),
        }
    }

    pub fn with_api_key(mut self) -> Self {
        self.config.api_key = Some(API_KEY.to_string());
        self
    }

    pub fn executor(&self) -> Executor {
        let runner = self
            .runner
            .clone()
            .map(|runner| runner as Arc<dyn QueryRunner>);
        Executor::from_config(&self.config, runner).expect("executor")
    }

    pub fn pipeline(&self, proposer: Arc<dyn PlanProposer>) -> Pipeline {
        Pipeline::new(
            Compiler::new(registry(), EXPLORATORY_ROWS, MAX_ROWS),
            Validator::new(MAX_ROWS),
            Arc::new(self.executor()),
            Arc::new(TraceStore::new(&self.config.traces_dir).expect("trace store")),
        )
        .with_proposer(proposer)
    }

    pub fn router(&self, proposer: Arc<dyn PlanProposer>) -> Router {
        Server::with_pipeline(self.config.clone(), self.pipeline(proposer)).router()
    }
}

pub async fn send(
    router: &Router,
    method: http::Method,
    path: &str,
    payload: Option<Value>,
    api_key: Option<&str>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header(http::header::CONTENT_TYPE, "application/json");
    if let Some(key) = api_key {
        builder = builder.header("x-api-key", key);
    }
    let body = match payload {
        Some(payload) => Body::from(serde_json::to_vec(&payload).expect("payload should serialize")),
        None => Body::empty(),
    };
    let request = builder.body(body).expect("failed to build request");
    let response = router
        .clone()
        .oneshot(request)
        .await
        .expect("router should handle request");
    read_json(response).await
}

pub async fn read_json(response: http::Response<Body>) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("response body should be readable");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice::<Value>(&bytes).expect("response body should be valid JSON")
    };
    (status, value)
}
