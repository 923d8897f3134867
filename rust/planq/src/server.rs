use crate::{
    collab::{HttpPlanProposer, PlanProposer},
    compiler::{CompiledQuery, Compiler},
    config::AppConfig,
    db,
    error::{Result, ServiceError},
    exec::{
        query_log::DEFAULT_RECENT, CacheListing, ClearReport, Executor, PostgresRunner,
        QueryLogEntry, QueryRunner, SessionSettings, SnapshotInfo,
    },
    models::QueryPlan,
    pipeline::{Pipeline, ReviewEdits, RunReport, RunRequest},
    registry::SchemaRegistry,
    result::ResultSet,
    safety::{SafetyReport, Validator},
    state::AppState,
    trace::{NodeDiff, RunSummary, TraceRun, TraceStore},
};
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub struct Server {
    config: Arc<AppConfig>,
    state: AppState,
}

#[derive(Debug, Deserialize)]
pub struct CompileRequest {
    pub plan: Value,
    #[serde(default)]
    pub allowed_tables: Vec<String>,
    #[serde(default)]
    pub large_mode: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct CompileResponse {
    pub compiled: CompiledQuery,
    pub plan: QueryPlan,
    pub plan_diagnostics: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    pub sql: String,
}

#[derive(Debug, Serialize)]
pub struct CacheResponse {
    pub entries: Vec<CacheListing>,
    pub snapshots: Vec<SnapshotInfo>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CacheQueryRequest {
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RecentParams {
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DiffParams {
    /// Comma-separated node names.
    #[serde(default)]
    pub nodes: Option<String>,
}

impl Server {
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        config.ensure_dirs()?;
        let registry = Arc::new(SchemaRegistry::load(&config.schema_registry_path)?);

        let runner: Option<Arc<dyn QueryRunner>> = if config.offline_only {
            info!("offline mode; serving cached snapshots only");
            None
        } else {
            let pool = db::connect_pool(&config).await?;
            Some(Arc::new(PostgresRunner::new(
                pool,
                SessionSettings::from_config(&config),
            )))
        };

        let proposer: Option<Arc<dyn PlanProposer>> = match config.planner_url.as_deref() {
            Some(url) => Some(Arc::new(HttpPlanProposer::new(url, config.planner_timeout)?)),
            None => {
                warn!("no PLANQ_PLANNER_URL configured; plans come from schema reasoning only");
                None
            }
        };

        let executor = Executor::from_config(&config, runner)?;
        let traces = TraceStore::new(&config.traces_dir)?;
        let mut pipeline = Pipeline::new(
            Compiler::new(
                registry,
                config.exploratory_row_limit,
                config.max_returned_rows,
            ),
            Validator::new(config.max_returned_rows),
            Arc::new(executor),
            Arc::new(traces),
        );
        if let Some(proposer) = proposer {
            pipeline = pipeline.with_proposer(proposer);
        }

        Ok(Self::with_pipeline(config, pipeline))
    }

    /// Wraps an already assembled pipeline.
    pub fn with_pipeline(config: AppConfig, pipeline: Pipeline) -> Self {
        let config = Arc::new(config);
        let state = AppState::new(Arc::clone(&config), Arc::new(pipeline));
        Self { config, state }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/healthz", get(Self::health))
            .route("/api/runs", post(Self::create_run).get(Self::list_runs))
            .route("/api/runs/:run_id", get(Self::get_run))
            .route("/api/runs/:run_id/review", post(Self::review_run))
            .route("/api/runs/:run_id/diff/:other", get(Self::diff_runs))
            .route("/api/compile", post(Self::compile))
            .route("/api/validate", post(Self::validate))
            .route("/api/cache", get(Self::list_cache).delete(Self::clear_cache))
            .route("/api/cache/:key", delete(Self::clear_cache_key))
            .route("/api/cache/:key/query", post(Self::query_cache))
            .route("/api/queries", get(Self::recent_queries))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.config.listen_addr;
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "planq listening");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    async fn health(State(state): State<AppState>) -> Json<Value> {
        Json(json!({
            "status": "ok",
            "offline": state.pipeline.executor().is_offline(),
        }))
    }

    async fn create_run(
        State(state): State<AppState>,
        headers: HeaderMap,
        Json(request): Json<RunRequest>,
    ) -> Result<Json<RunReport>> {
        enforce_api_key(&headers, &state.config)?;
        Ok(Json(state.pipeline.run(request).await?))
    }

    async fn review_run(
        State(state): State<AppState>,
        headers: HeaderMap,
        Path(run_id): Path<String>,
        Json(edits): Json<ReviewEdits>,
    ) -> Result<Json<RunReport>> {
        enforce_api_key(&headers, &state.config)?;
        Ok(Json(state.pipeline.resume(&run_id, edits).await?))
    }

    async fn list_runs(
        State(state): State<AppState>,
        headers: HeaderMap,
    ) -> Result<Json<Vec<RunSummary>>> {
        enforce_api_key(&headers, &state.config)?;
        Ok(Json(state.pipeline.traces().list_runs().await?))
    }

    async fn get_run(
        State(state): State<AppState>,
        headers: HeaderMap,
        Path(run_id): Path<String>,
    ) -> Result<Json<TraceRun>> {
        enforce_api_key(&headers, &state.config)?;
        Ok(Json(state.pipeline.traces().load(&run_id).await?))
    }

    async fn diff_runs(
        State(state): State<AppState>,
        headers: HeaderMap,
        Path((run_id, other)): Path<(String, String)>,
        Query(params): Query<DiffParams>,
    ) -> Result<Json<Vec<NodeDiff>>> {
        enforce_api_key(&headers, &state.config)?;
        let nodes: Vec<String> = params
            .nodes
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .collect();
        Ok(Json(
            state
                .pipeline
                .traces()
                .diff_runs(&run_id, &other, &nodes)
                .await?,
        ))
    }

    async fn compile(
        State(state): State<AppState>,
        headers: HeaderMap,
        Json(request): Json<CompileRequest>,
    ) -> Result<Json<CompileResponse>> {
        enforce_api_key(&headers, &state.config)?;
        let (mut plan, plan_diagnostics) = QueryPlan::from_untrusted(&request.plan);
        let compiled = state.pipeline.compiler().compile(
            &mut plan,
            &request.allowed_tables,
            request.large_mode,
        )?;
        Ok(Json(CompileResponse {
            compiled,
            plan,
            plan_diagnostics,
        }))
    }

    async fn validate(
        State(state): State<AppState>,
        headers: HeaderMap,
        Json(request): Json<ValidateRequest>,
    ) -> Result<Json<SafetyReport>> {
        enforce_api_key(&headers, &state.config)?;
        Ok(Json(state.pipeline.validator().validate(&request.sql)))
    }

    async fn list_cache(
        State(state): State<AppState>,
        headers: HeaderMap,
    ) -> Result<Json<CacheResponse>> {
        enforce_api_key(&headers, &state.config)?;
        let executor = state.pipeline.executor();
        Ok(Json(CacheResponse {
            entries: executor.list_cache()?,
            snapshots: executor.snapshots()?,
        }))
    }

    async fn clear_cache(
        State(state): State<AppState>,
        headers: HeaderMap,
    ) -> Result<Json<ClearReport>> {
        enforce_api_key(&headers, &state.config)?;
        Ok(Json(state.pipeline.executor().clear_cache(None)?))
    }

    async fn clear_cache_key(
        State(state): State<AppState>,
        headers: HeaderMap,
        Path(key): Path<String>,
    ) -> Result<Json<ClearReport>> {
        enforce_api_key(&headers, &state.config)?;
        let report = state.pipeline.executor().clear_cache(Some(&key))?;
        if report == ClearReport::default() {
            return Err(ServiceError::NotFound(format!("cache key {key}")));
        }
        Ok(Json(report))
    }

    async fn query_cache(
        State(state): State<AppState>,
        headers: HeaderMap,
        Path(key): Path<String>,
        Json(request): Json<CacheQueryRequest>,
    ) -> Result<Json<ResultSet>> {
        enforce_api_key(&headers, &state.config)?;
        Ok(Json(
            state
                .pipeline
                .executor()
                .query_cached(&key, &request.columns, request.limit)
                .await?,
        ))
    }

    async fn recent_queries(
        State(state): State<AppState>,
        headers: HeaderMap,
        Query(params): Query<RecentParams>,
    ) -> Result<Json<Vec<QueryLogEntry>>> {
        enforce_api_key(&headers, &state.config)?;
        let limit = params.limit.unwrap_or(DEFAULT_RECENT);
        Ok(Json(state.pipeline.executor().recent_queries(limit).await?))
    }
}

fn enforce_api_key(headers: &HeaderMap, config: &AppConfig) -> Result<()> {
    if let Some(expected) = &config.api_key {
        let provided = headers
            .get("x-api-key")
            .and_then(|value| value.to_str().ok());

        if provided != Some(expected.as_str()) {
            return Err(ServiceError::Auth);
        }
    }

    Ok(())
}
