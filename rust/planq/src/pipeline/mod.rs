//! Staged run driver: plan, compile, validate, execute and summarize, with a
//! trace node and a critique written after every stage.

pub mod critique;
pub mod review;

use crate::collab::planner::{finalize_plan, schema_reasoning};
use crate::collab::{
    BasicInsights, BasicQualityChecker, DashboardBuilder, DashboardMeta, FallbackPlanProposer,
    InsightSummarizer, Insights, Intent, PlanProposer, PlanRequest, QualityChecker, QualityReport,
    SchemaReasoning, VizDashboard,
};
use crate::compiler::{CompiledQuery, Compiler, Params};
use crate::error::{Result, ServiceError};
use crate::exec::{ExecutionMeta, Executor};
use crate::models::QueryPlan;
use crate::result::ResultSet;
use crate::safety::{SafetyReport, Validator};
use crate::trace::{RunStatus, TraceRun, TraceStore};
use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use critique::{critique, rollup, CritiqueResult, CritiqueRollup};
pub use review::{AppliedReview, ReviewEdits, ReviewPacket};

const RUN_CONFIG_NODE: &str = "run_config";
const APPLIED_SUFFIX: &str = "__applied";
const CRITIQUE_SUFFIX: &str = "__critique";
const ALLOWLIST_PREVIEW: usize = 50;
const PREVIEW_ROWS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Intent,
    SchemaReasoning,
    Plan,
    HumanReview,
    SqlGeneration,
    SqlSafety,
    Execute,
    DataValidation,
    Insights,
    Dashboard,
    Render,
    CritiqueRollup,
}

impl Stage {
    pub const ALL: [Stage; 12] = [
        Stage::Intent,
        Stage::SchemaReasoning,
        Stage::Plan,
        Stage::HumanReview,
        Stage::SqlGeneration,
        Stage::SqlSafety,
        Stage::Execute,
        Stage::DataValidation,
        Stage::Insights,
        Stage::Dashboard,
        Stage::Render,
        Stage::CritiqueRollup,
    ];

    /// Trace node name.
    pub fn name(self) -> &'static str {
        match self {
            Stage::Intent => "intent",
            Stage::SchemaReasoning => "schema_reasoning",
            Stage::Plan => "plan",
            Stage::HumanReview => "human_review",
            Stage::SqlGeneration => "sql_generation",
            Stage::SqlSafety => "sql_safety",
            Stage::Execute => "execute",
            Stage::DataValidation => "data_validation",
            Stage::Insights => "insights",
            Stage::Dashboard => "dashboard",
            Stage::Render => "render",
            Stage::CritiqueRollup => "critique_rollup",
        }
    }

    pub fn critique_node(self) -> String {
        format!("{}{CRITIQUE_SUFFIX}", self.name())
    }

    pub fn next(self) -> Option<Stage> {
        let idx = Stage::ALL.iter().position(|s| *s == self)?;
        Stage::ALL.get(idx + 1).copied()
    }
}

/// Why a run stopped before the last stage without an error.
#[derive(Debug, Clone)]
pub enum Halt {
    NeedsHumanReview(Box<ReviewPacket>),
    Rejected(SafetyReport),
    FailedDataQuality(QualityReport),
}

#[derive(Debug, Clone)]
pub enum StageOutcome {
    Continue,
    Halt(Halt),
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunRequest {
    pub question: String,
    #[serde(default)]
    pub allowed_tables: Vec<String>,
    #[serde(default)]
    pub large_mode: bool,
    #[serde(default)]
    pub developer_mode: bool,
    /// Edits supplied up front skip the review halt.
    #[serde(default)]
    pub review: Option<ReviewEdits>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RunConfig {
    question: String,
    developer_mode: bool,
    large_mode: bool,
    allowed_tables: Vec<String>,
    allowed_tables_count: usize,
    allowed_tables_preview: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSuccess {
    pub plan: QueryPlan,
    pub sql: String,
    pub params: Params,
    pub exec_meta: ExecutionMeta,
    pub data_quality: QualityReport,
    pub insights: Insights,
    pub dashboard: DashboardMeta,
    pub preview: Vec<Value>,
    pub columns: Vec<String>,
    pub rows: usize,
    pub critique: CritiqueRollup,
}

/// Structured outcome of a run, whatever its terminal status.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_packet: Option<ReviewPacket>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection: Option<SafetyReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_quality: Option<QualityReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Box<RunSuccess>>,
}

impl RunReport {
    fn new(run_id: &str, status: RunStatus) -> Self {
        Self {
            run_id: run_id.to_string(),
            status,
            review_packet: None,
            rejection: None,
            data_quality: None,
            error: None,
            result: None,
        }
    }
}

#[derive(Default)]
struct RunState {
    run_id: String,
    question: String,
    allowed_tables: Vec<String>,
    large_mode: bool,
    edits: Option<ReviewEdits>,
    intent: Option<Intent>,
    reasoning: Option<SchemaReasoning>,
    plan: Option<QueryPlan>,
    compiled: Option<CompiledQuery>,
    safety: Option<SafetyReport>,
    result: Option<ResultSet>,
    meta: Option<ExecutionMeta>,
    quality: Option<QualityReport>,
    insights: Option<Insights>,
    dashboard: Option<DashboardMeta>,
    rollup: Option<CritiqueRollup>,
    critiques: Vec<CritiqueResult>,
}

fn require<'a, T>(value: &'a Option<T>, what: &str) -> Result<&'a T> {
    value
        .as_ref()
        .ok_or_else(|| ServiceError::Internal(anyhow::anyhow!("{what} is not available yet")))
}

fn payload<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value).context("failed to serialize stage payload")?)
}

fn node<T: DeserializeOwned>(run: &TraceRun, name: &str) -> Result<T> {
    let value = run
        .payload(name)
        .ok_or_else(|| ServiceError::InvalidRequest(format!("run {} has no {name} node", run.run_id)))?;
    Ok(serde_json::from_value(value.clone())
        .with_context(|| format!("trace node {name} of run {} is malformed", run.run_id))?)
}

pub struct Pipeline {
    compiler: Compiler,
    validator: Validator,
    executor: Arc<Executor>,
    traces: Arc<TraceStore>,
    proposer: Arc<dyn PlanProposer>,
    quality: Arc<dyn QualityChecker>,
    insights: Arc<dyn InsightSummarizer>,
    dashboard: Arc<dyn DashboardBuilder>,
}

impl Pipeline {
    pub fn new(
        compiler: Compiler,
        validator: Validator,
        executor: Arc<Executor>,
        traces: Arc<TraceStore>,
    ) -> Self {
        Self {
            compiler,
            validator,
            executor,
            traces,
            proposer: Arc::new(FallbackPlanProposer),
            quality: Arc::new(BasicQualityChecker),
            insights: Arc::new(BasicInsights),
            dashboard: Arc::new(VizDashboard),
        }
    }

    pub fn with_proposer(mut self, proposer: Arc<dyn PlanProposer>) -> Self {
        self.proposer = proposer;
        self
    }

    pub fn with_quality_checker(mut self, quality: Arc<dyn QualityChecker>) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_insights(mut self, insights: Arc<dyn InsightSummarizer>) -> Self {
        self.insights = insights;
        self
    }

    pub fn with_dashboard(mut self, dashboard: Arc<dyn DashboardBuilder>) -> Self {
        self.dashboard = dashboard;
        self
    }

    pub fn compiler(&self) -> &Compiler {
        &self.compiler
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn traces(&self) -> &TraceStore {
        &self.traces
    }

    /// Starts a new run and drives it as far as it can go.
    pub async fn run(&self, request: RunRequest) -> Result<RunReport> {
        if request.question.trim().is_empty() {
            return Err(ServiceError::InvalidRequest("question must not be empty".into()));
        }
        let run = self.traces.new_run().await?;
        info!(run_id = %run.run_id, "pipeline run started");

        let config = RunConfig {
            question: request.question.clone(),
            developer_mode: request.developer_mode,
            large_mode: request.large_mode,
            allowed_tables_count: request.allowed_tables.len(),
            allowed_tables_preview: request
                .allowed_tables
                .iter()
                .take(ALLOWLIST_PREVIEW)
                .cloned()
                .collect(),
            allowed_tables: request.allowed_tables.clone(),
        };
        self.traces
            .add_node(&run.run_id, RUN_CONFIG_NODE, payload(&config)?)
            .await?;

        let mut state = RunState {
            run_id: run.run_id,
            question: request.question,
            allowed_tables: request.allowed_tables,
            large_mode: request.large_mode,
            edits: request.review,
            ..RunState::default()
        };
        self.drive(&mut state, Stage::Intent).await
    }

    /// Continues a run halted for review, applying `edits` at the checkpoint.
    pub async fn resume(&self, run_id: &str, edits: ReviewEdits) -> Result<RunReport> {
        let run = self.traces.load(run_id).await?;
        if run.status != RunStatus::NeedsHumanReview {
            return Err(ServiceError::InvalidRequest(format!(
                "run {run_id} is not awaiting review"
            )));
        }

        let config: RunConfig = node(&run, RUN_CONFIG_NODE)?;
        let intent: Intent = node(&run, Stage::Intent.name())?;
        let plan: QueryPlan = node(&run, Stage::Plan.name())?;
        let critiques = [Stage::Intent, Stage::SchemaReasoning, Stage::Plan]
            .into_iter()
            .filter_map(|stage| run.payload(&stage.critique_node()).cloned())
            .filter_map(|value| serde_json::from_value(value).ok())
            .collect();

        self.traces.claim_review(run_id).await?;
        info!(run_id, "pipeline run resumed after review");

        let mut state = RunState {
            run_id: run.run_id,
            question: config.question,
            allowed_tables: config.allowed_tables,
            large_mode: config.large_mode,
            edits: Some(edits),
            intent: Some(intent),
            plan: Some(plan),
            critiques,
            ..RunState::default()
        };
        self.drive(&mut state, Stage::HumanReview).await
    }

    async fn drive(&self, state: &mut RunState, from: Stage) -> Result<RunReport> {
        let mut stage = Some(from);
        while let Some(current) = stage {
            debug!(run_id = %state.run_id, stage = current.name(), "stage started");
            match self.step(current, state).await {
                Ok(StageOutcome::Continue) => stage = current.next(),
                Ok(StageOutcome::Halt(halt)) => return self.halt(state, halt).await,
                Err(err) => return self.fail(state, current, err).await,
            }
        }
        self.succeed(state).await
    }

    async fn record(&self, state: &mut RunState, stage: Stage, node: Value) -> Result<CritiqueResult> {
        let review = critique(stage, &node);
        self.record_with(state, stage, node, review).await
    }

    async fn record_with(
        &self,
        state: &mut RunState,
        stage: Stage,
        node: Value,
        review: CritiqueResult,
    ) -> Result<CritiqueResult> {
        self.traces.add_node(&state.run_id, stage.name(), node).await?;
        self.traces
            .add_node(&state.run_id, &stage.critique_node(), payload(&review)?)
            .await?;
        state.critiques.push(review.clone());
        Ok(review)
    }

    async fn step(&self, stage: Stage, state: &mut RunState) -> Result<StageOutcome> {
        match stage {
            Stage::Intent => {
                let (doc, unavailable) = match self
                    .proposer
                    .extract_intent(&state.question, &state.allowed_tables)
                    .await
                {
                    Ok(doc) => (doc, None),
                    Err(err) => {
                        warn!(run_id = %state.run_id, error = %err, "intent extraction unavailable");
                        (json!({}), Some(err.to_string()))
                    }
                };
                let intent = Intent::from_document(&doc);
                let mut node = payload(&intent)?;
                if let (Some(reason), Value::Object(map)) = (unavailable, &mut node) {
                    map.insert("proposer_unavailable".into(), Value::String(reason));
                }
                self.record(state, stage, node).await?;
                state.intent = Some(intent);
            }
            Stage::SchemaReasoning => {
                let intent = require(&state.intent, "intent")?;
                let reasoning = schema_reasoning(
                    self.compiler.registry(),
                    &state.question,
                    intent,
                    &state.allowed_tables,
                );
                let node = payload(&reasoning)?;
                self.record(state, stage, node).await?;
                state.reasoning = Some(reasoning);
            }
            Stage::Plan => {
                let intent = require(&state.intent, "intent")?;
                let reasoning = require(&state.reasoning, "schema reasoning")?;
                let registry = self.compiler.registry();
                let request = PlanRequest {
                    question: &state.question,
                    intent,
                    candidate_tables: &reasoning.candidate_tables,
                    schema_snapshot: registry.snapshot_for(&reasoning.candidate_tables),
                };
                let doc = match self.proposer.propose_plan(&request).await {
                    Ok(doc) => doc,
                    Err(err) => {
                        warn!(run_id = %state.run_id, error = %err, "plan proposal unavailable");
                        json!({})
                    }
                };
                let proposed = finalize_plan(
                    registry,
                    &doc,
                    &reasoning.candidate_tables,
                    &state.allowed_tables,
                    state.large_mode,
                );
                let mut node = payload(&proposed.plan)?;
                if let Value::Object(map) = &mut node {
                    map.insert("diagnostics".into(), payload(&proposed.diagnostics)?);
                }
                self.record(state, stage, node).await?;
                state.plan = Some(proposed.plan);
            }
            Stage::HumanReview => return self.human_review(state).await,
            Stage::SqlGeneration => {
                let plan = state
                    .plan
                    .as_mut()
                    .ok_or_else(|| ServiceError::Internal(anyhow::anyhow!("plan is not available yet")))?;
                let large_mode = plan.large_mode;
                let compiled = self
                    .compiler
                    .compile(plan, &state.allowed_tables, Some(large_mode))?;
                if !compiled.diagnostics.is_empty() {
                    debug!(
                        run_id = %state.run_id,
                        diagnostics = ?compiled.diagnostics,
                        "compiler adjusted the plan"
                    );
                }
                let node = payload(&compiled)?;
                self.record(state, stage, node).await?;
                state.compiled = Some(compiled);
            }
            Stage::SqlSafety => {
                let compiled = require(&state.compiled, "compiled query")?;
                let report = self.validator.validate(&compiled.sql);
                let node = payload(&report)?;
                self.record(state, stage, node).await?;
                if !report.ok {
                    return Ok(StageOutcome::Halt(Halt::Rejected(report)));
                }
                state.safety = Some(report);
            }
            Stage::Execute => {
                let compiled = require(&state.compiled, "compiled query")?;
                let safety = require(&state.safety, "safety report")?;
                let sql = safety.normalized_sql.as_deref().unwrap_or(&compiled.sql);
                let (result, meta) = self.executor.run(sql, &compiled.params).await?;
                let node = payload(&meta)?;
                self.record(state, stage, node).await?;
                state.result = Some(result);
                state.meta = Some(meta);
            }
            Stage::DataValidation => {
                let result = require(&state.result, "result")?;
                let plan = require(&state.plan, "plan")?;
                let report = self.quality.check(result, &plan.expected_columns);
                let node = payload(&report)?;
                self.record(state, stage, node).await?;
                if !report.ok {
                    return Ok(StageOutcome::Halt(Halt::FailedDataQuality(report)));
                }
                state.quality = Some(report);
            }
            Stage::Insights => {
                let result = require(&state.result, "result")?;
                let plan = require(&state.plan, "plan")?;
                let insights = self.insights.summarize(result, plan);
                let node = payload(&insights)?;
                self.record(state, stage, node).await?;
                state.insights = Some(insights);
            }
            Stage::Dashboard => {
                let result = require(&state.result, "result")?;
                let plan = require(&state.plan, "plan")?;
                let insights = require(&state.insights, "insights")?;
                let meta = self.dashboard.build(result, plan, insights);
                let node = payload(&meta)?;
                self.record(state, stage, node).await?;
                state.dashboard = Some(meta);
            }
            Stage::Render => {
                let result = require(&state.result, "result")?;
                let node = json!({
                    "ok": true,
                    "columns": result.column_names(),
                    "preview_rows": result.row_count().min(PREVIEW_ROWS),
                });
                self.record(state, stage, node).await?;
            }
            Stage::CritiqueRollup => {
                let summary = rollup(&state.critiques);
                self.traces
                    .add_node(&state.run_id, stage.name(), payload(&summary)?)
                    .await?;
                state.rollup = Some(summary);
            }
        }
        Ok(StageOutcome::Continue)
    }

    async fn human_review(&self, state: &mut RunState) -> Result<StageOutcome> {
        let stage = Stage::HumanReview;
        let plan = require(&state.plan, "plan")?.clone();
        let intent = require(&state.intent, "intent")?;
        let packet = ReviewPacket::new(&plan, intent, &state.allowed_tables);
        self.traces
            .add_node(&state.run_id, stage.name(), payload(&packet)?)
            .await?;

        let edited = state.edits.is_some();
        if let Some(edits) = state.edits.take() {
            let applied = edits.apply(
                plan,
                std::mem::take(&mut state.allowed_tables),
                self.compiler.registry(),
            );
            info!(
                run_id = %state.run_id,
                fields = ?applied.applied_fields,
                "review edits applied"
            );
            self.traces
                .add_node(
                    &state.run_id,
                    &format!("{}{APPLIED_SUFFIX}", stage.name()),
                    payload(&applied)?,
                )
                .await?;
            state.allowed_tables = applied.allowed_tables;
            state.plan = Some(applied.plan);
        }

        let review = critique(
            stage,
            &json!({ "plan": state.plan, "edits_applied": edited }),
        );
        self.traces
            .add_node(&state.run_id, &stage.critique_node(), payload(&review)?)
            .await?;
        state.critiques.push(review.clone());

        if review.force_human_review && !edited {
            return Ok(StageOutcome::Halt(Halt::NeedsHumanReview(Box::new(packet))));
        }
        Ok(StageOutcome::Continue)
    }

    async fn halt(&self, state: &mut RunState, halt: Halt) -> Result<RunReport> {
        let status = match &halt {
            Halt::NeedsHumanReview(_) => RunStatus::NeedsHumanReview,
            Halt::Rejected(_) => RunStatus::Rejected,
            Halt::FailedDataQuality(_) => RunStatus::FailedDataQuality,
        };
        self.traces.finalize(&state.run_id, status).await?;
        info!(run_id = %state.run_id, ?status, "pipeline run halted");

        let mut report = RunReport::new(&state.run_id, status);
        match halt {
            Halt::NeedsHumanReview(packet) => report.review_packet = Some(*packet),
            Halt::Rejected(safety) => report.rejection = Some(safety),
            Halt::FailedDataQuality(quality) => report.data_quality = Some(quality),
        }
        Ok(report)
    }

    async fn fail(&self, state: &mut RunState, stage: Stage, err: ServiceError) -> Result<RunReport> {
        warn!(run_id = %state.run_id, stage = stage.name(), error = %err, "pipeline stage failed");
        self.traces
            .add_error(&state.run_id, stage.name(), &err.to_string(), &err.detail())
            .await?;
        self.traces.finalize(&state.run_id, RunStatus::Failed).await?;

        let mut report = RunReport::new(&state.run_id, RunStatus::Failed);
        report.error = Some(format!("{} failed: {err}", stage.name()));
        Ok(report)
    }

    async fn succeed(&self, state: &mut RunState) -> Result<RunReport> {
        let missing = || ServiceError::Internal(anyhow::anyhow!("run finished with missing stage output"));
        let compiled = state.compiled.take().ok_or_else(missing)?;
        let safety = state.safety.take().ok_or_else(missing)?;
        let result = state.result.take().ok_or_else(missing)?;

        let success = RunSuccess {
            plan: state.plan.take().ok_or_else(missing)?,
            sql: safety.normalized_sql.unwrap_or(compiled.sql),
            params: compiled.params,
            exec_meta: state.meta.take().ok_or_else(missing)?,
            data_quality: state.quality.take().ok_or_else(missing)?,
            insights: state.insights.take().ok_or_else(missing)?,
            dashboard: state.dashboard.take().ok_or_else(missing)?,
            preview: result.to_records().into_iter().take(PREVIEW_ROWS).collect(),
            columns: result.column_names().into_iter().map(str::to_string).collect(),
            rows: result.row_count(),
            critique: state.rollup.take().ok_or_else(missing)?,
        };

        self.traces.finalize(&state.run_id, RunStatus::Success).await?;
        info!(run_id = %state.run_id, rows = success.rows, "pipeline run succeeded");

        let mut report = RunReport::new(&state.run_id, RunStatus::Success);
        report.result = Some(Box::new(success));
        Ok(report)
    }
}
