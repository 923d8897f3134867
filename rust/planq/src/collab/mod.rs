//! Collaborators the pipeline drives around the compile/validate/execute core.

pub mod dashboard;
pub mod insights;
pub mod planner;
pub mod quality;

use crate::models::QueryPlan;
use crate::result::ResultSet;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

pub use dashboard::{DashboardMeta, VizDashboard};
pub use insights::{BasicInsights, Insights};
pub use planner::{FallbackPlanProposer, HttpPlanProposer, Intent, SchemaReasoning};
pub use quality::{BasicQualityChecker, QualityReport};

/// The plan proposer could not answer; callers fall back to empty documents.
#[derive(Debug, Clone, Error)]
#[error("plan proposer unavailable: {0}")]
pub struct Unavailable(pub String);

#[derive(Debug, Clone, Serialize)]
pub struct PlanRequest<'a> {
    pub question: &'a str,
    pub intent: &'a Intent,
    pub candidate_tables: &'a [String],
    pub schema_snapshot: Value,
}

/// Source of untrusted intent and plan documents. Nothing it returns is
/// used without registry and allowlist filtering.
#[async_trait]
pub trait PlanProposer: Send + Sync {
    async fn extract_intent(
        &self,
        question: &str,
        allowed_tables: &[String],
    ) -> Result<Value, Unavailable>;

    async fn propose_plan(&self, request: &PlanRequest<'_>) -> Result<Value, Unavailable>;
}

pub trait QualityChecker: Send + Sync {
    fn check(&self, result: &ResultSet, expected_columns: &[String]) -> QualityReport;
}

pub trait InsightSummarizer: Send + Sync {
    fn summarize(&self, result: &ResultSet, plan: &QueryPlan) -> Insights;
}

pub trait DashboardBuilder: Send + Sync {
    fn build(&self, result: &ResultSet, plan: &QueryPlan, insights: &Insights) -> DashboardMeta;
}
