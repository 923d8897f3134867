use crate::collab::planner::filter_tables;
use crate::collab::Intent;
use crate::models::{PlanPatch, QueryPlan};
use crate::registry::SchemaRegistry;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const REVIEW_MODE: &str = "E_HUMAN_REVIEW";

const INSTRUCTIONS: [&str; 3] = [
    "Approve or edit only what you want changed.",
    "If you remove tables, make sure joins and metrics still make sense.",
    "Edits must be explicit; unstated changes are never inferred.",
];

const EDITABLE_FIELDS: [&str; 16] = [
    "allowed_tables",
    "large_mode",
    "plan.tables",
    "plan.joins",
    "plan.metrics",
    "plan.dimensions",
    "plan.filters",
    "plan.time_field",
    "plan.time_granularity",
    "plan.time_range",
    "plan.order_by",
    "plan.aggregation",
    "plan.group_by",
    "plan.query_cost_risk",
    "plan.visuals",
    "plan.notes",
];

/// What a halted run hands back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReviewPacket {
    pub mode: String,
    pub instructions: Vec<String>,
    pub current_allowed_tables: Vec<String>,
    pub proposed_plan: QueryPlan,
    pub intent: Intent,
    pub editable_fields: Vec<String>,
    pub edit_schema: Value,
}

impl ReviewPacket {
    pub fn new(plan: &QueryPlan, intent: &Intent, allowed_tables: &[String]) -> Self {
        Self {
            mode: REVIEW_MODE.to_string(),
            instructions: INSTRUCTIONS.iter().map(|s| s.to_string()).collect(),
            current_allowed_tables: allowed_tables.to_vec(),
            proposed_plan: plan.clone(),
            intent: intent.clone(),
            editable_fields: EDITABLE_FIELDS.iter().map(|s| s.to_string()).collect(),
            edit_schema: json!({
                "allowed_tables": "list[str] (subset of available tables)",
                "plan": "object (same shape as proposed_plan; only present fields are applied)",
                "large_mode": "bool",
            }),
        }
    }
}

/// Explicit human edits; absent fields leave the run untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReviewEdits {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_tables: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanPatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub large_mode: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppliedReview {
    pub ok: bool,
    pub allowed_tables: Vec<String>,
    pub plan: QueryPlan,
    pub applied_fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dropped_tables: Vec<String>,
}

impl ReviewEdits {
    /// Applies the edits and revalidates plan tables against the registry
    /// and the resulting allowlist.
    pub fn apply(
        self,
        mut plan: QueryPlan,
        allowed_tables: Vec<String>,
        registry: &SchemaRegistry,
    ) -> AppliedReview {
        let mut applied_fields = Vec::new();

        let allowed_tables = match self.allowed_tables {
            Some(tables) => {
                applied_fields.push("allowed_tables".to_string());
                tables
            }
            None => allowed_tables,
        };
        if let Some(patch) = self.plan {
            applied_fields.extend(
                plan.apply_patch(patch)
                    .into_iter()
                    .map(|field| format!("plan.{field}")),
            );
        }
        if let Some(large_mode) = self.large_mode {
            plan.large_mode = large_mode;
            applied_fields.push("large_mode".to_string());
        }

        let kept = filter_tables(registry, &plan.tables, &allowed_tables);
        let dropped_tables = plan
            .tables
            .iter()
            .filter(|t| !kept.contains(*t))
            .cloned()
            .collect();
        plan.tables = kept;

        AppliedReview {
            ok: true,
            allowed_tables,
            plan,
            applied_fields,
            dropped_tables,
        }
    }
}
