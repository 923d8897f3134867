use super::Stage;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const BASE_CONFIDENCE: f64 = 0.7;
const EMPTY_CONFIDENCE: f64 = 0.2;
const MISSING_TABLES_CONFIDENCE: f64 = 0.2;
const HIGH_RISK_CONFIDENCE: f64 = 0.5;
const FAILED_CHECK_CONFIDENCE: f64 = 0.1;
const MAX_ROLLUP_ISSUES: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CritiqueResult {
    pub stage: String,
    pub confidence: f64,
    pub force_human_review: bool,
    pub issues: Vec<String>,
    pub recommendation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CritiqueRollup {
    pub min_confidence: f64,
    pub force_human_review_any: bool,
    pub issues: Vec<String>,
    pub stages: usize,
}

fn is_empty_payload(payload: &Value) -> bool {
    match payload {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Deterministic post-stage review. Human review is judged on the plan it
/// is about to release.
pub fn critique(stage: Stage, payload: &Value) -> CritiqueResult {
    let mut issues = Vec::new();
    let mut confidence = BASE_CONFIDENCE;
    let mut force = false;

    if is_empty_payload(payload) {
        issues.push("Stage produced an empty payload.".to_string());
        confidence = EMPTY_CONFIDENCE;
        force = true;
    }

    let plan = match stage {
        Stage::Plan => Some(payload),
        Stage::HumanReview => payload.get("plan"),
        _ => None,
    };
    if let Some(plan) = plan {
        let has_tables = plan
            .get("tables")
            .and_then(Value::as_array)
            .is_some_and(|tables| !tables.is_empty());
        if !has_tables {
            issues.push("Plan has no tables.".to_string());
            confidence = MISSING_TABLES_CONFIDENCE;
            force = true;
        }
        if plan.get("query_cost_risk").and_then(Value::as_str) == Some("high") {
            issues.push("Query cost risk is high; human review recommended.".to_string());
            confidence = confidence.min(HIGH_RISK_CONFIDENCE);
            force = true;
        }
    }

    let check_failed = !payload.get("ok").and_then(Value::as_bool).unwrap_or(false);
    match stage {
        // Rejection already halts the run.
        Stage::SqlSafety if check_failed => {
            issues.push("Safety validation failed.".to_string());
            confidence = FAILED_CHECK_CONFIDENCE;
        }
        Stage::DataValidation if check_failed => {
            issues.push("Data quality checks failed; cannot proceed.".to_string());
            confidence = FAILED_CHECK_CONFIDENCE;
            force = true;
        }
        _ => {}
    }

    CritiqueResult {
        stage: stage.name().to_string(),
        confidence,
        force_human_review: force,
        issues,
        recommendation: if force { "Needs human review" } else { "Proceed" }.to_string(),
    }
}

pub fn rollup(critiques: &[CritiqueResult]) -> CritiqueRollup {
    let mut issues: Vec<String> = critiques
        .iter()
        .flat_map(|c| c.issues.iter().cloned())
        .collect();
    issues.truncate(MAX_ROLLUP_ISSUES);

    CritiqueRollup {
        min_confidence: critiques
            .iter()
            .map(|c| c.confidence)
            .fold(1.0, f64::min),
        force_human_review_any: critiques.iter().any(|c| c.force_human_review),
        issues,
        stages: critiques.len(),
    }
}
