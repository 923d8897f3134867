use super::{PlanProposer, PlanRequest, Unavailable};
use crate::models::{CostRisk, QueryPlan};
use crate::registry::SchemaRegistry;
use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, warn};

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "to", "of", "in", "for", "by", "with", "show", "give", "me",
    "create", "dashboard",
];
const TABLE_HIT: u32 = 3;
const COLUMN_HIT: u32 = 1;
const MAX_CANDIDATES: usize = 12;
const MAX_SCORING: usize = 20;
const FALLBACK_TABLES: usize = 2;
const DEFAULT_INTENT_CONFIDENCE: f64 = 0.4;
const HIGH_RISK_ROWS: u128 = 1_000_000_000_000_000_000;
const MEDIUM_RISK_ROWS: u128 = 100_000_000_000_000;

/// Posts JSON requests to an external reasoning service.
#[derive(Clone)]
pub struct HttpPlanProposer {
    client: Client,
    base_url: String,
}

impl HttpPlanProposer {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<Value, Unavailable> {
        let response = self
            .client
            .post(format!("{}/{path}", self.base_url))
            .json(body)
            .send()
            .await
            .map_err(|err| Unavailable(err.to_string()))?;

        if response.status() != StatusCode::OK {
            return Err(Unavailable(format!(
                "{path} returned status {}",
                response.status()
            )));
        }

        let doc = response
            .json::<Value>()
            .await
            .map_err(|err| Unavailable(format!("{path} returned invalid JSON: {err}")))?;
        debug!(path, "plan proposer responded");
        Ok(doc)
    }
}

#[async_trait]
impl PlanProposer for HttpPlanProposer {
    async fn extract_intent(
        &self,
        question: &str,
        allowed_tables: &[String],
    ) -> Result<Value, Unavailable> {
        self.post(
            "intent",
            &json!({ "question": question, "allowed_tables": allowed_tables }),
        )
        .await
    }

    async fn propose_plan(&self, request: &PlanRequest<'_>) -> Result<Value, Unavailable> {
        self.post("plan", request).await
    }
}

/// Answers with empty documents, leaving table choice to schema reasoning.
#[derive(Debug, Clone, Copy, Default)]
pub struct FallbackPlanProposer;

#[async_trait]
impl PlanProposer for FallbackPlanProposer {
    async fn extract_intent(&self, _question: &str, _allowed: &[String]) -> Result<Value, Unavailable> {
        Ok(json!({}))
    }

    async fn propose_plan(&self, _request: &PlanRequest<'_>) -> Result<Value, Unavailable> {
        Ok(json!({}))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Intent {
    pub kpis: Vec<Value>,
    pub dimensions: Vec<Value>,
    pub time_range: Option<String>,
    pub granularity: Option<String>,
    pub segments: Vec<Value>,
    pub filters: Vec<Value>,
    pub confidence: f64,
    pub notes: String,
}

impl Default for Intent {
    fn default() -> Self {
        Self {
            kpis: Vec::new(),
            dimensions: Vec::new(),
            time_range: None,
            granularity: None,
            segments: Vec::new(),
            filters: Vec::new(),
            confidence: DEFAULT_INTENT_CONFIDENCE,
            notes: String::new(),
        }
    }
}

impl Intent {
    /// Reads an untrusted intent document; wrong-typed fields keep their defaults.
    pub fn from_document(doc: &Value) -> Self {
        let list = |key: &str| match doc.get(key) {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        };
        let text = |key: &str| doc.get(key).and_then(Value::as_str).map(str::to_string);

        Self {
            kpis: list("kpis"),
            dimensions: list("dimensions"),
            time_range: text("time_range"),
            granularity: text("granularity"),
            segments: list("segments"),
            filters: list("filters"),
            confidence: doc
                .get("confidence")
                .and_then(Value::as_f64)
                .filter(|c| (0.0..=1.0).contains(c))
                .unwrap_or(DEFAULT_INTENT_CONFIDENCE),
            notes: text("notes").unwrap_or_default(),
        }
    }

    fn words(&self) -> impl Iterator<Item = &str> {
        self.kpis
            .iter()
            .chain(&self.dimensions)
            .chain(&self.segments)
            .filter_map(Value::as_str)
            .chain(std::iter::once(self.notes.as_str()))
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TableScore {
    pub table: String,
    pub score: u32,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SchemaReasoning {
    pub candidate_tables: Vec<String>,
    pub scoring: Vec<TableScore>,
}

fn keywords(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .map(str::to_ascii_lowercase)
        .filter(|word| word.len() > 2 && !STOPWORDS.contains(&word.as_str()))
}

/// Scores allowed registry tables by keyword hits in table and column names.
pub fn schema_reasoning(
    registry: &SchemaRegistry,
    question: &str,
    intent: &Intent,
    allowed_tables: &[String],
) -> SchemaReasoning {
    let words: BTreeSet<String> = std::iter::once(question)
        .chain(intent.words())
        .flat_map(keywords)
        .collect();

    let mut scoring: Vec<TableScore> = registry
        .tables
        .iter()
        .filter(|(table, _)| allowed_tables.is_empty() || allowed_tables.contains(*table))
        .map(|(table, info)| {
            let table_name = table.to_ascii_lowercase();
            let columns: Vec<String> = info
                .columns
                .iter()
                .map(|c| c.name.to_ascii_lowercase())
                .collect();
            let score = words
                .iter()
                .map(|word| {
                    let mut hit = 0;
                    if table_name.contains(word.as_str()) {
                        hit += TABLE_HIT;
                    }
                    if columns.iter().any(|c| c.contains(word.as_str())) {
                        hit += COLUMN_HIT;
                    }
                    hit
                })
                .sum();
            TableScore {
                table: table.clone(),
                score,
            }
        })
        .collect();

    scoring.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.table.cmp(&b.table)));
    let candidate_tables = scoring
        .iter()
        .filter(|s| s.score > 0)
        .take(MAX_CANDIDATES)
        .map(|s| s.table.clone())
        .collect();
    scoring.truncate(MAX_SCORING);

    SchemaReasoning {
        candidate_tables,
        scoring,
    }
}

/// Keeps tables present in the registry and, when non-empty, the allowlist.
pub fn filter_tables(registry: &SchemaRegistry, tables: &[String], allowed: &[String]) -> Vec<String> {
    tables
        .iter()
        .filter(|t| registry.has_table(t))
        .filter(|t| allowed.is_empty() || allowed.contains(*t))
        .cloned()
        .collect()
}

/// Coarse risk from the product of the first three tables' row counts.
pub fn estimate_cost_risk(registry: &SchemaRegistry, tables: &[String]) -> CostRisk {
    if tables.is_empty() {
        return CostRisk::Low;
    }
    let product = tables
        .iter()
        .take(3)
        .map(|t| u128::from(registry.row_count(t).max(1)))
        .fold(1u128, u128::saturating_mul);
    if product > HIGH_RISK_ROWS {
        CostRisk::High
    } else if product > MEDIUM_RISK_ROWS {
        CostRisk::Medium
    } else {
        CostRisk::Low
    }
}

#[derive(Debug, Clone)]
pub struct ProposedPlan {
    pub plan: QueryPlan,
    pub diagnostics: Vec<String>,
}

/// Turns a proposer document into a plan restricted to known, allowed tables.
pub fn finalize_plan(
    registry: &SchemaRegistry,
    doc: &Value,
    candidates: &[String],
    allowed_tables: &[String],
    large_mode: bool,
) -> ProposedPlan {
    let (mut plan, mut diagnostics) = QueryPlan::from_untrusted(doc);

    let tables = filter_tables(registry, &plan.tables, allowed_tables);
    if tables.len() < plan.tables.len() {
        diagnostics.push(format!(
            "dropped {} proposed table(s) outside the registry or allowlist",
            plan.tables.len() - tables.len()
        ));
    }
    plan.tables = if tables.is_empty() {
        let fallback: Vec<String> = filter_tables(registry, candidates, allowed_tables)
            .into_iter()
            .take(FALLBACK_TABLES)
            .collect();
        if !fallback.is_empty() {
            diagnostics.push(format!(
                "no usable proposed tables; using candidates {}",
                fallback.join(", ")
            ));
        }
        fallback
    } else {
        tables
    };

    if plan.query_cost_risk.is_none() {
        plan.query_cost_risk = Some(estimate_cost_risk(registry, &plan.tables));
    }
    plan.large_mode = large_mode;

    if !diagnostics.is_empty() {
        warn!(count = diagnostics.len(), "proposed plan needed cleanup");
    }
    ProposedPlan { plan, diagnostics }
}
