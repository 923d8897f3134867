//! Query plan documents, human-review patches and catalog rows.

use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueryPlan {
    pub tables: Vec<String>,
    pub joins: Vec<Join>,
    pub metrics: Vec<Metric>,
    pub dimensions: Vec<String>,
    pub filters: Vec<Filter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_granularity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_range: Option<String>,
    pub order_by: Vec<OrderBy>,
    pub aggregation: bool,
    pub group_by: Vec<String>,
    pub large_mode: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_cost_risk: Option<CostRisk>,
    pub visuals: Vec<Value>,
    pub notes: String,
    pub expected_columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Join {
    pub left_table: String,
    pub right_table: String,
    pub left_key: String,
    pub right_key: String,
    #[serde(default = "default_join_type")]
    pub join_type: String,
}

fn default_join_type() -> String {
    "LEFT".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Metric {
    pub name: String,
    #[serde(default, alias = "aggregation", skip_serializing_if = "Option::is_none")]
    pub agg: Option<String>,
    #[serde(default, alias = "source_field", skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Filter {
    pub field: String,
    #[serde(default = "default_filter_op", alias = "operator")]
    pub op: String,
    #[serde(default)]
    pub value: Value,
}

fn default_filter_op() -> String {
    "=".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderBy {
    pub field: String,
    #[serde(default)]
    pub direction: OrderDirection,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderDirection {
    #[default]
    #[serde(alias = "ASC")]
    Asc,
    #[serde(alias = "DESC")]
    Desc,
}

impl OrderDirection {
    pub fn as_sql(self) -> &'static str {
        match self {
            OrderDirection::Asc => "ASC",
            OrderDirection::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum CostRisk {
    Low,
    Medium,
    High,
}

impl CostRisk {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" => Some(CostRisk::Low),
            "medium" | "med" => Some(CostRisk::Medium),
            "high" => Some(CostRisk::High),
            _ => None,
        }
    }
}

/// Partial plan edit: only present fields overwrite the plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlanPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tables: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub joins: Option<Vec<Join>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Vec<Metric>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<Vec<Filter>>,
    #[serde(
        default,
        with = "::serde_with::rust::double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub time_field: Option<Option<String>>,
    #[serde(
        default,
        with = "::serde_with::rust::double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub time_granularity: Option<Option<String>>,
    #[serde(
        default,
        with = "::serde_with::rust::double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub time_range: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_by: Option<Vec<OrderBy>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_by: Option<Vec<String>>,
    #[serde(
        default,
        with = "::serde_with::rust::double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub query_cost_risk: Option<Option<CostRisk>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visuals: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

macro_rules! apply_fields {
    ($plan:expr, $patch:expr, $applied:expr, [$($field:ident),* $(,)?]) => {
        $(
            if let Some(value) = $patch.$field {
                $plan.$field = value;
                $applied.push(stringify!($field));
            }
        )*
    };
}

impl QueryPlan {
    /// Overwrites the fields present in `patch`, returning their names.
    pub fn apply_patch(&mut self, patch: PlanPatch) -> Vec<&'static str> {
        let mut applied = Vec::new();
        apply_fields!(
            self,
            patch,
            applied,
            [
                tables,
                joins,
                metrics,
                dimensions,
                filters,
                time_field,
                time_granularity,
                time_range,
                order_by,
                aggregation,
                group_by,
                query_cost_risk,
                visuals,
                notes,
            ]
        );
        applied
    }

    /// Parses an untrusted proposer document. Malformed fields and list
    /// elements are skipped and described in the returned diagnostics.
    pub fn from_untrusted(doc: &Value) -> (Self, Vec<String>) {
        let mut diagnostics = Vec::new();
        let mut plan = QueryPlan::default();

        let Some(obj) = doc.as_object() else {
            if !doc.is_null() {
                diagnostics.push("plan document is not an object; using an empty plan".into());
            }
            return (plan, diagnostics);
        };

        plan.tables = string_list(obj, "tables", &mut diagnostics);
        plan.dimensions = string_list(obj, "dimensions", &mut diagnostics);
        plan.group_by = string_list(obj, "group_by", &mut diagnostics);
        plan.expected_columns = string_list(obj, "expected_columns", &mut diagnostics);
        plan.joins = typed_list(obj, "joins", &mut diagnostics);
        plan.metrics = typed_list(obj, "metrics", &mut diagnostics);
        plan.filters = typed_list(obj, "filters", &mut diagnostics);
        plan.order_by = order_list(obj, &mut diagnostics);

        plan.time_field = optional_string(obj, "time_field", &mut diagnostics);
        plan.time_granularity = optional_string(obj, "time_granularity", &mut diagnostics)
            .or_else(|| optional_string(obj, "granularity", &mut diagnostics));
        plan.time_range = optional_string(obj, "time_range", &mut diagnostics);

        plan.aggregation = flag(obj, "aggregation", &mut diagnostics);
        plan.large_mode = flag(obj, "large_mode", &mut diagnostics);

        plan.query_cost_risk = match obj.get("query_cost_risk") {
            None | Some(Value::Null) => None,
            Some(Value::String(raw)) => {
                let risk = CostRisk::parse(raw);
                if risk.is_none() {
                    diagnostics.push(format!("ignored unknown query_cost_risk '{raw}'"));
                }
                risk
            }
            Some(other) => {
                diagnostics.push(format!("ignored non-string query_cost_risk {other}"));
                None
            }
        };

        plan.visuals = match obj.get("visuals") {
            Some(Value::Array(items)) => items.clone(),
            None | Some(Value::Null) => Vec::new(),
            Some(_) => {
                diagnostics.push("ignored non-list field 'visuals'".into());
                Vec::new()
            }
        };

        plan.notes = match obj.get("notes") {
            Some(Value::String(notes)) => notes.clone(),
            None | Some(Value::Null) => String::new(),
            Some(other) => other.to_string(),
        };

        (plan, diagnostics)
    }
}

fn list_field<'a>(
    obj: &'a Map<String, Value>,
    key: &str,
    diagnostics: &mut Vec<String>,
) -> &'a [Value] {
    match obj.get(key) {
        Some(Value::Array(items)) => items,
        None | Some(Value::Null) => &[],
        Some(_) => {
            diagnostics.push(format!("ignored non-list field '{key}'"));
            &[]
        }
    }
}

fn string_list(obj: &Map<String, Value>, key: &str, diagnostics: &mut Vec<String>) -> Vec<String> {
    let mut out = Vec::new();
    for (idx, item) in list_field(obj, key, diagnostics).iter().enumerate() {
        match item.as_str().map(str::trim) {
            Some(value) if !value.is_empty() => out.push(value.to_string()),
            _ => diagnostics.push(format!("dropped {key}[{idx}]: expected a non-empty string")),
        }
    }
    out
}

fn typed_list<T: serde::de::DeserializeOwned>(
    obj: &Map<String, Value>,
    key: &str,
    diagnostics: &mut Vec<String>,
) -> Vec<T> {
    let mut out = Vec::new();
    for (idx, item) in list_field(obj, key, diagnostics).iter().enumerate() {
        match serde_json::from_value::<T>(item.clone()) {
            Ok(parsed) => out.push(parsed),
            Err(err) => diagnostics.push(format!("dropped {key}[{idx}]: {err}")),
        }
    }
    out
}

fn order_list(obj: &Map<String, Value>, diagnostics: &mut Vec<String>) -> Vec<OrderBy> {
    let mut out = Vec::new();
    for (idx, item) in list_field(obj, "order_by", diagnostics).iter().enumerate() {
        match item {
            Value::String(raw) => {
                let mut parts = raw.split_whitespace();
                let Some(field) = parts.next() else {
                    diagnostics.push(format!("dropped order_by[{idx}]: empty entry"));
                    continue;
                };
                let direction = match parts.next().map(str::to_ascii_lowercase).as_deref() {
                    Some("desc") => OrderDirection::Desc,
                    _ => OrderDirection::Asc,
                };
                out.push(OrderBy {
                    field: field.to_string(),
                    direction,
                });
            }
            other => match serde_json::from_value::<OrderBy>(other.clone()) {
                Ok(parsed) => out.push(parsed),
                Err(err) => diagnostics.push(format!("dropped order_by[{idx}]: {err}")),
            },
        }
    }
    out
}

fn optional_string(
    obj: &Map<String, Value>,
    key: &str,
    diagnostics: &mut Vec<String>,
) -> Option<String> {
    match obj.get(key) {
        Some(Value::String(value)) if !value.trim().is_empty() => Some(value.trim().to_string()),
        None | Some(Value::Null) | Some(Value::String(_)) => None,
        Some(other) => {
            diagnostics.push(format!("ignored non-string field '{key}': {other}"));
            None
        }
    }
}

fn flag(obj: &Map<String, Value>, key: &str, diagnostics: &mut Vec<String>) -> bool {
    match obj.get(key) {
        Some(Value::Bool(value)) => *value,
        None | Some(Value::Null) => false,
        Some(other) => {
            diagnostics.push(format!("ignored non-boolean field '{key}': {other}"));
            false
        }
    }
}

/// Row of the local snapshot catalog.
#[derive(Debug, Clone, Queryable, Selectable, Insertable, Serialize, PartialEq)]
#[diesel(table_name = crate::schema::cache_catalog)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct CatalogEntry {
    pub cache_key: String,
    pub snapshot_path: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}
