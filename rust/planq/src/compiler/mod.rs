//! Plan compiler: turns a [`QueryPlan`] into one parameterized SELECT.
//!
//! Plan defects never fail a compile. Unknown tables are filtered out (and
//! recovered from when nothing survives), unusable joins, filters and metrics
//! are dropped, and every such decision is recorded in
//! [`CompiledQuery::diagnostics`].

mod columns;
mod filters;
mod joins;

pub use columns::{quote_ident, quote_table, resolve_column, safe_alias, AliasMap, ColumnRef};

use crate::error::{Result, ServiceError};
use crate::models::QueryPlan;
use crate::registry::SchemaRegistry;
use crate::time::TimeGrain;
use chrono::{DateTime, Utc};
use columns::{is_emittable, Aggregate};
use filters::WhereBuilder;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

const FALLBACK_COLUMNS: usize = 12;
const RECOVERY_TABLES: usize = 2;

/// Named bind values in emission order. Serialized as a JSON object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params(Vec<(String, Value)>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces `name`.
    pub fn push(&mut self, name: &str, value: Value) {
        match self.0.iter_mut().find(|(existing, _)| existing == name) {
            Some(slot) => slot.1 = value,
            None => self.0.push((name.to_string(), value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| value)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Pairs sorted by name, the order used for fingerprinting.
    pub fn sorted(&self) -> Vec<(&str, &Value)> {
        let mut pairs: Vec<_> = self.iter().collect();
        pairs.sort_by(|a, b| a.0.cmp(b.0));
        pairs
    }
}

impl<S: Into<String>> FromIterator<(S, Value)> for Params {
    fn from_iter<I: IntoIterator<Item = (S, Value)>>(iter: I) -> Self {
        let mut params = Params::new();
        for (name, value) in iter {
            params.push(&name.into(), value);
        }
        params
    }
}

impl Serialize for Params {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Params {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let map = serde_json::Map::<String, Value>::deserialize(deserializer)?;
        Ok(map.into_iter().collect())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Params,
    pub expected_columns: Vec<String>,
    pub is_aggregated: bool,
    pub row_cap: i64,
    pub recovered_tables: bool,
    pub tables: Vec<String>,
    pub diagnostics: Vec<String>,
}

#[derive(Debug, Clone)]
struct SelectItem {
    expr: String,
    alias: String,
    aggregate: bool,
}

impl SelectItem {
    fn column(column: &ColumnRef) -> Self {
        Self {
            expr: column.expr.clone(),
            alias: column.column.clone(),
            aggregate: false,
        }
    }

    fn render(&self) -> String {
        format!("{} AS {}", self.expr, quote_ident(&self.alias))
    }
}

#[derive(Clone)]
pub struct Compiler {
    registry: Arc<SchemaRegistry>,
    exploratory_cap: i64,
    large_cap: i64,
}

impl Compiler {
    pub fn new(registry: Arc<SchemaRegistry>, exploratory_cap: i64, large_cap: i64) -> Self {
        Self {
            registry,
            exploratory_cap: exploratory_cap.max(1),
            large_cap: large_cap.max(1),
        }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn row_cap(&self, large_mode: bool) -> i64 {
        if large_mode {
            self.large_cap
        } else {
            self.exploratory_cap
        }
    }

    /// Compiles `plan`, writing recovered tables and `expected_columns` back
    /// onto it. `large_mode` overrides the plan's own flag when given.
    pub fn compile(
        &self,
        plan: &mut QueryPlan,
        allowed_tables: &[String],
        large_mode: Option<bool>,
    ) -> Result<CompiledQuery> {
        self.compile_at(plan, allowed_tables, large_mode, Utc::now())
    }

    /// [`Compiler::compile`] with an explicit clock for time-range presets.
    pub fn compile_at(
        &self,
        plan: &mut QueryPlan,
        allowed_tables: &[String],
        large_mode: Option<bool>,
        now: DateTime<Utc>,
    ) -> Result<CompiledQuery> {
        let registry = self.registry.as_ref();
        let mut diagnostics = Vec::new();

        let usable: Vec<&str> = registry
            .table_keys()
            .filter(|table| is_emittable(table))
            .collect();
        if usable.is_empty() {
            return Err(ServiceError::Config(
                "schema registry has no usable tables".to_string(),
            ));
        }

        let (tables, recovered) =
            self.resolve_tables(plan, allowed_tables, &usable, &mut diagnostics);
        let primary = tables[0].clone();

        let (aliases, join_clauses) = joins::build_join_graph(
            &primary,
            &tables,
            &plan.joins,
            registry,
            &mut diagnostics,
        );

        let mut is_aggregated = plan.aggregation
            || !plan.group_by.is_empty()
            || plan
                .metrics
                .iter()
                .any(|m| m.agg.as_deref().is_some_and(|agg| !agg.trim().is_empty()));

        let mut items = Vec::new();
        self.select_dimensions(plan, &aliases, is_aggregated, &mut items, &mut diagnostics);
        self.select_metrics(plan, &aliases, is_aggregated, &mut items, &mut diagnostics);

        if items.is_empty() {
            let fallback: Vec<SelectItem> = registry
                .column_names(&primary)
                .into_iter()
                .filter(|name| is_emittable(name))
                .take(FALLBACK_COLUMNS)
                .map(|name| SelectItem {
                    expr: format!("t0.{}", quote_ident(name)),
                    alias: name.to_string(),
                    aggregate: false,
                })
                .collect();
            if fallback.is_empty() {
                return Err(ServiceError::Config(format!(
                    "table {primary} has no usable columns in the schema registry"
                )));
            }
            diagnostics.push(format!(
                "no resolvable output columns; selecting the first {} columns of {primary}",
                fallback.len()
            ));
            items = fallback;
            is_aggregated = false;
        }

        let items = dedupe_by_alias(items, &mut diagnostics);

        let mut where_builder = WhereBuilder::default();
        where_builder.add_filters(&plan.filters, &aliases, registry, &mut diagnostics);
        if let Some(range) = plan.time_range.as_deref() {
            where_builder.add_time_range(
                plan.time_field.as_deref(),
                range,
                now,
                &aliases,
                registry,
                &mut diagnostics,
            );
        }
        let (where_clause, params) = where_builder.finish();

        let group_keys: Vec<&str> = if is_aggregated {
            items
                .iter()
                .filter(|item| !item.aggregate)
                .map(|item| item.expr.as_str())
                .collect()
        } else {
            Vec::new()
        };

        let order_terms = self.order_terms(plan, &aliases, &items, is_aggregated, &mut diagnostics);

        let large = large_mode.unwrap_or(plan.large_mode);
        let row_cap = self.row_cap(large);

        let mut sql = format!(
            "SELECT {} FROM {} AS t0",
            items.iter().map(SelectItem::render).collect::<Vec<_>>().join(", "),
            quote_table(&primary)
        );
        for clause in &join_clauses {
            sql.push(' ');
            sql.push_str(clause);
        }
        if let Some(clause) = where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(&clause);
        }
        if !group_keys.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&group_keys.join(", "));
        }
        if !order_terms.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&order_terms.join(", "));
        }
        sql.push_str(&format!(" LIMIT {row_cap}"));

        let expected_columns: Vec<String> = items.iter().map(|item| item.alias.clone()).collect();
        plan.expected_columns = expected_columns.clone();

        let final_tables: Vec<String> = aliases.tables().map(str::to_string).collect();
        debug!(
            tables = ?final_tables,
            recovered,
            is_aggregated,
            diagnostics = diagnostics.len(),
            "compiled plan"
        );

        Ok(CompiledQuery {
            sql,
            params,
            expected_columns,
            is_aggregated,
            row_cap,
            recovered_tables: recovered,
            tables: final_tables,
            diagnostics,
        })
    }

    fn resolve_tables(
        &self,
        plan: &mut QueryPlan,
        allowed_tables: &[String],
        usable: &[&str],
        diagnostics: &mut Vec<String>,
    ) -> (Vec<String>, bool) {
        let allowed = |table: &str| allowed_tables.is_empty() || allowed_tables.iter().any(|t| t == table);

        let mut tables: Vec<String> = Vec::new();
        for table in &plan.tables {
            if tables.contains(table) {
                continue;
            }
            if !usable.contains(&table.as_str()) {
                diagnostics.push(format!("dropped table {table}: not in the schema registry"));
            } else if !allowed(table) {
                diagnostics.push(format!("dropped table {table}: not in the allowlist"));
            } else {
                tables.push(table.clone());
            }
        }

        if !tables.is_empty() {
            return (tables, false);
        }

        let from_allowlist: Vec<String> = allowed_tables
            .iter()
            .filter(|table| usable.contains(&table.as_str()))
            .take(RECOVERY_TABLES)
            .cloned()
            .collect();
        let recovered = if from_allowlist.is_empty() {
            usable
                .iter()
                .take(RECOVERY_TABLES)
                .map(|t| t.to_string())
                .collect()
        } else {
            from_allowlist
        };

        diagnostics.push(format!(
            "no valid tables in plan; recovered {}",
            recovered.join(", ")
        ));
        plan.tables = recovered.clone();
        (recovered, true)
    }

    fn select_dimensions(
        &self,
        plan: &QueryPlan,
        aliases: &AliasMap,
        is_aggregated: bool,
        items: &mut Vec<SelectItem>,
        diagnostics: &mut Vec<String>,
    ) {
        let registry = self.registry.as_ref();
        for field in plan.dimensions.iter().chain(plan.group_by.iter()) {
            match resolve_column(field, aliases, registry) {
                Some(column) => items.push(SelectItem::column(&column)),
                None => diagnostics.push(format!("dropped dimension '{field}': column not found")),
            }
        }

        let Some(time_field) = plan.time_field.as_deref() else {
            return;
        };
        let Some(column) = resolve_column(time_field, aliases, registry) else {
            diagnostics.push(format!("dropped time_field '{time_field}': column not found"));
            return;
        };

        let mut item = SelectItem::column(&column);
        if let Some(raw_grain) = plan.time_granularity.as_deref() {
            match TimeGrain::parse(raw_grain) {
                Some(grain) if is_aggregated => item.expr = grain.truncate(&column.expr),
                Some(_) => diagnostics.push(format!(
                    "time_granularity '{raw_grain}' ignored outside aggregation"
                )),
                None => diagnostics.push(format!(
                    "unknown time_granularity '{raw_grain}'; using the raw column"
                )),
            }
        }
        items.retain(|existing| existing.alias != item.alias);
        items.push(item);
    }

    fn select_metrics(
        &self,
        plan: &QueryPlan,
        aliases: &AliasMap,
        is_aggregated: bool,
        items: &mut Vec<SelectItem>,
        diagnostics: &mut Vec<String>,
    ) {
        let registry = self.registry.as_ref();
        for metric in &plan.metrics {
            let name = metric.name.trim();
            if name.is_empty() {
                diagnostics.push("dropped metric without a name".to_string());
                continue;
            }

            let agg = metric.agg.as_deref().map(str::trim).filter(|agg| !agg.is_empty());
            let Some(agg) = agg else {
                if is_aggregated {
                    diagnostics.push(format!(
                        "dropped raw metric '{name}': raw columns cannot mix with aggregation"
                    ));
                    continue;
                }
                let deps = metric.depends_on.iter().chain(metric.field.iter());
                for dep in deps {
                    match resolve_column(dep, aliases, registry) {
                        Some(column) => items.push(SelectItem::column(&column)),
                        None => diagnostics.push(format!(
                            "metric '{name}': dependency '{dep}' not found"
                        )),
                    }
                }
                continue;
            };

            let aggregate = Aggregate::parse(agg).unwrap_or_else(|| {
                diagnostics.push(format!(
                    "metric '{name}': unknown aggregation '{agg}' defaulted to sum"
                ));
                Aggregate::Sum
            });

            let column = metric
                .field
                .as_deref()
                .and_then(|field| resolve_column(field, aliases, registry));
            let expr = match (&column, aggregate.needs_field()) {
                (Some(column), _) => aggregate.render(&column.expr),
                (None, false) => aggregate.render(""),
                (None, true) => {
                    diagnostics.push(format!(
                        "dropped metric '{name}': field {:?} not found",
                        metric.field
                    ));
                    continue;
                }
            };

            items.push(SelectItem {
                expr,
                alias: safe_alias(name),
                aggregate: true,
            });
        }
    }

    fn order_terms(
        &self,
        plan: &QueryPlan,
        aliases: &AliasMap,
        items: &[SelectItem],
        is_aggregated: bool,
        diagnostics: &mut Vec<String>,
    ) -> Vec<String> {
        let mut terms = Vec::new();
        for order in &plan.order_by {
            let field = order.field.trim();
            let direction = order.direction.as_sql();
            let by_alias = items
                .iter()
                .find(|item| item.alias == field)
                .or_else(|| items.iter().find(|item| item.alias == safe_alias(field)))
                .or_else(|| {
                    items
                        .iter()
                        .find(|item| item.alias.eq_ignore_ascii_case(field))
                });

            if let Some(item) = by_alias {
                terms.push(format!("{} {direction}", quote_ident(&item.alias)));
                continue;
            }
            if !is_aggregated {
                if let Some(column) = resolve_column(field, aliases, &self.registry) {
                    terms.push(format!("{} {direction}", column.expr));
                    continue;
                }
            }
            diagnostics.push(format!("dropped order_by '{field}': not an output column"));
        }
        terms
    }
}

fn dedupe_by_alias(items: Vec<SelectItem>, diagnostics: &mut Vec<String>) -> Vec<SelectItem> {
    let mut seen: Vec<String> = Vec::new();
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        if seen.contains(&item.alias) {
            if item.aggregate {
                diagnostics.push(format!("dropped duplicate output column '{}'", item.alias));
            }
            continue;
        }
        seen.push(item.alias.clone());
        out.push(item);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CostRisk, Filter, Join, Metric, OrderBy, OrderDirection};
    use crate::safety;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn registry() -> Arc<SchemaRegistry> {
        Arc::new(
            SchemaRegistry::from_json(
                r#"{"tables": {
                    "sales.orders": {"columns": [
                        {"name": "order_id"}, {"name": "customer_id"}, {"name": "amount"},
                        {"name": "region"}, {"name": "created_at"}
                    ], "row_count": 1000000},
                    "sales.customers": {"columns": [
                        {"name": "customer_id"}, {"name": "segment"}
                    ]},
                    "hr.staff": {"columns": [{"name": "staff_id"}]}
                }}"#,
            )
            .unwrap(),
        )
    }

    fn compiler() -> Compiler {
        Compiler::new(registry(), 100, 5_000)
    }

    fn revenue_plan() -> QueryPlan {
        QueryPlan {
            tables: vec!["sales.orders".into(), "sales.customers".into()],
            joins: vec![Join {
                left_table: "sales.orders".into(),
                right_table: "sales.customers".into(),
                left_key: "customer_id".into(),
                right_key: "customer_id".into(),
                join_type: "inner".into(),
            }],
            metrics: vec![Metric {
                name: "Revenue".into(),
                agg: Some("sum".into()),
                field: Some("amount".into()),
                depends_on: vec![],
            }],
            dimensions: vec!["segment".into()],
            filters: vec![Filter {
                field: "region".into(),
                op: "in".into(),
                value: json!(["EU", "US"]),
            }],
            time_field: Some("created_at".into()),
            time_granularity: Some("monthly".into()),
            order_by: vec![OrderBy {
                field: "Revenue".into(),
                direction: OrderDirection::Desc,
            }],
            ..QueryPlan::default()
        }
    }

    #[test]
    fn compiles_aggregated_plan() {
        let mut plan = revenue_plan();
        let compiled = compiler().compile(&mut plan, &[], None).unwrap();

        assert_eq!(
            compiled.sql,
            "SELECT t1.\"segment\" AS \"segment\", date_trunc('month', t0.\"created_at\") AS \"created_at\", \
             SUM(t0.\"amount\") AS \"Revenue\" FROM \"sales\".\"orders\" AS t0 \
             INNER JOIN \"sales\".\"customers\" AS t1 ON t0.\"customer_id\" = t1.\"customer_id\" \
             WHERE t0.\"region\" IN (:p0_0, :p0_1) \
             GROUP BY t1.\"segment\", date_trunc('month', t0.\"created_at\") \
             ORDER BY \"Revenue\" DESC LIMIT 100"
        );
        assert!(compiled.is_aggregated);
        assert_eq!(compiled.expected_columns, vec!["segment", "created_at", "Revenue"]);
        assert_eq!(plan.expected_columns, compiled.expected_columns);
        assert_eq!(compiled.params.get("p0_1"), Some(&json!("US")));
        assert_eq!(compiled.tables, vec!["sales.orders", "sales.customers"]);
        assert!(compiled.diagnostics.is_empty(), "{:?}", compiled.diagnostics);
        assert!(safety::validate(&compiled.sql, 5_000).ok);
    }

    #[test]
    fn large_mode_uses_large_ceiling() {
        let mut plan = revenue_plan();
        let compiled = compiler().compile(&mut plan, &[], Some(true)).unwrap();
        assert_eq!(compiled.row_cap, 5_000);
        assert!(compiled.sql.ends_with("LIMIT 5000"));

        plan.large_mode = true;
        assert_eq!(compiler().compile(&mut plan, &[], None).unwrap().row_cap, 5_000);
    }

    #[test]
    fn recovers_from_allowlist_when_no_table_survives() {
        let mut plan = QueryPlan {
            tables: vec!["dbo.ghost".into()],
            query_cost_risk: Some(CostRisk::Low),
            ..QueryPlan::default()
        };
        let allowed = vec!["hr.staff".to_string(), "nope".to_string()];
        let compiled = compiler().compile(&mut plan, &allowed, None).unwrap();

        assert!(compiled.recovered_tables);
        assert_eq!(compiled.tables, vec!["hr.staff"]);
        assert_eq!(plan.tables, vec!["hr.staff"]);
        assert_eq!(compiled.expected_columns, vec!["staff_id"]);
        assert!(!compiled.is_aggregated);
    }

    #[test]
    fn recovers_from_registry_order_without_allowlist() {
        let mut plan = QueryPlan::default();
        let compiled = compiler().compile(&mut plan, &[], None).unwrap();
        assert!(compiled.recovered_tables);
        assert_eq!(plan.tables, vec!["hr.staff", "sales.customers"]);
        assert_eq!(compiled.tables, vec!["hr.staff"]);
    }

    #[test]
    fn allowlist_filters_plan_tables() {
        let mut plan = revenue_plan();
        let allowed = vec!["sales.orders".to_string()];
        let compiled = compiler().compile(&mut plan, &allowed, None).unwrap();
        assert_eq!(compiled.tables, vec!["sales.orders"]);
        assert!(!compiled.sql.contains("customers"));
        assert!(compiled
            .diagnostics
            .iter()
            .any(|d| d.contains("not in the allowlist")));
    }

    #[test]
    fn unknown_aggregation_defaults_to_sum() {
        let mut plan = QueryPlan {
            tables: vec!["sales.orders".into()],
            metrics: vec![Metric {
                name: "Median amount".into(),
                agg: Some("median".into()),
                field: Some("amount".into()),
                depends_on: vec![],
            }],
            ..QueryPlan::default()
        };
        let compiled = compiler().compile(&mut plan, &[], None).unwrap();
        assert!(compiled.sql.contains("SUM(t0.\"amount\") AS \"Median amount\""));
        assert!(compiled.diagnostics[0].contains("defaulted to sum"));
    }

    #[test]
    fn count_ignores_field_and_raw_metrics_pass_through() {
        let mut plan = QueryPlan {
            tables: vec!["sales.orders".into()],
            metrics: vec![Metric {
                name: "Orders".into(),
                agg: Some("count".into()),
                field: None,
                depends_on: vec![],
            }],
            ..QueryPlan::default()
        };
        let compiled = compiler().compile(&mut plan, &[], None).unwrap();
        assert!(compiled.sql.starts_with("SELECT COUNT(1) AS \"Orders\" FROM"));
        assert!(!compiled.sql.contains("GROUP BY"));

        let mut raw = QueryPlan {
            tables: vec!["sales.orders".into()],
            metrics: vec![Metric {
                name: "raw".into(),
                agg: None,
                field: None,
                depends_on: vec!["amount".into(), "region".into()],
            }],
            order_by: vec![OrderBy {
                field: "order_id".into(),
                direction: OrderDirection::Asc,
            }],
            ..QueryPlan::default()
        };
        let compiled = compiler().compile(&mut raw, &[], None).unwrap();
        assert_eq!(compiled.expected_columns, vec!["amount", "region"]);
        assert!(compiled.sql.contains("ORDER BY t0.\"order_id\" ASC"));
        assert!(!compiled.is_aggregated);
    }

    #[test]
    fn fallback_selects_primary_columns() {
        let mut plan = QueryPlan {
            tables: vec!["sales.orders".into()],
            aggregation: true,
            dimensions: vec!["ghost".into()],
            ..QueryPlan::default()
        };
        let compiled = compiler().compile(&mut plan, &[], None).unwrap();
        assert_eq!(
            compiled.expected_columns,
            vec!["order_id", "customer_id", "amount", "region", "created_at"]
        );
        assert!(!compiled.is_aggregated);
        assert!(!compiled.sql.contains("GROUP BY"));
    }

    #[test]
    fn time_range_compiles_to_bounds() {
        let mut plan = QueryPlan {
            tables: vec!["sales.orders".into()],
            dimensions: vec!["region".into()],
            time_field: Some("created_at".into()),
            time_range: Some("last_7d".into()),
            ..QueryPlan::default()
        };
        let now = DateTime::parse_from_rfc3339("2025-06-08T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let compiled = compiler().compile_at(&mut plan, &[], None, now).unwrap();
        assert!(compiled
            .sql
            .contains("WHERE t0.\"created_at\" >= :p0 AND t0.\"created_at\" <= :p1"));
        assert_eq!(compiled.params.get("p0"), Some(&json!("2025-06-01T00:00:00.000Z")));
    }

    #[test]
    fn empty_registry_is_a_configuration_error() {
        let compiler = Compiler::new(Arc::new(SchemaRegistry::default()), 10, 10);
        let err = compiler
            .compile(&mut QueryPlan::default(), &[], None)
            .unwrap_err();
        assert!(matches!(err, ServiceError::Config(_)));
    }

    #[test]
    fn params_serialize_in_emission_order() {
        let params: Params = vec![("p1", json!(2)), ("p0", json!(1))].into_iter().collect();
        assert_eq!(serde_json::to_string(&params).unwrap(), r#"{"p1":2,"p0":1}"#);
        assert_eq!(params.sorted()[0].0, "p0");
    }
}
