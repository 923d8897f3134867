use super::columns::{resolve_column, AliasMap};
use super::Params;
use crate::models::Filter;
use crate::registry::SchemaRegistry;
use crate::time::parse_time_value;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterOp {
    Eq,
    NotEq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    In,
    NotIn,
}

impl FilterOp {
    fn parse(raw: &str) -> Option<Self> {
        let normalized = raw
            .trim()
            .to_ascii_lowercase()
            .replace('_', " ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        match normalized.as_str() {
            "=" | "==" | "eq" => Some(FilterOp::Eq),
            "!=" | "<>" | "ne" => Some(FilterOp::NotEq),
            ">" | "gt" => Some(FilterOp::Gt),
            ">=" | "gte" => Some(FilterOp::Gte),
            "<" | "lt" => Some(FilterOp::Lt),
            "<=" | "lte" => Some(FilterOp::Lte),
            "like" => Some(FilterOp::Like),
            "in" => Some(FilterOp::In),
            "not in" => Some(FilterOp::NotIn),
            _ => None,
        }
    }

    fn as_sql(self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::NotEq => "<>",
            FilterOp::Gt => ">",
            FilterOp::Gte => ">=",
            FilterOp::Lt => "<",
            FilterOp::Lte => "<=",
            FilterOp::Like => "LIKE",
            FilterOp::In => "IN",
            FilterOp::NotIn => "NOT IN",
        }
    }

    fn is_list(self) -> bool {
        matches!(self, FilterOp::In | FilterOp::NotIn)
    }
}

/// Accumulates WHERE predicates. Parameters are numbered `p0, p1, …` in
/// emission order; list members become `pN_0, pN_1, …`.
#[derive(Debug, Default)]
pub(super) struct WhereBuilder {
    predicates: Vec<String>,
    params: Params,
    next: usize,
}

impl WhereBuilder {
    fn next_name(&mut self) -> String {
        let name = format!("p{}", self.next);
        self.next += 1;
        name
    }

    pub(super) fn add_filters(
        &mut self,
        filters: &[Filter],
        aliases: &AliasMap,
        registry: &SchemaRegistry,
        diagnostics: &mut Vec<String>,
    ) {
        for filter in filters {
            self.add_filter(filter, aliases, registry, diagnostics);
        }
    }

    fn add_filter(
        &mut self,
        filter: &Filter,
        aliases: &AliasMap,
        registry: &SchemaRegistry,
        diagnostics: &mut Vec<String>,
    ) {
        let Some(column) = resolve_column(&filter.field, aliases, registry) else {
            diagnostics.push(format!(
                "dropped filter on '{}': field does not resolve to a joined column",
                filter.field
            ));
            return;
        };

        let op = FilterOp::parse(&filter.op).unwrap_or_else(|| {
            diagnostics.push(format!(
                "filter on '{}': unsupported operator '{}' coerced to '='",
                filter.field, filter.op
            ));
            FilterOp::Eq
        });

        match (&filter.value, op.is_list()) {
            (Value::Object(_), _) => {
                diagnostics.push(format!(
                    "dropped filter on '{}': object values are not supported",
                    filter.field
                ));
            }
            (Value::Array(items), true) => {
                if items.is_empty() {
                    diagnostics.push(format!(
                        "dropped filter on '{}': empty list for {}",
                        filter.field,
                        op.as_sql()
                    ));
                    return;
                }
                if items.iter().any(|v| v.is_array() || v.is_object()) {
                    diagnostics.push(format!(
                        "dropped filter on '{}': list members must be scalars",
                        filter.field
                    ));
                    return;
                }
                let base = self.next_name();
                let placeholders: Vec<String> = items
                    .iter()
                    .enumerate()
                    .map(|(idx, item)| {
                        let name = format!("{base}_{idx}");
                        self.params.push(&name, item.clone());
                        format!(":{name}")
                    })
                    .collect();
                self.predicates.push(format!(
                    "{} {} ({})",
                    column.expr,
                    op.as_sql(),
                    placeholders.join(", ")
                ));
            }
            (_, true) => {
                diagnostics.push(format!(
                    "dropped filter on '{}': {} requires a list value",
                    filter.field,
                    op.as_sql()
                ));
            }
            (Value::Array(_), false) => {
                diagnostics.push(format!(
                    "dropped filter on '{}': list value used with '{}'",
                    filter.field,
                    op.as_sql()
                ));
            }
            (Value::Null, false) => match op {
                FilterOp::Eq => self.predicates.push(format!("{} IS NULL", column.expr)),
                FilterOp::NotEq => self.predicates.push(format!("{} IS NOT NULL", column.expr)),
                _ => diagnostics.push(format!(
                    "dropped filter on '{}': null compared with '{}'",
                    filter.field,
                    op.as_sql()
                )),
            },
            (value, false) => {
                let name = self.next_name();
                self.params.push(&name, value.clone());
                self.predicates
                    .push(format!("{} {} :{name}", column.expr, op.as_sql()));
            }
        }
    }

    /// Bounds `time_field` by a parsed time-range preset.
    pub(super) fn add_time_range(
        &mut self,
        time_field: Option<&str>,
        raw_range: &str,
        now: DateTime<Utc>,
        aliases: &AliasMap,
        registry: &SchemaRegistry,
        diagnostics: &mut Vec<String>,
    ) {
        let Some(column) = time_field.and_then(|field| resolve_column(field, aliases, registry))
        else {
            diagnostics.push(format!(
                "ignored time_range '{raw_range}': time_field does not resolve to a joined column"
            ));
            return;
        };

        let range = match parse_time_value(raw_range).and_then(|window| window.resolve(now)) {
            Ok(range) => range,
            Err(err) => {
                diagnostics.push(format!("ignored time_range '{raw_range}': {err}"));
                return;
            }
        };

        for (bound, op) in [(range.start, ">="), (range.end, "<=")] {
            if let Some(bound) = bound {
                let name = self.next_name();
                self.params.push(
                    &name,
                    Value::String(bound.to_rfc3339_opts(SecondsFormat::Millis, true)),
                );
                self.predicates
                    .push(format!("{} {op} :{name}", column.expr));
            }
        }
    }

    pub(super) fn finish(self) -> (Option<String>, Params) {
        let clause = if self.predicates.is_empty() {
            None
        } else {
            Some(self.predicates.join(" AND "))
        };
        (clause, self.params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::from_json(
            r#"{"tables": {"s.orders": {"columns": [
                {"name": "region"}, {"name": "amount"}, {"name": "created_at"}
            ]}}}"#,
        )
        .unwrap()
    }

    fn filter(field: &str, op: &str, value: Value) -> Filter {
        Filter {
            field: field.into(),
            op: op.into(),
            value,
        }
    }

    #[test]
    fn numbers_params_in_emission_order() {
        let registry = registry();
        let aliases = AliasMap::with_primary("s.orders");
        let mut diagnostics = Vec::new();
        let mut builder = WhereBuilder::default();
        builder.add_filters(
            &[
                filter("nope", "=", json!(1)),
                filter("region", "in", json!(["EU", "US"])),
                filter("amount", "drop table", json!(5)),
                filter("region", "not_in", json!("EU")),
                filter("amount", ">=", json!([1, 2])),
                filter("region", "=", json!({"a": 1})),
                filter("region", "in", json!([])),
                filter("region", "!=", Value::Null),
            ],
            &aliases,
            &registry,
            &mut diagnostics,
        );

        let (clause, params) = builder.finish();
        assert_eq!(
            clause.unwrap(),
            "t0.\"region\" IN (:p0_0, :p0_1) AND t0.\"amount\" = :p1 AND t0.\"region\" IS NOT NULL"
        );
        assert_eq!(
            params.names().collect::<Vec<_>>(),
            vec!["p0_0", "p0_1", "p1"]
        );
        assert_eq!(diagnostics.len(), 6, "{diagnostics:?}");
    }

    #[test]
    fn time_range_binds_rfc3339_bounds() {
        let registry = registry();
        let aliases = AliasMap::with_primary("s.orders");
        let mut diagnostics = Vec::new();
        let mut builder = WhereBuilder::default();
        let now = DateTime::parse_from_rfc3339("2025-03-10T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        builder.add_time_range(Some("created_at"), "last_2d", now, &aliases, &registry, &mut diagnostics);
        builder.add_time_range(None, "today", now, &aliases, &registry, &mut diagnostics);

        let (clause, params) = builder.finish();
        assert_eq!(
            clause.unwrap(),
            "t0.\"created_at\" >= :p0 AND t0.\"created_at\" <= :p1"
        );
        assert_eq!(params.get("p0"), Some(&json!("2025-03-08T12:00:00.000Z")));
        assert_eq!(diagnostics.len(), 1);
    }
}
