use super::{DashboardBuilder, Insights};
use crate::models::QueryPlan;
use crate::result::{ColumnKind, ResultColumn, ResultSet};
use crate::time::parse_datetime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DashboardMeta {
    pub title: String,
    pub columns: Vec<ColumnMeta>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub suggestions: Vec<VizSuggestion>,
    pub kpi_count: usize,
    pub rows: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnMeta {
    pub name: String,
    #[serde(rename = "type")]
    pub col_type: ColumnType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic: Option<ColumnSemantic>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Bool,
    Int,
    Float,
    Timestamptz,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ColumnSemantic {
    Id,
    Time,
    Value,
    Label,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VizSuggestion {
    pub kind: VizKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub series: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VizKind {
    Timeseries,
    Bar,
    Table,
}

/// Column metadata plus chart suggestions for the result.
#[derive(Debug, Clone, Copy, Default)]
pub struct VizDashboard;

impl DashboardBuilder for VizDashboard {
    fn build(&self, result: &ResultSet, plan: &QueryPlan, insights: &Insights) -> DashboardMeta {
        let time_column = plan
            .time_field
            .as_deref()
            .map(|field| field.rsplit('.').next().unwrap_or(field));

        let columns: Vec<ColumnMeta> = result
            .columns
            .iter()
            .enumerate()
            .map(|(idx, column)| describe(column, result.column_values(idx), time_column))
            .collect();

        let title = match plan.notes.trim() {
            "" => "Dashboard".to_string(),
            notes => notes.to_string(),
        };

        DashboardMeta {
            title,
            suggestions: suggest(&columns),
            columns,
            kpi_count: insights.kpis.len(),
            rows: result.row_count(),
        }
    }
}

fn describe<'a>(
    column: &ResultColumn,
    mut values: impl Iterator<Item = &'a Value>,
    time_column: Option<&str>,
) -> ColumnMeta {
    let is_id = column.name == "id" || column.name.ends_with("_id");
    let (col_type, semantic) = match column.kind {
        ColumnKind::Bool => (ColumnType::Bool, None),
        ColumnKind::Int64 if is_id => (ColumnType::Int, Some(ColumnSemantic::Id)),
        ColumnKind::Int64 => (ColumnType::Int, Some(ColumnSemantic::Value)),
        ColumnKind::Float64 => (ColumnType::Float, Some(ColumnSemantic::Value)),
        ColumnKind::Text => {
            let first = values.find_map(Value::as_str);
            let is_time = time_column == Some(column.name.as_str())
                || first.is_some_and(|v| parse_datetime(v).is_ok());
            if is_time {
                (ColumnType::Timestamptz, Some(ColumnSemantic::Time))
            } else if is_id {
                (ColumnType::Text, Some(ColumnSemantic::Id))
            } else {
                (ColumnType::Text, Some(ColumnSemantic::Label))
            }
        }
    };
    ColumnMeta {
        name: column.name.clone(),
        col_type,
        semantic,
    }
}

fn suggest(columns: &[ColumnMeta]) -> Vec<VizSuggestion> {
    let first = |semantic: ColumnSemantic| {
        columns
            .iter()
            .find(|c| c.semantic == Some(semantic))
            .map(|c| c.name.clone())
    };
    let time = first(ColumnSemantic::Time);
    let value = first(ColumnSemantic::Value);
    let label = first(ColumnSemantic::Label);

    let mut suggestions = Vec::new();
    if let (Some(x), Some(y)) = (&time, &value) {
        suggestions.push(VizSuggestion {
            kind: VizKind::Timeseries,
            x: Some(x.clone()),
            y: Some(y.clone()),
            series: label.clone(),
        });
    }
    if let (Some(x), Some(y)) = (&label, &value) {
        suggestions.push(VizSuggestion {
            kind: VizKind::Bar,
            x: Some(x.clone()),
            y: Some(y.clone()),
            series: None,
        });
    }
    if suggestions.is_empty() {
        suggestions.push(VizSuggestion {
            kind: VizKind::Table,
            x: None,
            y: None,
            series: None,
        });
    }
    suggestions
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn suggests_timeseries_and_bar() {
        let result = ResultSet::from_rows(
            &["order_date", "region", "revenue"],
            vec![
                vec![json!("2024-01-01T00:00:00Z"), json!("EU"), json!(1.5)],
                vec![json!("2024-02-01T00:00:00Z"), json!("US"), json!(2.5)],
            ],
        );
        let meta = VizDashboard.build(&result, &QueryPlan::default(), &Insights::default());

        assert_eq!(meta.title, "Dashboard");
        assert_eq!(meta.columns[0].col_type, ColumnType::Timestamptz);
        assert_eq!(meta.columns[1].semantic, Some(ColumnSemantic::Label));
        assert_eq!(
            meta.suggestions.iter().map(|s| s.kind).collect::<Vec<_>>(),
            vec![VizKind::Timeseries, VizKind::Bar]
        );
        assert_eq!(meta.suggestions[0].series.as_deref(), Some("region"));
    }

    #[test]
    fn falls_back_to_table() {
        let result = ResultSet::from_rows(
            &["customer_id", "name"],
            vec![vec![json!(1), json!("Ada")]],
        );
        let plan = QueryPlan {
            notes: "Customers".into(),
            ..QueryPlan::default()
        };
        let meta = VizDashboard.build(&result, &plan, &Insights::default());
        assert_eq!(meta.title, "Customers");
        assert_eq!(meta.columns[0].semantic, Some(ColumnSemantic::Id));
        assert_eq!(meta.suggestions[0].kind, VizKind::Table);
    }

    #[test]
    fn plan_time_field_marks_time_column() {
        let result = ResultSet::from_rows(&["day", "orders"], vec![vec![json!("week 1"), json!(3)]]);
        let plan = QueryPlan {
            time_field: Some("sales.orders.day".into()),
            ..QueryPlan::default()
        };
        let meta = VizDashboard.build(&result, &plan, &Insights::default());
        assert_eq!(meta.columns[0].semantic, Some(ColumnSemantic::Time));
        assert_eq!(meta.suggestions[0].kind, VizKind::Timeseries);
        assert_eq!(meta.suggestions[0].series, None);
    }
}
