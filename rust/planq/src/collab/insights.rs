use super::InsightSummarizer;
use crate::models::QueryPlan;
use crate::result::{ColumnKind, ResultSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

const MAX_KPI_COLUMNS: usize = 8;
const MAX_TOP_COLUMNS: usize = 3;
const TOP_VALUES: usize = 5;
const HIGHLIGHT_VALUES: usize = 3;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Insights {
    pub kpis: Vec<Kpi>,
    pub highlights: Vec<String>,
    pub tables: Vec<TopValues>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Kpi {
    pub name: String,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopValues {
    pub title: String,
    pub rows: Vec<ValueCount>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValueCount {
    pub value: String,
    pub count: usize,
}

/// Summaries computed strictly from the returned rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicInsights;

impl InsightSummarizer for BasicInsights {
    fn summarize(&self, result: &ResultSet, _plan: &QueryPlan) -> Insights {
        if result.row_count() == 0 {
            return Insights {
                highlights: vec!["No data returned.".to_string()],
                ..Insights::default()
            };
        }

        let mut insights = Insights::default();

        for (idx, column) in result
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.kind.is_numeric())
            .take(MAX_KPI_COLUMNS)
        {
            let values: Vec<f64> = result.column_values(idx).filter_map(Value::as_f64).collect();
            if values.is_empty() {
                continue;
            }
            let sum: f64 = values.iter().sum();
            insights.kpis.push(Kpi {
                name: format!("{} (avg)", column.name),
                value: sum / values.len() as f64,
            });
            insights.kpis.push(Kpi {
                name: format!("{} (sum)", column.name),
                value: sum,
            });
        }

        for (idx, column) in result
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.kind == ColumnKind::Text)
            .take(MAX_TOP_COLUMNS)
        {
            let top = top_values(result.column_values(idx));
            if top.is_empty() {
                continue;
            }
            let preview: Vec<String> = top
                .iter()
                .take(HIGHLIGHT_VALUES)
                .map(|r| format!("{} ({})", r.value, r.count))
                .collect();
            insights
                .highlights
                .push(format!("Top values for {}: {}", column.name, preview.join(", ")));
            insights.tables.push(TopValues {
                title: format!("Top {}", column.name),
                rows: top,
            });
        }

        insights.highlights.push(format!(
            "Returned {} rows and {} columns.",
            group_thousands(result.row_count()),
            result.columns.len()
        ));
        insights
    }
}

fn top_values<'a>(values: impl Iterator<Item = &'a Value>) -> Vec<ValueCount> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for value in values {
        let key = match value {
            Value::Null => continue,
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        *counts.entry(key).or_default() += 1;
    }
    let mut top: Vec<ValueCount> = counts
        .into_iter()
        .map(|(value, count)| ValueCount { value, count })
        .collect();
    top.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
    top.truncate(TOP_VALUES);
    top
}

fn group_thousands(n: usize) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (idx, ch) in digits.chars().enumerate() {
        if idx > 0 && (digits.len() - idx) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn computes_kpis_and_top_values() {
        let result = ResultSet::from_rows(
            &["region", "orders"],
            vec![
                vec![json!("EU"), json!(2)],
                vec![json!("US"), json!(4)],
                vec![json!("EU"), json!(null)],
            ],
        );
        let insights = BasicInsights.summarize(&result, &QueryPlan::default());

        assert_eq!(
            insights.kpis,
            vec![
                Kpi { name: "orders (avg)".into(), value: 3.0 },
                Kpi { name: "orders (sum)".into(), value: 6.0 },
            ]
        );
        assert_eq!(insights.tables[0].title, "Top region");
        assert_eq!(insights.tables[0].rows[0], ValueCount { value: "EU".into(), count: 2 });
        assert_eq!(
            insights.highlights,
            vec![
                "Top values for region: EU (2), US (1)".to_string(),
                "Returned 3 rows and 2 columns.".to_string(),
            ]
        );
    }

    #[test]
    fn empty_result_has_single_highlight() {
        let insights = BasicInsights.summarize(&ResultSet::default(), &QueryPlan::default());
        assert_eq!(insights.highlights, vec!["No data returned."]);
        assert!(insights.kpis.is_empty());
    }

    #[test]
    fn groups_thousands() {
        assert_eq!(group_thousands(7), "7");
        assert_eq!(group_thousands(1_000), "1,000");
        assert_eq!(group_thousands(1_234_567), "1,234,567");
    }
}
