use super::QualityChecker;
use crate::result::ResultSet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QualityReport {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub rows: usize,
    pub columns: Vec<String>,
    pub duplicate_rows: usize,
    pub null_rate: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<String>,
}

/// Fails empty results and results missing an expected column.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicQualityChecker;

impl QualityChecker for BasicQualityChecker {
    fn check(&self, result: &ResultSet, expected_columns: &[String]) -> QualityReport {
        let columns: Vec<String> = result.column_names().into_iter().map(str::to_string).collect();

        if result.row_count() == 0 {
            return QualityReport {
                reason: Some("empty result set".to_string()),
                columns,
                ..QualityReport::default()
            };
        }

        let missing: Vec<String> = expected_columns
            .iter()
            .filter(|c| !columns.contains(*c))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return QualityReport {
                reason: Some("missing expected columns".to_string()),
                rows: result.row_count(),
                columns,
                missing,
                ..QualityReport::default()
            };
        }

        let rows = result.row_count();
        let null_rate = columns
            .iter()
            .enumerate()
            .map(|(idx, name)| {
                let nulls = result.column_values(idx).filter(|v| v.is_null()).count();
                (name.clone(), nulls as f64 / rows as f64)
            })
            .collect();

        let mut seen = HashSet::with_capacity(rows);
        let duplicate_rows = result
            .rows
            .iter()
            .filter(|row| !seen.insert(serde_json::Value::Array(row.to_vec()).to_string()))
            .count();

        QualityReport {
            ok: true,
            reason: None,
            rows,
            columns,
            duplicate_rows,
            null_rate,
            missing: Vec::new(),
        }
    }
}
