//! Read-only schema snapshot that every compiler decision is checked against.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SchemaRegistry {
    #[serde(default)]
    pub tables: BTreeMap<String, TableInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TableInfo {
    #[serde(default)]
    pub columns: Vec<ColumnInfo>,
    #[serde(default)]
    pub row_count: Option<u64>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub pk_fk_hints: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(default, rename = "type")]
    pub data_type: Option<String>,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl SchemaRegistry {
    /// Loads the registry file. A missing file yields an empty registry so the
    /// service can still start; compilation against it reports the problem.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!(path = %path.display(), "schema registry file not found; starting empty");
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read schema registry {}", path.display()))?;
        let registry = Self::from_json(&raw)
            .with_context(|| format!("failed to parse schema registry {}", path.display()))?;
        info!(tables = registry.tables.len(), "loaded schema registry");
        Ok(registry)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Table keys in sorted order.
    pub fn table_keys(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    pub fn table(&self, table: &str) -> Option<&TableInfo> {
        self.tables.get(table)
    }

    pub fn column_names(&self, table: &str) -> Vec<&str> {
        self.tables
            .get(table)
            .map(|info| info.columns.iter().map(|c| c.name.as_str()).collect())
            .unwrap_or_default()
    }

    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.column(table, column).is_some()
    }

    pub fn column(&self, table: &str, column: &str) -> Option<&ColumnInfo> {
        self.tables
            .get(table)?
            .columns
            .iter()
            .find(|c| c.name == column)
    }

    /// Case-insensitive lookup returning the registry spelling of the column.
    pub fn find_column_ci(&self, table: &str, column: &str) -> Option<&str> {
        self.tables
            .get(table)?
            .columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(column))
            .map(|c| c.name.as_str())
    }

    pub fn row_count(&self, table: &str) -> u64 {
        self.tables
            .get(table)
            .and_then(|info| info.row_count)
            .unwrap_or(0)
    }

    /// Subset of the registry for the given tables, as handed to the plan proposer.
    pub fn snapshot_for(&self, tables: &[String]) -> serde_json::Value {
        let subset: BTreeMap<&str, &TableInfo> = tables
            .iter()
            .filter_map(|t| self.tables.get_key_value(t.as_str()))
            .map(|(k, v)| (k.as_str(), v))
            .collect();
        serde_json::json!({ "tables": subset })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "tables": {
            "sales.orders": {
                "columns": [
                    {"name": "order_id", "type": "bigint", "nullable": false},
                    {"name": "Amount", "type": "numeric"}
                ],
                "row_count": 1200
            },
            "sales.customers": {"columns": [{"name": "customer_id", "type": "bigint"}]}
        }
    }"#;

    #[test]
    fn parses_registry_snapshot() {
        let registry = SchemaRegistry::from_json(SAMPLE).expect("registry should parse");
        assert_eq!(
            registry.table_keys().collect::<Vec<_>>(),
            vec!["sales.customers", "sales.orders"]
        );
        assert_eq!(registry.row_count("sales.orders"), 1200);
        assert_eq!(registry.row_count("sales.customers"), 0);
        assert!(registry.has_column("sales.orders", "order_id"));
        assert!(!registry.has_column("sales.orders", "amount"));
        assert_eq!(registry.find_column_ci("sales.orders", "amount"), Some("Amount"));
        assert!(registry.column("sales.customers", "customer_id").unwrap().nullable);
    }

    #[test]
    fn missing_file_yields_empty_registry() {
        let registry =
            SchemaRegistry::load(Path::new("/nonexistent/planq/registry.json")).expect("load");
        assert!(registry.is_empty());
    }

    #[test]
    fn snapshot_only_includes_known_tables() {
        let registry = SchemaRegistry::from_json(SAMPLE).unwrap();
        let snapshot =
            registry.snapshot_for(&["sales.orders".to_string(), "missing".to_string()]);
        let tables = snapshot["tables"].as_object().unwrap();
        assert_eq!(tables.len(), 1);
        assert!(tables.contains_key("sales.orders"));
    }
}
