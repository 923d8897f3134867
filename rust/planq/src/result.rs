//! In-memory result sets and their Arrow representation.

use anyhow::{Context, Result};
use arrow::array::{Array, ArrayRef, AsArray, BooleanArray, Float64Array, Int64Array, StringArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Float64Type, Int64Type, Schema, SchemaRef};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Bool,
    Int64,
    Float64,
    Text,
}

impl ColumnKind {
    fn data_type(self) -> DataType {
        match self {
            ColumnKind::Bool => DataType::Boolean,
            ColumnKind::Int64 => DataType::Int64,
            ColumnKind::Float64 => DataType::Float64,
            ColumnKind::Text => DataType::Utf8,
        }
    }

    fn from_data_type(data_type: &DataType) -> Self {
        match data_type {
            DataType::Boolean => ColumnKind::Bool,
            DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32 => ColumnKind::Int64,
            DataType::Float16 | DataType::Float32 | DataType::Float64 => ColumnKind::Float64,
            _ => ColumnKind::Text,
        }
    }

    /// Narrowest kind that holds every non-null value.
    pub fn infer<'a>(values: impl IntoIterator<Item = &'a Value>) -> Self {
        let mut kind: Option<ColumnKind> = None;
        for value in values {
            let next = match value {
                Value::Null => continue,
                Value::Bool(_) => ColumnKind::Bool,
                Value::Number(n) if n.is_i64() => ColumnKind::Int64,
                Value::Number(_) => ColumnKind::Float64,
                _ => ColumnKind::Text,
            };
            kind = Some(match (kind, next) {
                (None, next) => next,
                (Some(current), next) if current == next => current,
                (Some(ColumnKind::Int64), ColumnKind::Float64)
                | (Some(ColumnKind::Float64), ColumnKind::Int64) => ColumnKind::Float64,
                _ => ColumnKind::Text,
            });
        }
        kind.unwrap_or(ColumnKind::Text)
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, ColumnKind::Int64 | ColumnKind::Float64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ColumnKind,
}

impl ResultColumn {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Row-major result with typed columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub columns: Vec<ResultColumn>,
    pub rows: Vec<Vec<Value>>,
}

impl ResultSet {
    pub fn new(columns: Vec<ResultColumn>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    /// Builds a result from rows, inferring each column's kind.
    pub fn from_rows(names: &[&str], rows: Vec<Vec<Value>>) -> Self {
        let columns = names
            .iter()
            .enumerate()
            .map(|(idx, name)| {
                let kind = ColumnKind::infer(rows.iter().filter_map(|row| row.get(idx)));
                ResultColumn::new(*name, kind)
            })
            .collect();
        Self { columns, rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column_values(&self, idx: usize) -> impl Iterator<Item = &Value> {
        self.rows.iter().filter_map(move |row| row.get(idx))
    }

    pub fn truncate(&mut self, max_rows: usize) {
        self.rows.truncate(max_rows);
    }

    /// Keeps only `names`, in the given order.
    pub fn project(&self, names: &[String]) -> Result<Self> {
        let indexes = names
            .iter()
            .map(|name| {
                self.column_index(name)
                    .with_context(|| format!("unknown column '{name}'"))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            columns: indexes.iter().map(|&i| self.columns[i].clone()).collect(),
            rows: self
                .rows
                .iter()
                .map(|row| {
                    indexes
                        .iter()
                        .map(|&i| row.get(i).cloned().unwrap_or(Value::Null))
                        .collect()
                })
                .collect(),
        })
    }

    /// Rows as JSON objects keyed by column name.
    pub fn to_records(&self) -> Vec<Value> {
        self.rows
            .iter()
            .map(|row| {
                let record: Map<String, Value> = self
                    .columns
                    .iter()
                    .zip(row.iter())
                    .map(|(column, value)| (column.name.clone(), value.clone()))
                    .collect();
                Value::Object(record)
            })
            .collect()
    }

    pub fn schema(&self) -> SchemaRef {
        Arc::new(Schema::new(
            self.columns
                .iter()
                .map(|c| Field::new(&c.name, c.kind.data_type(), true))
                .collect::<Vec<_>>(),
        ))
    }

    pub fn to_record_batch(&self) -> Result<RecordBatch> {
        let arrays: Vec<ArrayRef> = self
            .columns
            .iter()
            .enumerate()
            .map(|(idx, column)| self.column_array(idx, column.kind))
            .collect();
        let options = RecordBatchOptions::new().with_row_count(Some(self.rows.len()));
        RecordBatch::try_new_with_options(self.schema(), arrays, &options)
            .context("failed to build record batch")
    }

    fn column_array(&self, idx: usize, kind: ColumnKind) -> ArrayRef {
        let cells = self.rows.iter().map(|row| row.get(idx).unwrap_or(&Value::Null));
        match kind {
            ColumnKind::Bool => Arc::new(cells.map(Value::as_bool).collect::<BooleanArray>()),
            ColumnKind::Int64 => Arc::new(cells.map(Value::as_i64).collect::<Int64Array>()),
            ColumnKind::Float64 => Arc::new(cells.map(Value::as_f64).collect::<Float64Array>()),
            ColumnKind::Text => Arc::new(
                cells
                    .map(|value| match value {
                        Value::Null => None,
                        Value::String(s) => Some(s.clone()),
                        other => Some(other.to_string()),
                    })
                    .collect::<StringArray>(),
            ),
        }
    }

    pub fn from_record_batches(schema: &Schema, batches: &[RecordBatch]) -> Result<Self> {
        let columns: Vec<ResultColumn> = schema
            .fields()
            .iter()
            .map(|field| ResultColumn::new(field.name(), ColumnKind::from_data_type(field.data_type())))
            .collect();

        let mut rows = Vec::new();
        for batch in batches {
            let mut batch_rows = vec![Vec::with_capacity(columns.len()); batch.num_rows()];
            for (idx, column) in columns.iter().enumerate() {
                let array = cast(batch.column(idx), &column.kind.data_type())
                    .with_context(|| format!("failed to read column '{}'", column.name))?;
                for (row, cell) in batch_rows.iter_mut().zip(array_values(&array, column.kind)) {
                    row.push(cell);
                }
            }
            rows.extend(batch_rows);
        }

        Ok(Self { columns, rows })
    }
}

fn array_values(array: &ArrayRef, kind: ColumnKind) -> Vec<Value> {
    (0..array.len())
        .map(|i| {
            if array.is_null(i) {
                return Value::Null;
            }
            match kind {
                ColumnKind::Bool => Value::Bool(array.as_boolean().value(i)),
                ColumnKind::Int64 => Value::from(array.as_primitive::<Int64Type>().value(i)),
                ColumnKind::Float64 => Number::from_f64(array.as_primitive::<Float64Type>().value(i))
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
                ColumnKind::Text => Value::String(array.as_string::<i32>().value(i).to_string()),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn sample() -> ResultSet {
        ResultSet::from_rows(
            &["region", "orders", "revenue", "active"],
            vec![
                vec![json!("EU"), json!(3), json!(10.5), json!(true)],
                vec![json!("US"), Value::Null, json!(7), json!(false)],
            ],
        )
    }

    #[test]
    fn infers_column_kinds() {
        let result = sample();
        let kinds: Vec<ColumnKind> = result.columns.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![ColumnKind::Text, ColumnKind::Int64, ColumnKind::Float64, ColumnKind::Bool]
        );
        assert_eq!(ColumnKind::infer([&json!(1), &json!("x")]), ColumnKind::Text);
        assert_eq!(ColumnKind::infer([&Value::Null]), ColumnKind::Text);
    }

    #[test]
    fn survives_record_batch_conversion() {
        let result = sample();
        let batch = result.to_record_batch().unwrap();
        assert_eq!(batch.num_rows(), 2);

        let restored = ResultSet::from_record_batches(&batch.schema(), &[batch]).unwrap();
        assert_eq!(restored.columns, result.columns);
        assert_eq!(restored.rows[1][1], Value::Null);
        assert_eq!(restored.rows[1][2], json!(7.0));
        assert_eq!(restored.rows[0][0], json!("EU"));
    }

    #[test]
    fn projects_and_renders_records() {
        let projected = sample()
            .project(&["revenue".to_string(), "region".to_string()])
            .unwrap();
        assert_eq!(projected.column_names(), vec!["revenue", "region"]);
        assert_eq!(projected.to_records()[0], json!({"revenue": 10.5, "region": "EU"}));
        assert!(sample().project(&["missing".to_string()]).is_err());
    }
}
