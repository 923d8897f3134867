//! PostgreSQL source runner.
//!
//! Named `:pN` placeholders are rewritten to positional `$n` parameters and
//! bound by the types PostgreSQL infers for them. Types without a native
//! binding are sent as text and cast server-side.

use super::runner::{GuardFailure, GuardReport, QueryRunner, RowSource};
use crate::compiler::Params;
use crate::config::AppConfig;
use crate::db::{PgConnectionManager, PgPool};
use crate::error::{Result, ServiceError};
use crate::result::{ColumnKind, ResultColumn};
use crate::time::parse_datetime;
use async_trait::async_trait;
use bb8::PooledConnection;
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{Number, Value};
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;
use tokio_postgres::types::{FromSql, ToSql, Type};
use tokio_postgres::{Row, RowStream};
use tokio_stream::StreamExt;
use tracing::{debug, warn};
use uuid::Uuid;

type BoxedParam = Box<dyn ToSql + Sync + Send>;

#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub read_uncommitted: bool,
    pub lock_timeout: Duration,
    pub statement_timeout: Duration,
}

impl SessionSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            read_uncommitted: config.read_uncommitted,
            lock_timeout: config.lock_timeout,
            statement_timeout: config.statement_timeout,
        }
    }

    fn statements(&self) -> Vec<(&'static str, String)> {
        let isolation = if self.read_uncommitted {
            "READ UNCOMMITTED"
        } else {
            "READ COMMITTED"
        };
        vec![
            (
                "isolation",
                format!("SET SESSION CHARACTERISTICS AS TRANSACTION ISOLATION LEVEL {isolation}"),
            ),
            (
                "lock_timeout",
                format!("SET lock_timeout = {}", self.lock_timeout.as_millis()),
            ),
            (
                "statement_timeout",
                format!("SET statement_timeout = {}", self.statement_timeout.as_millis()),
            ),
            ("client_min_messages", "SET client_min_messages = warning".to_string()),
        ]
    }
}

pub struct PostgresRunner {
    pool: PgPool,
    settings: SessionSettings,
}

impl PostgresRunner {
    pub fn new(pool: PgPool, settings: SessionSettings) -> Self {
        Self { pool, settings }
    }

    /// Applies each session guard independently; a failing guard is reported
    /// and never aborts the query.
    async fn apply_guards(&self, client: &tokio_postgres::Client) -> GuardReport {
        let mut report = GuardReport::default();
        for (guard, statement) in self.settings.statements() {
            match client.batch_execute(&statement).await {
                Ok(()) => report.applied.push(guard.to_string()),
                Err(err) => {
                    warn!(guard, error = %err, "session guard not applied");
                    report.failed.push(GuardFailure {
                        guard: guard.to_string(),
                        error: err.to_string(),
                    });
                }
            }
        }
        report
    }
}

#[async_trait]
impl QueryRunner for PostgresRunner {
    async fn open(&self, sql: &str, params: &Params) -> Result<Box<dyn RowSource>> {
        let (positional, order) = rewrite_named_params(sql, &HashMap::new())?;
        let values = order
            .iter()
            .map(|name| {
                params.get(name).cloned().ok_or_else(|| {
                    ServiceError::InvalidRequest(format!("missing value for parameter :{name}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let conn = self.pool.get_owned().await.map_err(|err| {
            ServiceError::Source(format!("could not acquire a source connection: {err:?}"))
        })?;
        let guards = self.apply_guards(&conn).await;
        debug!(applied = ?guards.applied, failed = guards.failed.len(), "session guards");

        let mut statement = conn
            .prepare(&positional)
            .await
            .map_err(|err| ServiceError::Source(format!("failed to prepare statement: {err}")))?;

        let casts: HashMap<usize, String> = statement
            .params()
            .iter()
            .enumerate()
            .filter(|(_, ty)| BindKind::for_type(ty).is_none())
            .map(|(idx, ty)| (idx + 1, ty.name().to_string()))
            .collect();
        if !casts.is_empty() {
            debug!(casts = ?casts, "re-preparing with text casts");
            let (cast_sql, _) = rewrite_named_params(sql, &casts)?;
            statement = conn.prepare(&cast_sql).await.map_err(|err| {
                ServiceError::Source(format!("failed to prepare statement: {err}"))
            })?;
        }

        let binds = statement
            .params()
            .iter()
            .zip(order.iter().zip(values.iter()))
            .map(|(ty, (name, value))| bind_value(name, value, ty))
            .collect::<Result<Vec<_>>>()?;

        let columns: Vec<ResultColumn> = statement
            .columns()
            .iter()
            .map(|column| ResultColumn::new(column.name(), column_kind(column.type_())))
            .collect();
        let types: Vec<Type> = statement
            .columns()
            .iter()
            .map(|column| column.type_().clone())
            .collect();

        let stream = conn
            .query_raw(&statement, binds)
            .await
            .map_err(|err| ServiceError::Source(format!("query failed: {err}")))?;

        Ok(Box::new(PgRowSource {
            stream: Box::pin(stream),
            columns,
            types,
            guards,
            _conn: conn,
        }))
    }
}

struct PgRowSource {
    // Dropped before the connection it reads from.
    stream: Pin<Box<RowStream>>,
    columns: Vec<ResultColumn>,
    types: Vec<Type>,
    guards: GuardReport,
    _conn: PooledConnection<'static, PgConnectionManager>,
}

#[async_trait]
impl RowSource for PgRowSource {
    fn columns(&self) -> &[ResultColumn] {
        &self.columns
    }

    fn guards(&self) -> Option<&GuardReport> {
        Some(&self.guards)
    }

    async fn next_chunk(&mut self, max_rows: usize) -> Result<Vec<Vec<Value>>> {
        let mut rows = Vec::with_capacity(max_rows.min(4_096));
        while rows.len() < max_rows {
            match self.stream.next().await {
                Some(row) => {
                    let row = row
                        .map_err(|err| ServiceError::Source(format!("row stream failed: {err}")))?;
                    rows.push(decode_row(&row, &self.types)?);
                }
                None => break,
            }
        }
        Ok(rows)
    }
}

/// Rewrites `:name` placeholders to `$n`, numbering names by first
/// appearance. String literals, quoted identifiers and `::` casts are left
/// alone. Positions listed in `casts` are wrapped as `CAST($n::text AS ty)`.
fn rewrite_named_params(
    sql: &str,
    casts: &HashMap<usize, String>,
) -> Result<(String, Vec<String>)> {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut order: Vec<String> = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        match ch {
            '\'' | '"' => {
                out.push(ch);
                i += 1;
                while i < chars.len() {
                    out.push(chars[i]);
                    if chars[i] == ch {
                        if chars.get(i + 1) == Some(&ch) {
                            out.push(ch);
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
                i += 1;
            }
            ':' if chars.get(i + 1) == Some(&':') => {
                out.push_str("::");
                i += 2;
            }
            ':' if chars
                .get(i + 1)
                .is_some_and(|c| c.is_ascii_alphabetic() || *c == '_') =>
            {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_')
                {
                    end += 1;
                }
                let name: String = chars[start..end].iter().collect();
                let position = match order.iter().position(|existing| *existing == name) {
                    Some(idx) => idx + 1,
                    None => {
                        order.push(name);
                        order.len()
                    }
                };
                match casts.get(&position) {
                    Some(ty) => {
                        if !ty.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                            return Err(ServiceError::Source(format!(
                                "cannot bind parameter ${position} of type {ty}"
                            )));
                        }
                        out.push_str(&format!("CAST(${position}::text AS {ty})"));
                    }
                    None => out.push_str(&format!("${position}")),
                }
                i = end;
            }
            _ => {
                out.push(ch);
                i += 1;
            }
        }
    }

    Ok((out, order))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BindKind {
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Text,
    Timestamptz,
    Timestamp,
    Date,
    Uuid,
    Json,
}

impl BindKind {
    fn for_type(ty: &Type) -> Option<Self> {
        match *ty {
            Type::BOOL => Some(BindKind::Bool),
            Type::INT2 => Some(BindKind::Int2),
            Type::INT4 => Some(BindKind::Int4),
            Type::INT8 => Some(BindKind::Int8),
            Type::FLOAT4 => Some(BindKind::Float4),
            Type::FLOAT8 => Some(BindKind::Float8),
            Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
                Some(BindKind::Text)
            }
            Type::TIMESTAMPTZ => Some(BindKind::Timestamptz),
            Type::TIMESTAMP => Some(BindKind::Timestamp),
            Type::DATE => Some(BindKind::Date),
            Type::UUID => Some(BindKind::Uuid),
            Type::JSON | Type::JSONB => Some(BindKind::Json),
            _ => None,
        }
    }
}

fn bind_value(name: &str, value: &Value, ty: &Type) -> Result<BoxedParam> {
    let invalid = || {
        ServiceError::InvalidRequest(format!(
            "parameter :{name} value {value} cannot be bound as {}",
            ty.name()
        ))
    };
    // Positions re-prepared with a text cast now report TEXT.
    let kind = BindKind::for_type(ty).unwrap_or(BindKind::Text);

    if value.is_null() {
        return Ok(match kind {
            BindKind::Bool => Box::new(None::<bool>),
            BindKind::Int2 => Box::new(None::<i16>),
            BindKind::Int4 => Box::new(None::<i32>),
            BindKind::Int8 => Box::new(None::<i64>),
            BindKind::Float4 => Box::new(None::<f32>),
            BindKind::Float8 => Box::new(None::<f64>),
            BindKind::Text => Box::new(None::<String>),
            BindKind::Timestamptz => Box::new(None::<DateTime<Utc>>),
            BindKind::Timestamp => Box::new(None::<NaiveDateTime>),
            BindKind::Date => Box::new(None::<NaiveDate>),
            BindKind::Uuid => Box::new(None::<Uuid>),
            BindKind::Json => Box::new(None::<Value>),
        });
    }

    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    Ok(match kind {
        BindKind::Bool => Box::new(match value {
            Value::Bool(b) => *b,
            _ => text.trim().parse::<bool>().map_err(|_| invalid())?,
        }),
        BindKind::Int2 => Box::new(i16::try_from(as_integer(value).ok_or_else(invalid)?).map_err(|_| invalid())?),
        BindKind::Int4 => Box::new(i32::try_from(as_integer(value).ok_or_else(invalid)?).map_err(|_| invalid())?),
        BindKind::Int8 => Box::new(as_integer(value).ok_or_else(invalid)?),
        BindKind::Float4 => Box::new(as_float(value).ok_or_else(invalid)? as f32),
        BindKind::Float8 => Box::new(as_float(value).ok_or_else(invalid)?),
        BindKind::Text => Box::new(text),
        BindKind::Timestamptz => Box::new(parse_datetime(text.trim()).map_err(|_| invalid())?),
        BindKind::Timestamp => Box::new(parse_datetime(text.trim()).map_err(|_| invalid())?.naive_utc()),
        BindKind::Date => Box::new(parse_datetime(text.trim()).map_err(|_| invalid())?.date_naive()),
        BindKind::Uuid => Box::new(Uuid::parse_str(text.trim()).map_err(|_| invalid())?),
        BindKind::Json => Box::new(value.clone()),
    })
}

fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn column_kind(ty: &Type) -> ColumnKind {
    match *ty {
        Type::BOOL => ColumnKind::Bool,
        Type::INT2 | Type::INT4 | Type::INT8 | Type::OID => ColumnKind::Int64,
        Type::FLOAT4 | Type::FLOAT8 | Type::NUMERIC => ColumnKind::Float64,
        _ => ColumnKind::Text,
    }
}

fn decode_row(row: &Row, types: &[Type]) -> Result<Vec<Value>> {
    types
        .iter()
        .enumerate()
        .map(|(idx, ty)| decode_cell(row, idx, ty))
        .collect()
}

fn decode_cell(row: &Row, idx: usize, ty: &Type) -> Result<Value> {
    let failed = |err: tokio_postgres::Error| {
        ServiceError::Source(format!("failed to decode column {idx} ({}): {err}", ty.name()))
    };

    let value = match *ty {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx).map_err(failed)?.map(Value::Bool),
        Type::INT2 => row.try_get::<_, Option<i16>>(idx).map_err(failed)?.map(Value::from),
        Type::INT4 => row.try_get::<_, Option<i32>>(idx).map_err(failed)?.map(Value::from),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx).map_err(failed)?.map(Value::from),
        Type::OID => row.try_get::<_, Option<u32>>(idx).map_err(failed)?.map(Value::from),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)
            .map_err(failed)?
            .and_then(|v| float_value(f64::from(v))),
        Type::FLOAT8 => row
            .try_get::<_, Option<f64>>(idx)
            .map_err(failed)?
            .and_then(float_value),
        Type::NUMERIC => row
            .try_get::<_, Option<PgNumeric>>(idx)
            .map_err(failed)?
            .and_then(|v| float_value(v.0)),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)
            .map_err(failed)?
            .map(|v| Value::String(v.to_rfc3339_opts(SecondsFormat::AutoSi, true))),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)
            .map_err(failed)?
            .map(|v| Value::String(v.format("%Y-%m-%d %H:%M:%S%.f").to_string())),
        Type::DATE => row
            .try_get::<_, Option<NaiveDate>>(idx)
            .map_err(failed)?
            .map(|v| Value::String(v.to_string())),
        Type::UUID => row
            .try_get::<_, Option<Uuid>>(idx)
            .map_err(failed)?
            .map(|v| Value::String(v.to_string())),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<Value>>(idx)
            .map_err(failed)?
            .map(|v| Value::String(v.to_string())),
        _ => match row.try_get::<_, Option<String>>(idx) {
            Ok(v) => v.map(Value::String),
            Err(err) => undecodable(idx, ty.name(), &err),
        },
    };
    Ok(value.unwrap_or(Value::Null))
}

/// Cells of types with no JSON mapping become null; the loss is logged.
fn undecodable(column: usize, ty: &str, err: &dyn std::fmt::Display) -> Option<Value> {
    warn!(column, ty, error = %err, "undecodable column; emitting null");
    None
}

fn float_value(value: f64) -> Option<Value> {
    Number::from_f64(value).map(Value::Number)
}

/// Binary NUMERIC decoded to the nearest `f64`.
struct PgNumeric(f64);

const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

impl<'a> FromSql<'a> for PgNumeric {
    fn from_sql(
        _ty: &Type,
        raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        let word = |offset: usize| -> std::result::Result<u16, Box<dyn std::error::Error + Sync + Send>> {
            raw.get(offset..offset + 2)
                .map(|b| u16::from_be_bytes([b[0], b[1]]))
                .ok_or_else(|| "truncated numeric value".into())
        };

        let ndigits = usize::from(word(0)?);
        let weight = word(2)? as i16;
        let sign = word(4)?;

        match sign {
            NUMERIC_NAN => return Ok(PgNumeric(f64::NAN)),
            NUMERIC_PINF => return Ok(PgNumeric(f64::INFINITY)),
            NUMERIC_NINF => return Ok(PgNumeric(f64::NEG_INFINITY)),
            _ => {}
        }

        let mut value = 0f64;
        for i in 0..ndigits {
            let digit = f64::from(word(8 + i * 2)?);
            let exponent = i32::from(weight) - i as i32;
            value += digit * 10_000f64.powi(exponent);
        }
        if sign == NUMERIC_NEG {
            value = -value;
        }
        Ok(PgNumeric(value))
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}
