use crate::compiler::Params;
use crate::error::{Result, ServiceError};
use crate::result::{ResultColumn, ResultSet};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

/// Executes one validated SELECT against a data source.
#[async_trait]
pub trait QueryRunner: Send + Sync {
    async fn open(&self, sql: &str, params: &Params) -> Result<Box<dyn RowSource>>;
}

/// An open cursor. `next_chunk` returns an empty batch once exhausted.
#[async_trait]
pub trait RowSource: Send {
    fn columns(&self) -> &[ResultColumn];

    /// Session guards applied when the cursor was opened, if the source has any.
    fn guards(&self) -> Option<&GuardReport> {
        None
    }

    async fn next_chunk(&mut self, max_rows: usize) -> Result<Vec<Vec<Value>>>;
}

/// Outcome of best-effort session settings applied before a query.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GuardReport {
    pub applied: Vec<String>,
    pub failed: Vec<GuardFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GuardFailure {
    pub guard: String,
    pub error: String,
}

impl GuardReport {
    pub fn all_applied(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    RowLimit,
    Timeout,
}

#[derive(Debug, Clone, Copy)]
pub struct IngestLimits {
    pub max_rows: usize,
    pub chunk_size: usize,
    pub timeout: Duration,
}

#[derive(Debug)]
pub struct Ingested {
    pub result: ResultSet,
    pub truncated: bool,
    pub stop_reason: Option<StopReason>,
    pub guards: Option<GuardReport>,
}

/// Pulls chunks until the source is drained, the row ceiling is passed or
/// the deadline expires. The deadline is enforced on the client only; a
/// statement still running on the server is left to its own timeout.
pub async fn ingest(
    runner: &dyn QueryRunner,
    sql: &str,
    params: &Params,
    limits: IngestLimits,
) -> Result<Ingested> {
    let deadline = Instant::now() + limits.timeout;
    let chunk_size = limits.chunk_size.max(1);

    let mut source = match timeout_at(deadline, runner.open(sql, params)).await {
        Ok(source) => source?,
        Err(_) => {
            return Err(ServiceError::Source(format!(
                "query did not start within {}s; narrow the plan or raise PLANQ_STATEMENT_TIMEOUT_SECS",
                limits.timeout.as_secs()
            )))
        }
    };
    let columns = source.columns().to_vec();
    let guards = source.guards().cloned();

    let mut rows: Vec<Vec<Value>> = Vec::new();
    let mut stop_reason = None;
    loop {
        // One row past the ceiling tells a full result from a truncated one.
        let wanted = (limits.max_rows + 1 - rows.len()).min(chunk_size);
        match timeout_at(deadline, source.next_chunk(wanted)).await {
            Err(_) => {
                warn!(rows = rows.len(), "ingest deadline reached; keeping partial result");
                stop_reason = Some(StopReason::Timeout);
                break;
            }
            Ok(chunk) => {
                let chunk = chunk?;
                if chunk.is_empty() {
                    break;
                }
                rows.extend(chunk);
                debug!(rows = rows.len(), "ingested chunk");
                if rows.len() > limits.max_rows {
                    rows.truncate(limits.max_rows);
                    stop_reason = Some(StopReason::RowLimit);
                    break;
                }
            }
        }
    }

    Ok(Ingested {
        result: ResultSet::new(columns, rows),
        truncated: stop_reason.is_some(),
        stop_reason,
        guards,
    })
}
