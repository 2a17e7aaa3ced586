use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::data_store::{AggregateBackend, DataStoreError};

pub const DEFAULT_LIMIT: i64 = 1000;

fn default_limit() -> i64 {
    DEFAULT_LIMIT
}

#[derive(Error, Debug)]
pub enum AggregateError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("At least one metric is required")]
    EmptyMetrics,

    #[error("Aggregate backend error: {0}")]
    Upstream(#[from] DataStoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "between")]
    Between,
    #[serde(rename = "like")]
    Like,
}

/// One filter clause. `value` shape depends on `op` (scalar, array, or
/// two-element range) and is forwarded as-is; only the backend interprets
/// it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateFilter {
    pub field: String,
    pub op: FilterOp,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateRange {
    /// Column to range over; falls back to the model's `dateColumn`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateRequest {
    #[serde(default)]
    pub board_id: Option<i64>,
    #[serde(default)]
    pub metrics: Vec<String>,
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default)]
    pub filters: Vec<AggregateFilter>,
    #[serde(default)]
    pub date_range: Option<DateRange>,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

impl AggregateRequest {
    /// Validate required fields and lower into the backend call shape.
    /// Everything beyond `boardId` and a non-empty `metrics` passes
    /// through untouched.
    pub fn validate(self) -> Result<ProcedureCall, AggregateError> {
        let board_id = self
            .board_id
            .ok_or(AggregateError::MissingField("boardId"))?;
        if self.metrics.is_empty() {
            return Err(AggregateError::EmptyMetrics);
        }

        Ok(ProcedureCall {
            board_id,
            metrics: self.metrics,
            dimensions: self.dimensions,
            filters: self.filters,
            date_range: self.date_range,
            limit: self.limit,
        })
    }
}

/// The marshaled call handed to the aggregation procedure. Serializes to
/// the jsonb payload the remote procedure takes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcedureCall {
    pub board_id: i64,
    pub metrics: Vec<String>,
    pub dimensions: Vec<String>,
    pub filters: Vec<AggregateFilter>,
    pub date_range: Option<DateRange>,
    pub limit: i64,
}

pub type JsonRow = serde_json::Map<String, serde_json::Value>;

/// Rows plus the query text the backend compiled. `sql` is advisory
/// output for transparency; it is never executed on this side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateResult {
    pub rows: Vec<JsonRow>,
    pub sql: String,
}

/// Marshals validated requests into a single backend call and relays the
/// result. Metric keys are resolved and compiled entirely by the backend;
/// no retry, no caching, no shared state between requests.
#[derive(Clone)]
pub struct AggregateExecutor<B> {
    backend: B,
}

impl<B> AggregateExecutor<B>
where
    B: AggregateBackend,
{
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub async fn execute(
        &self,
        request: AggregateRequest,
    ) -> Result<AggregateResult, AggregateError> {
        let call = request.validate()?;
        debug!(
            "Aggregate call: board={} metrics={:?} dimensions={:?} limit={}",
            call.board_id, call.metrics, call.dimensions, call.limit
        );

        let result = self.backend.run_aggregate(&call).await?;
        debug!("Aggregate compiled: {}", result.sql);
        Ok(result)
    }
}
