pub mod local;
pub mod postgres;

use async_trait::async_trait;
use thiserror::Error;

use crate::aggregate::{AggregateResult, ProcedureCall};

#[derive(Error, Debug)]
pub enum DataStoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("No semantic model for board {0}")]
    UnknownBoard(i64),

    #[error("Unknown metric key: {0}")]
    UnknownMetric(String),
}

/// The aggregation procedure boundary.
///
/// The backend owns metric-key resolution and query compilation; callers
/// only marshal a [`ProcedureCall`] and relay `{rows, sql}` back. In
/// production this is one stored-procedure call; the local backend is the
/// in-process reference implementation of that procedure.
#[async_trait]
pub trait AggregateBackend: Clone + Send + Sync {
    async fn run_aggregate(&self, call: &ProcedureCall)
        -> Result<AggregateResult, DataStoreError>;
}
