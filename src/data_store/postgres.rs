use std::sync::Arc;

use async_trait::async_trait;
use log::error;
use tokio_postgres::{Client, NoTls};

use crate::aggregate::{AggregateResult, JsonRow, ProcedureCall};
use crate::config::PostgresConfig;
use crate::data_store::{AggregateBackend, DataStoreError};

const PROCEDURE_SQL: &str = "SELECT rows, sql FROM run_board_aggregate($1::jsonb)";

/// [`AggregateBackend`] that forwards the whole call to the database's
/// `run_board_aggregate` procedure as one jsonb payload. The procedure
/// resolves metric keys against the stored model and compiles the final
/// query; whatever it reports on failure is surfaced unchanged.
#[derive(Clone)]
pub struct PostgresAggregateBackend {
    client: Arc<Client>,
}

impl PostgresAggregateBackend {
    pub async fn new(config: &PostgresConfig) -> Result<Self, DataStoreError> {
        let (client, connection) = tokio_postgres::connect(&config.connection_string(), NoTls)
            .await
            .map_err(|e| DataStoreError::Connection(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("aggregate backend connection error: {}", e);
            }
        });

        Ok(Self {
            client: Arc::new(client),
        })
    }
}

#[async_trait]
impl AggregateBackend for PostgresAggregateBackend {
    async fn run_aggregate(
        &self,
        call: &ProcedureCall,
    ) -> Result<AggregateResult, DataStoreError> {
        let payload =
            serde_json::to_value(call).map_err(|e| DataStoreError::Query(e.to_string()))?;

        let row = self
            .client
            .query_one(PROCEDURE_SQL, &[&payload])
            .await
            .map_err(|e| DataStoreError::Query(e.to_string()))?;

        let rows: serde_json::Value = row.get("rows");
        let sql: String = row.get("sql");
        let rows: Vec<JsonRow> =
            serde_json::from_value(rows).map_err(|e| DataStoreError::Query(e.to_string()))?;

        Ok(AggregateResult { rows, sql })
    }
}
