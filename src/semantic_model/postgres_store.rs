use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::error;
use tokio_postgres::{Client, NoTls, Row};

use crate::config::PostgresConfig;
use crate::semantic_model::{
    SemanticModel, SemanticModelStore, SemanticModelStoreError, StoredModel,
};

const UPSERT_SQL: &str = "\
    INSERT INTO semantic_models (board_id, name, date_column, dimensions, metrics, glossary) \
    VALUES ($1, $2, $3, $4, $5, $6) \
    ON CONFLICT (board_id) DO UPDATE SET \
        name = EXCLUDED.name, \
        date_column = EXCLUDED.date_column, \
        dimensions = EXCLUDED.dimensions, \
        metrics = EXCLUDED.metrics, \
        glossary = EXCLUDED.glossary, \
        updated_at = now() \
    RETURNING board_id, name, date_column, dimensions, metrics, glossary, created_at, updated_at";

const GET_SQL: &str = "\
    SELECT board_id, name, date_column, dimensions, metrics, glossary, created_at, updated_at \
    FROM semantic_models WHERE board_id = $1";

/// [`SemanticModelStore`] over a `semantic_models` table.
///
/// The upsert is a single row-level statement, so concurrent saves for
/// distinct boards never touch a shared row.
#[derive(Clone)]
pub struct PostgresSemanticModelStore {
    client: Arc<Client>,
}

impl PostgresSemanticModelStore {
    pub async fn new(config: &PostgresConfig) -> Result<Self, SemanticModelStoreError> {
        let (client, connection) = tokio_postgres::connect(&config.connection_string(), NoTls)
            .await
            .map_err(|e| SemanticModelStoreError::Storage(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("semantic model store connection error: {}", e);
            }
        });

        Ok(Self {
            client: Arc::new(client),
        })
    }

    fn stored_model_from_row(row: &Row) -> Result<StoredModel, SemanticModelStoreError> {
        let board_id: i64 = row.get("board_id");
        let corrupt =
            |e: serde_json::Error| SemanticModelStoreError::CorruptModel(board_id, e.to_string());

        let dimensions: serde_json::Value = row.get("dimensions");
        let metrics: serde_json::Value = row.get("metrics");
        let glossary: serde_json::Value = row.get("glossary");
        let created_at: DateTime<Utc> = row.get("created_at");
        let updated_at: DateTime<Utc> = row.get("updated_at");

        Ok(StoredModel {
            model: SemanticModel {
                board_id,
                name: row.get("name"),
                date_column: row.get("date_column"),
                dimensions: serde_json::from_value(dimensions).map_err(corrupt)?,
                metrics: serde_json::from_value(metrics).map_err(corrupt)?,
                glossary: serde_json::from_value(glossary).map_err(corrupt)?,
            },
            created_at,
            updated_at,
        })
    }
}

#[async_trait]
impl SemanticModelStore for PostgresSemanticModelStore {
    async fn save(&self, model: &SemanticModel) -> Result<StoredModel, SemanticModelStoreError> {
        let dimensions = serde_json::to_value(&model.dimensions)
            .map_err(|e| SemanticModelStoreError::Storage(e.to_string()))?;
        let metrics = serde_json::to_value(&model.metrics)
            .map_err(|e| SemanticModelStoreError::Storage(e.to_string()))?;
        let glossary = serde_json::to_value(&model.glossary)
            .map_err(|e| SemanticModelStoreError::Storage(e.to_string()))?;

        let row = self
            .client
            .query_one(
                UPSERT_SQL,
                &[
                    &model.board_id,
                    &model.name,
                    &model.date_column,
                    &dimensions,
                    &metrics,
                    &glossary,
                ],
            )
            .await
            .map_err(|e| SemanticModelStoreError::Storage(e.to_string()))?;

        Self::stored_model_from_row(&row)
    }

    async fn get(&self, board_id: i64) -> Result<Option<StoredModel>, SemanticModelStoreError> {
        let row = self
            .client
            .query_opt(GET_SQL, &[&board_id])
            .await
            .map_err(|e| SemanticModelStoreError::Storage(e.to_string()))?;

        row.as_ref().map(Self::stored_model_from_row).transpose()
    }
}
