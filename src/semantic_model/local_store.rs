use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::semantic_model::metric::{Aggregation, MetricDef, MetricExpr, MetricFormat};
use crate::semantic_model::{
    SemanticModel, SemanticModelStore, SemanticModelStoreError, StoredModel,
};

/// In-memory [`SemanticModelStore`] for tests and the `local` backend mode.
///
/// Clones share the same map, so a model saved through one handle is
/// visible to every other handle.
#[derive(Clone, Default)]
pub struct LocalSemanticModelStore {
    models: Arc<RwLock<HashMap<i64, StoredModel>>>,
}

impl LocalSemanticModelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with the Sales board used across the test suite.
    pub fn mock() -> Self {
        let mut glossary = BTreeMap::new();
        glossary.insert(
            "revenue".to_string(),
            "Gross order value before refunds".to_string(),
        );

        let sales = SemanticModel {
            board_id: 1,
            name: "Sales".to_string(),
            date_column: Some("order_date".to_string()),
            dimensions: vec!["region".to_string(), "channel".to_string()],
            metrics: vec![
                MetricDef {
                    key: "revenue".to_string(),
                    label: "Revenue".to_string(),
                    sql: MetricExpr::new(Aggregation::Sum, "amount"),
                    format: MetricFormat::Currency,
                },
                MetricDef {
                    key: "orders".to_string(),
                    label: "Orders".to_string(),
                    sql: MetricExpr::new(Aggregation::Count, "id"),
                    format: MetricFormat::Number,
                },
                MetricDef {
                    key: "avg_order_value".to_string(),
                    label: "Average order value".to_string(),
                    sql: MetricExpr::new(Aggregation::Avg, "amount"),
                    format: MetricFormat::Currency,
                },
                MetricDef {
                    key: "buyers".to_string(),
                    label: "Unique buyers".to_string(),
                    sql: MetricExpr::new(Aggregation::CountDistinct, "customer_id"),
                    format: MetricFormat::Number,
                },
            ],
            glossary,
        };

        let now = Utc::now();
        let mut models = HashMap::new();
        models.insert(
            sales.board_id,
            StoredModel {
                model: sales,
                created_at: now,
                updated_at: now,
            },
        );
        Self {
            models: Arc::new(RwLock::new(models)),
        }
    }
}

#[async_trait]
impl SemanticModelStore for LocalSemanticModelStore {
    async fn save(&self, model: &SemanticModel) -> Result<StoredModel, SemanticModelStoreError> {
        let now = Utc::now();
        let mut models = self.models.write().await;
        let created_at = models
            .get(&model.board_id)
            .map(|existing| existing.created_at)
            .unwrap_or(now);

        let stored = StoredModel {
            model: model.clone(),
            created_at,
            updated_at: now,
        };
        models.insert(model.board_id, stored.clone());
        Ok(stored)
    }

    async fn get(&self, board_id: i64) -> Result<Option<StoredModel>, SemanticModelStoreError> {
        Ok(self.models.read().await.get(&board_id).cloned())
    }
}
