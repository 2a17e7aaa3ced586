pub mod local_store;
pub mod metric;
pub mod postgres_store;

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use metric::{Aggregation, MetricDef, MetricExpr, MetricFormat};

/// Declarative metric/dimension/glossary definition for one board.
///
/// A board owns at most one model; saving replaces the prior definition
/// wholesale, never merges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SemanticModel {
    pub board_id: i64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_column: Option<String>,
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default)]
    pub metrics: Vec<MetricDef>,
    #[serde(default)]
    pub glossary: BTreeMap<String, String>,
}

impl SemanticModel {
    pub fn metric(&self, key: &str) -> Option<&MetricDef> {
        self.metrics.iter().find(|m| m.key == key)
    }

    pub fn validate(&self) -> Result<(), ModelValidationError> {
        if self.board_id <= 0 {
            return Err(ModelValidationError::InvalidBoardId(self.board_id));
        }
        if self.name.trim().is_empty() {
            return Err(ModelValidationError::MissingName);
        }
        let mut seen = HashSet::new();
        for metric in &self.metrics {
            if !seen.insert(metric.key.as_str()) {
                return Err(ModelValidationError::DuplicateMetricKey(
                    metric.key.clone(),
                ));
            }
        }
        Ok(())
    }
}

/// A persisted model plus the storage-assigned metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredModel {
    #[serde(flatten)]
    pub model: SemanticModel,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum ModelValidationError {
    #[error("Missing required field: boardId")]
    MissingBoardId,

    #[error("Missing required field: name")]
    MissingName,

    #[error("Invalid board id: {0}")]
    InvalidBoardId(i64),

    #[error("Duplicate metric key: {0}")]
    DuplicateMetricKey(String),
}

#[derive(Error, Debug)]
pub enum SemanticModelStoreError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Corrupt stored model for board {0}: {1}")]
    CorruptModel(i64, String),
}

/// [`SemanticModel`] persistence, keyed by board id.
///
/// Absence is a normal outcome: `get` returns `None` for a board that was
/// never saved, it does not error. Production lives across the network,
/// hence async; the in-memory store for tests is trivially async too.
#[async_trait]
pub trait SemanticModelStore: Clone + Send + Sync {
    /// Upsert keyed on `board_id`: an existing model's `date_column`,
    /// `dimensions`, `metrics` and `glossary` are fully replaced.
    async fn save(&self, model: &SemanticModel) -> Result<StoredModel, SemanticModelStoreError>;

    async fn get(&self, board_id: i64) -> Result<Option<StoredModel>, SemanticModelStoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic_model::metric::{Aggregation, MetricExpr, MetricFormat};

    fn sales_model() -> SemanticModel {
        SemanticModel {
            board_id: 1,
            name: "Sales".to_string(),
            date_column: Some("order_date".to_string()),
            dimensions: vec!["region".to_string()],
            metrics: vec![MetricDef {
                key: "revenue".to_string(),
                label: "Revenue".to_string(),
                sql: MetricExpr::new(Aggregation::Sum, "amount"),
                format: MetricFormat::Currency,
            }],
            glossary: BTreeMap::new(),
        }
    }

    #[test]
    fn valid_model_passes_validation() {
        assert!(sales_model().validate().is_ok());
    }

    #[test]
    fn blank_name_fails_validation() {
        let mut model = sales_model();
        model.name = "  ".to_string();
        assert!(matches!(
            model.validate(),
            Err(ModelValidationError::MissingName)
        ));
    }

    #[test]
    fn non_positive_board_id_fails_validation() {
        let mut model = sales_model();
        model.board_id = 0;
        assert!(matches!(
            model.validate(),
            Err(ModelValidationError::InvalidBoardId(0))
        ));
    }

    #[test]
    fn duplicate_metric_keys_fail_validation() {
        let mut model = sales_model();
        model.metrics.push(model.metrics[0].clone());
        assert!(matches!(
            model.validate(),
            Err(ModelValidationError::DuplicateMetricKey(_))
        ));
    }

    #[test]
    fn metric_lookup_is_by_key() {
        let model = sales_model();
        assert!(model.metric("revenue").is_some());
        assert!(model.metric("margin").is_none());
    }

    #[test]
    fn wire_format_uses_camel_case() {
        let json = serde_json::to_value(&sales_model()).unwrap();
        assert_eq!(json["boardId"], 1);
        assert_eq!(json["dateColumn"], "order_date");
        assert_eq!(json["metrics"][0]["sql"], "sum(amount)");
    }
}
