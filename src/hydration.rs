use std::collections::BTreeMap;

use futures::future::join_all;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::aggregate::{AggregateExecutor, AggregateRequest, JsonRow};
use crate::data_store::AggregateBackend;

/// One chart/KPI unit on a dashboard, carrying its own aggregate query.
/// The query may omit `boardId` and inherit the dashboard's. `vizType` is
/// display data owned by the UI; it passes through here untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetSpec {
    pub id: String,
    pub viz_type: String,
    pub query: AggregateRequest,
}

/// Per-widget result. Failures stay distinct from empty results, and a
/// torn-down view reports `cancelled` rather than leaking in-flight calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum WidgetOutcome {
    Loaded { rows: Vec<JsonRow>, sql: String },
    Failed { error: String },
    Cancelled,
}

/// Fan out one executor call per widget, concurrently and independently:
/// no ordering between widgets, no shared deadline, and one widget's
/// failure never affects the others. The whole fan-out runs under `cancel`;
/// cancelling it resolves every unfinished widget as [`WidgetOutcome::Cancelled`].
pub async fn hydrate_widgets<B>(
    executor: &AggregateExecutor<B>,
    board_id: Option<i64>,
    widgets: Vec<WidgetSpec>,
    cancel: &CancellationToken,
) -> BTreeMap<String, WidgetOutcome>
where
    B: AggregateBackend,
{
    let futures = widgets.into_iter().map(|widget| {
        let mut query = widget.query;
        if query.board_id.is_none() {
            query.board_id = board_id;
        }
        async move {
            let outcome = tokio::select! {
                // Checked first so an already-torn-down view never starts
                // a backend call.
                biased;
                _ = cancel.cancelled() => WidgetOutcome::Cancelled,
                result = executor.execute(query) => match result {
                    Ok(result) => {
                        debug!("Widget {} hydrated: {} row(s)", widget.id, result.rows.len());
                        WidgetOutcome::Loaded {
                            rows: result.rows,
                            sql: result.sql,
                        }
                    }
                    Err(e) => {
                        warn!("Widget {} failed to hydrate: {}", widget.id, e);
                        WidgetOutcome::Failed {
                            error: e.to_string(),
                        }
                    }
                },
            };
            (widget.id, outcome)
        }
    });

    join_all(futures).await.into_iter().collect()
}
