use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use log::warn;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::aggregate::{AggregateError, AggregateRequest};
use crate::auth::AuthError;
use crate::data_store::AggregateBackend;
use crate::hydration::{hydrate_widgets, WidgetSpec};
use crate::semantic_model::{
    MetricDef, ModelValidationError, SemanticModel, SemanticModelStore, SemanticModelStoreError,
    StoredModel,
};
use crate::server::AppState;

/// Boundary error taxonomy. Every failure is converted into the uniform
/// `{ok:false, error}` JSON body; nothing propagates as an unhandled fault.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Upstream(String),
}

impl From<ModelValidationError> for ApiError {
    fn from(e: ModelValidationError) -> Self {
        ApiError::Validation(e.to_string())
    }
}

impl From<SemanticModelStoreError> for ApiError {
    fn from(e: SemanticModelStoreError) -> Self {
        ApiError::Upstream(e.to_string())
    }
}

impl From<AggregateError> for ApiError {
    fn from(e: AggregateError) -> Self {
        match e {
            AggregateError::MissingField(_) | AggregateError::EmptyMetrics => {
                ApiError::Validation(e.to_string())
            }
            // Original backend message preserved, never swallowed.
            AggregateError::Upstream(_) => ApiError::Upstream(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Auth(_) => StatusCode::UNAUTHORIZED,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!("Request failed upstream: {}", self);
        }
        (status, Json(json!({"ok": false, "error": self.to_string()}))).into_response()
    }
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
}

/// Bodies arrive as raw bytes and are parsed here, after authorization,
/// so a malformed body still gets the uniform 400 JSON shape and never
/// short-circuits the 401 check.
fn parse_json<T>(body: &Bytes) -> Result<T, ApiError>
where
    T: serde::de::DeserializeOwned,
{
    serde_json::from_slice(body)
        .map_err(|e| ApiError::Validation(format!("Invalid JSON body: {}", e)))
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")}))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaveModelRequest {
    board_id: Option<i64>,
    name: Option<String>,
    #[serde(default)]
    date_column: Option<String>,
    #[serde(default)]
    dimensions: Vec<String>,
    #[serde(default)]
    metrics: Vec<MetricDef>,
    #[serde(default)]
    glossary: BTreeMap<String, String>,
}

pub async fn model_save<S, B>(
    State(state): State<Arc<AppState<S, B>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError>
where
    S: SemanticModelStore + 'static,
    B: AggregateBackend + 'static,
{
    state.auth.authorize(bearer(&headers))?;

    let request: SaveModelRequest = parse_json(&body)?;
    let model = SemanticModel {
        board_id: request
            .board_id
            .ok_or(ModelValidationError::MissingBoardId)?,
        name: request.name.ok_or(ModelValidationError::MissingName)?,
        date_column: request.date_column,
        dimensions: request.dimensions,
        metrics: request.metrics,
        glossary: request.glossary,
    };
    model.validate()?;

    let stored = state.models.save(&model).await?;
    Ok(Json(json!({"ok": true, "model": stored})))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetModelParams {
    board_id: Option<String>,
}

fn parse_board_id(raw: Option<&serde_json::Value>) -> Result<i64, ApiError> {
    let raw = raw
        .ok_or_else(|| ApiError::Validation(ModelValidationError::MissingBoardId.to_string()))?;
    match raw {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
    .ok_or_else(|| ApiError::Validation(format!("Invalid board id: {}", raw)))
}

async fn fetch_model<S, B>(
    state: &AppState<S, B>,
    board_id: i64,
) -> Result<Option<StoredModel>, ApiError>
where
    S: SemanticModelStore + 'static,
    B: AggregateBackend + 'static,
{
    Ok(state.models.get(board_id).await?)
}

/// `boardId` as a query parameter. A board with no model is a normal
/// outcome: `{ok:true, model:null}`, never an error.
pub async fn model_get<S, B>(
    State(state): State<Arc<AppState<S, B>>>,
    headers: HeaderMap,
    Query(params): Query<GetModelParams>,
) -> Result<Json<serde_json::Value>, ApiError>
where
    S: SemanticModelStore + 'static,
    B: AggregateBackend + 'static,
{
    state.auth.authorize(bearer(&headers))?;

    let raw = params.board_id.map(serde_json::Value::String);
    let board_id = parse_board_id(raw.as_ref())?;
    let model = fetch_model(&state, board_id).await?;
    Ok(Json(json!({"ok": true, "model": model})))
}

/// `boardId` in a JSON body, for callers that POST everything.
pub async fn model_get_body<S, B>(
    State(state): State<Arc<AppState<S, B>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError>
where
    S: SemanticModelStore + 'static,
    B: AggregateBackend + 'static,
{
    state.auth.authorize(bearer(&headers))?;

    let body: serde_json::Value = parse_json(&body)?;
    let board_id = parse_board_id(body.get("boardId"))?;
    let model = fetch_model(&state, board_id).await?;
    Ok(Json(json!({"ok": true, "model": model})))
}

pub async fn query_aggregate<S, B>(
    State(state): State<Arc<AppState<S, B>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError>
where
    S: SemanticModelStore + 'static,
    B: AggregateBackend + 'static,
{
    state.auth.authorize(bearer(&headers))?;

    let request: AggregateRequest = parse_json(&body)?;
    let result = state.executor.execute(request).await?;
    Ok(Json(json!({"ok": true, "rows": result.rows, "sql": result.sql})))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HydrateRequest {
    #[serde(default)]
    board_id: Option<i64>,
    #[serde(default)]
    widgets: Vec<WidgetSpec>,
}

pub async fn dashboard_hydrate<S, B>(
    State(state): State<Arc<AppState<S, B>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError>
where
    S: SemanticModelStore + 'static,
    B: AggregateBackend + 'static,
{
    state.auth.authorize(bearer(&headers))?;

    let request: HydrateRequest = parse_json(&body)?;

    // Scoped under the server token so teardown cancels in-flight widgets.
    let cancel = state.shutdown.child_token();
    let widgets =
        hydrate_widgets(&state.executor, request.board_id, request.widgets, &cancel).await;
    Ok(Json(json!({"ok": true, "widgets": widgets})))
}
