use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use log::info;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::aggregate::AggregateExecutor;
use crate::api;
use crate::auth::Authentication;
use crate::config::Config;
use crate::data_store::AggregateBackend;
use crate::semantic_model::SemanticModelStore;

pub struct AppState<S, B> {
    pub auth: Authentication,
    pub models: S,
    pub executor: AggregateExecutor<B>,
    /// Server-wide scope; hydration fan-outs run under child tokens of it.
    pub shutdown: CancellationToken,
}

/// Build the router: the three model/query functions plus dashboard
/// hydration and a public health check, with permissive CORS (preflight
/// `OPTIONS` included).
pub fn app<S, B>(state: AppState<S, B>) -> Router
where
    S: SemanticModelStore + 'static,
    B: AggregateBackend + 'static,
{
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(api::health))
        .route("/api/model-save", post(api::model_save::<S, B>))
        .route(
            "/api/model-get",
            get(api::model_get::<S, B>).post(api::model_get_body::<S, B>),
        )
        .route("/api/query-aggregate", post(api::query_aggregate::<S, B>))
        .route("/api/dashboard-hydrate", post(api::dashboard_hydrate::<S, B>))
        .with_state(Arc::new(state))
        .layer(cors)
}

pub struct Server<S, B> {
    config: Config,
    state: AppState<S, B>,
}

impl<S, B> Server<S, B>
where
    S: SemanticModelStore + 'static,
    B: AggregateBackend + 'static,
{
    pub fn new(config: Config, state: AppState<S, B>) -> Self {
        Self { config, state }
    }

    pub async fn run(self) -> std::io::Result<()> {
        let server_address = format!("{}:{}", self.config.server_host, self.config.server_port);
        info!("Starting server at {}", server_address);

        let listener = TcpListener::bind(&server_address).await?;
        info!("Listening for connections on {}", server_address);

        axum::serve(listener, app(self.state)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_store::local::LocalAggregateBackend;
    use crate::semantic_model::local_store::LocalSemanticModelStore;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    const TOKEN: &str = "Bearer secret";

    fn test_app() -> Router {
        let mut tokens = std::collections::HashMap::new();
        tokens.insert("secret".to_string(), "admin".to_string());

        let models = LocalSemanticModelStore::mock();
        let backend = LocalAggregateBackend::mock_with_store(models.clone());
        app(AppState {
            auth: Authentication::new(tokens),
            models,
            executor: AggregateExecutor::new(backend),
            shutdown: CancellationToken::new(),
        })
    }

    async fn send(
        app: Router,
        method: &str,
        uri: &str,
        auth: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(auth) = auth {
            builder = builder.header("Authorization", auth);
        }
        let request = match body {
            Some(body) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn health_is_public() {
        let (status, body) = send(test_app(), "GET", "/api/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn missing_bearer_token_is_401_with_uniform_body() {
        for (method, uri) in [
            ("POST", "/api/model-save"),
            ("GET", "/api/model-get?boardId=1"),
            ("POST", "/api/query-aggregate"),
            ("POST", "/api/dashboard-hydrate"),
        ] {
            let body = (method == "POST").then(|| json!({}));
            let (status, body) = send(test_app(), method, uri, None, body).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED, "{} {}", method, uri);
            assert_eq!(body["ok"], json!(false));
            assert!(body["error"].is_string());
        }
    }

    #[tokio::test]
    async fn unknown_token_is_401() {
        let (status, _) = send(
            test_app(),
            "GET",
            "/api/model-get?boardId=1",
            Some("Bearer nope"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn preflight_gets_permissive_cors_headers() {
        let app = test_app();
        let response = app
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/api/query-aggregate")
                    .header("Origin", "http://localhost:3000")
                    .header("Access-Control-Request-Method", "POST")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response
            .headers()
            .contains_key("access-control-allow-origin"));
    }

    #[tokio::test]
    async fn model_save_requires_name() {
        let (status, body) = send(
            test_app(),
            "POST",
            "/api/model-save",
            Some(TOKEN),
            Some(json!({"boardId": 5})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["ok"], json!(false));
        assert!(body["error"].as_str().unwrap().contains("name"));
    }

    #[tokio::test]
    async fn model_save_rejects_free_form_metric_sql() {
        let (status, body) = send(
            test_app(),
            "POST",
            "/api/model-save",
            Some(TOKEN),
            Some(json!({
                "boardId": 5,
                "name": "Sales",
                "metrics": [{"key": "evil", "label": "Evil", "sql": "amount; DROP TABLE users"}]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["ok"], json!(false));
    }

    #[tokio::test]
    async fn save_then_get_round_trips_the_model() {
        let app = test_app();
        let model = json!({
            "boardId": 9,
            "name": "Inventory",
            "dateColumn": "stocked_at",
            "dimensions": ["warehouse"],
            "metrics": [{"key": "units", "label": "Units", "sql": "sum(quantity)", "format": "number"}],
            "glossary": {"units": "Physical items on hand"}
        });

        let (status, body) = send(
            app.clone(),
            "POST",
            "/api/model-save",
            Some(TOKEN),
            Some(model.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], json!(true));
        assert!(body["model"]["createdAt"].is_string());

        let (status, body) = send(
            app,
            "GET",
            "/api/model-get?boardId=9",
            Some(TOKEN),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        for field in ["boardId", "name", "dateColumn", "dimensions", "metrics", "glossary"] {
            assert_eq!(body["model"][field], model[field], "field {}", field);
        }
    }

    #[tokio::test]
    async fn get_of_unsaved_board_is_null_model_not_error() {
        let (status, body) = send(
            test_app(),
            "GET",
            "/api/model-get?boardId=4040",
            Some(TOKEN),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], json!(true));
        assert!(body["model"].is_null());
    }

    #[tokio::test]
    async fn model_get_accepts_board_id_in_post_body() {
        let (status, body) = send(
            test_app(),
            "POST",
            "/api/model-get",
            Some(TOKEN),
            Some(json!({"boardId": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["model"]["name"], json!("Sales"));
    }

    #[tokio::test]
    async fn malformed_board_id_is_400() {
        let (status, body) = send(
            test_app(),
            "GET",
            "/api/model-get?boardId=abc",
            Some(TOKEN),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["ok"], json!(false));
    }

    async fn send_raw(
        app: Router,
        uri: &str,
        auth: Option<&str>,
        content_type: Option<&str>,
        body: &str,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method("POST").uri(uri);
        if let Some(auth) = auth {
            builder = builder.header("Authorization", auth);
        }
        if let Some(content_type) = content_type {
            builder = builder.header("Content-Type", content_type);
        }
        let response = app
            .oneshot(builder.body(Body::from(body.to_string())).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn malformed_body_is_400_with_uniform_body() {
        for uri in [
            "/api/model-save",
            "/api/model-get",
            "/api/query-aggregate",
            "/api/dashboard-hydrate",
        ] {
            let (status, body) = send_raw(
                test_app(),
                uri,
                Some(TOKEN),
                Some("application/json"),
                "{not json",
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
            assert_eq!(body["ok"], json!(false), "{}", uri);
            assert!(body["error"].as_str().unwrap().contains("Invalid JSON body"));
        }
    }

    #[tokio::test]
    async fn missing_credentials_win_over_malformed_body() {
        let (status, body) = send_raw(
            test_app(),
            "/api/query-aggregate",
            None,
            Some("application/json"),
            "{not json",
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["ok"], json!(false));
    }

    #[tokio::test]
    async fn content_type_header_is_not_required() {
        let (status, body) = send_raw(
            test_app(),
            "/api/query-aggregate",
            Some(TOKEN),
            None,
            r#"{"boardId": 1, "metrics": ["revenue"]}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], json!(true));
    }

    #[tokio::test]
    async fn empty_metrics_is_400_regardless_of_other_fields() {
        let (status, body) = send(
            test_app(),
            "POST",
            "/api/query-aggregate",
            Some(TOKEN),
            Some(json!({"boardId": 1, "metrics": [], "dimensions": ["region"], "limit": 5})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["ok"], json!(false));
    }

    #[tokio::test]
    async fn unknown_board_surfaces_backend_error_as_500() {
        let (status, body) = send(
            test_app(),
            "POST",
            "/api/query-aggregate",
            Some(TOKEN),
            Some(json!({"boardId": 77, "metrics": ["revenue"]})),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("board 77"));
    }

    #[tokio::test]
    async fn aggregate_scenario_respects_limit_and_returns_sql() {
        let app = test_app();
        let (status, _) = send(
            app.clone(),
            "POST",
            "/api/model-save",
            Some(TOKEN),
            Some(json!({
                "boardId": 1,
                "name": "Sales",
                "dimensions": ["region"],
                "metrics": [{"key": "revenue", "label": "Revenue", "sql": "sum(amount)"}]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(
            app,
            "POST",
            "/api/query-aggregate",
            Some(TOKEN),
            Some(json!({"boardId": 1, "metrics": ["revenue"], "limit": 10})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], json!(true));
        assert!(body["rows"].as_array().unwrap().len() <= 10);
        assert!(!body["sql"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dashboard_hydrate_reports_per_widget_outcomes() {
        let (status, body) = send(
            test_app(),
            "POST",
            "/api/dashboard-hydrate",
            Some(TOKEN),
            Some(json!({
                "boardId": 1,
                "widgets": [
                    {"id": "kpi", "vizType": "kpi", "query": {"metrics": ["revenue"]}},
                    {"id": "bad", "vizType": "table", "query": {"metrics": ["nope"]}}
                ]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["widgets"]["kpi"]["status"], json!("loaded"));
        assert_eq!(body["widgets"]["bad"]["status"], json!("failed"));
    }
}
