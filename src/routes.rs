//! Route definitions and router setup
//!
//! Configures all API routes and middleware.

mod query;
mod schema;

use crate::config::Settings;
use crate::state::SharedState;
use axum::{
    http::{header, Method},
    extract::State,
    routing::{delete, get, post},
    Router,
};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    request_id::MakeRequestUuid,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
    ServiceBuilderExt,
};
use tracing::Level;

/// Create the application router with all routes and middleware
pub fn create_router(state: SharedState, settings: &Settings) -> Router {
    // Build CORS layer
    let cors = build_cors_layer(settings);

    // Build tracing/logging layer
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    // Build middleware stack
    let middleware = ServiceBuilder::new()
        .set_x_request_id(MakeRequestUuid)
        .layer(trace_layer)
        .layer(CompressionLayer::new())
        .layer(cors)
        .propagate_x_request_id();

    Router::new()
        .route("/health", get(health_check))
        .route("/api/query", post(query::answer_question))
        .route("/api/schema", get(schema::get_schema))
        .route("/api/schema/reload", post(schema::reload_schema))
        .route("/api/schema/cache", delete(schema::invalidate_schema))
        .layer(middleware)
        .with_state(state)
}

/// Build CORS layer from settings
fn build_cors_layer(settings: &Settings) -> CorsLayer {
    let origins: Vec<_> = settings
        .cors
        .allowed_origins
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();

    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .max_age(Duration::from_secs(3600));

    if origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(origins)
    }
}

/// Health check endpoint. Never touches the database.
async fn health_check(State(state): State<SharedState>) -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "success": true,
        "message": "Server is running fine.",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "schemaVersion": state.catalog.current().map(|s| s.version)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::introspection::fixtures::shop_snapshot;
    use crate::llm::mock::ScriptedLlm;
    use crate::pipeline::executor::mock::{Outcome, StaticExecutor};
    use crate::snapshot::store::mock::StaticSource;
    use crate::snapshot::SchemaCatalog;
    use crate::state::AppState;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app(llm: ScriptedLlm, executor: StaticExecutor) -> (Router, Arc<StaticExecutor>) {
        let settings = Settings::default();
        let catalog = Arc::new(SchemaCatalog::new(
            Arc::new(StaticSource::new(vec![shop_snapshot()])),
            Duration::from_secs(60),
        ));
        let executor = Arc::new(executor);
        let state = AppState::from_parts(catalog, Arc::new(llm), executor.clone(), &settings);
        (create_router(Arc::new(state), &settings), executor)
    }

    async fn send(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health_check() {
        let (app, _) = app(ScriptedLlm::replying(""), StaticExecutor::new(Outcome::Rows(vec![])));
        let (status, body) = send(app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(body["schemaVersion"], Value::Null);
    }

    #[tokio::test]
    async fn test_query_returns_answer_envelope() {
        let llm = ScriptedLlm::new(vec![
            Ok("SELECT name FROM customers ORDER BY name LIMIT 2".to_string()),
            Ok("Ana and Ben are the first customers.".to_string()),
        ]);
        let rows = vec![vec![json!("Ana"), json!(1)], vec![json!("Ben"), json!(2)]];
        let (app, _) = app(llm, StaticExecutor::new(Outcome::Rows(rows)));

        let (status, body) = send(
            app,
            "POST",
            "/api/query",
            Some(json!({ "userQuery": "First two customers?" })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["answerText"], "Ana and Ben are the first customers.");
        assert_eq!(body["rowCount"], 2);
        assert_eq!(body["answerSource"], "llm");
        assert!(body["generatedSql"].as_str().unwrap().ends_with("LIMIT 2"));
        assert!(body["requestId"].is_string());
    }

    #[tokio::test]
    async fn test_unsafe_sql_maps_to_422_with_reason() {
        let (app, executor) = app(
            ScriptedLlm::replying("DROP TABLE orders"),
            StaticExecutor::new(Outcome::Rows(vec![])),
        );

        let (status, body) = send(
            app,
            "POST",
            "/api/query",
            Some(json!({ "userQuery": "Drop the orders table" })),
        )
        .await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "UNSAFE_SQL_REJECTED");
        assert_eq!(body["stage"], "sql_validation");
        assert_eq!(body["reason"], "forbidden_keyword");
        assert!(!body.to_string().contains("DROP TABLE"));
        assert_eq!(executor.call_count(), 0);
    }

    #[tokio::test]
    async fn test_blank_question_is_bad_request() {
        let (app, _) = app(ScriptedLlm::replying(""), StaticExecutor::new(Outcome::Rows(vec![])));
        let (status, body) =
            send(app, "POST", "/api/query", Some(json!({ "userQuery": "   " }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_query_timeout_maps_to_504() {
        let (app, _) = app(
            ScriptedLlm::replying("SELECT id FROM orders"),
            StaticExecutor::new(Outcome::Timeout),
        );
        let (status, body) =
            send(app, "POST", "/api/query", Some(json!({ "userQuery": "All orders" }))).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body["code"], "QUERY_TIMEOUT");
        assert_eq!(body["stage"], "query_execution");
    }

    #[tokio::test]
    async fn test_schema_endpoints() {
        let (app, _) = app(ScriptedLlm::replying(""), StaticExecutor::new(Outcome::Rows(vec![])));

        let (status, body) = send(app.clone(), "GET", "/api/schema", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["schema"]["namespace"], "public");
        assert_eq!(body["schema"]["tables"].as_array().unwrap().len(), 2);

        let (status, body) = send(app, "POST", "/api/schema/reload", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["schema"]["version"], 2);
        assert_eq!(body["drift"]["hasDrift"], false);
    }

    #[tokio::test]
    async fn test_schema_cache_can_be_cleared() {
        let (app, _) = app(ScriptedLlm::replying(""), StaticExecutor::new(Outcome::Rows(vec![])));

        send(app.clone(), "GET", "/api/schema", None).await;
        let (_, health) = send(app.clone(), "GET", "/health", None).await;
        assert_eq!(health["schemaVersion"], 1);

        let (status, body) = send(app.clone(), "DELETE", "/api/schema/cache", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["previousVersion"], 1);

        let (_, health) = send(app, "GET", "/health", None).await;
        assert_eq!(health["schemaVersion"], Value::Null);
    }
}
