//! HTTP API: envelopes, status codes and error bodies.

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use confluence_core::adapters::{Collaborator, InMemoryCollaborator};
use confluence_core::api::{build_router, v1::paths, AppState};
use confluence_core::config::Config;
use confluence_core::events::{InMemoryEventStore, System, UnifiedEvent};
use confluence_core::runtime::SyncRuntime;
use confluence_core::saga::{action_fn, SagaDefinition, SagaStep};
use confluence_core::strangler::{MigrationStatus, RouteConfig};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

fn runtime() -> Arc<SyncRuntime> {
    let mut config = Config::default();
    config.reconciliation.enabled = false;
    config
        .strangler
        .routes
        .push(RouteConfig::new("checkout", MigrationStatus::Legacy));

    let legacy: Arc<dyn Collaborator> = Arc::new(InMemoryCollaborator::new(System::Legacy));
    let modern: Arc<dyn Collaborator> = Arc::new(InMemoryCollaborator::new(System::Backend));
    let runtime = SyncRuntime::with_parts(config, Arc::new(InMemoryEventStore::new()), Some(legacy), Some(modern))
        .unwrap();
    runtime
        .sagas()
        .register(
            SagaDefinition::new("NOOP").step(SagaStep::new("only", action_fn(|_| async { Ok(json!({"done": true})) }))),
        )
        .unwrap();
    Arc::new(runtime)
}

fn app(runtime: Arc<SyncRuntime>) -> Router {
    build_router(AppState::new(runtime))
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(serde_json::to_vec(&json).unwrap())
        }
        None => Body::empty(),
    };
    let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn test_health_reports_components() {
    let app = app(runtime());
    let (status, body) = call(&app, Method::GET, "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["components"]["eventStore"]["backend"], "memory");
    assert_eq!(body["components"]["eventStore"]["healthy"], true);

    let (status, body) = call(&app, Method::GET, "/health/live", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "alive");
}

#[tokio::test]
async fn test_open_breaker_degrades_health() {
    let runtime = runtime();
    let breaker = runtime.breakers().get_or_create("legacy");
    for _ in 0..runtime.config().resilience.circuit_breaker.failure_threshold {
        breaker.record_failure();
    }
    let app = app(runtime);

    let (status, body) = call(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["components"]["trippedBreakers"], json!(["legacy"]));

    let (_, body) = call(&app, Method::GET, paths::BREAKERS, None).await;
    assert_eq!(body["success"], true);
    assert!(body["data"]
        .as_array()
        .unwrap()
        .iter()
        .any(|b| b["dependency"] == "legacy" && b["state"] == "open"));
}

#[tokio::test]
async fn test_ingest_then_duplicate() {
    let app = app(runtime());
    let event = UnifiedEvent::new("USER_UPDATED", System::Frontend, json!({"entityType": "user", "entityId": "u-1", "changes": {"name": "Ada"}}));
    let body = serde_json::to_value(&event).unwrap();

    let (status, first) = call(&app, Method::POST, paths::EVENTS, Some(body.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["data"]["duplicate"], false);
    assert_eq!(first["data"]["eventId"], json!(event.id));

    let (status, again) = call(&app, Method::POST, paths::EVENTS, Some(body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["data"]["duplicate"], true);
    assert_eq!(again["data"]["sequence"], first["data"]["sequence"]);

    let (status, found) = call(&app, Method::GET, "/api/v1/events?types=USER_UPDATED&limit=10", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(found["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_malformed_changes_are_rejected() {
    let app = app(runtime());
    let event = UnifiedEvent::new("USER_UPDATED", System::Frontend, json!({"entityType": "user", "entityId": "u-1", "changes": "oops"}));

    let (status, body) = call(&app, Method::POST, paths::EVENTS, Some(serde_json::to_value(&event).unwrap())).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "INVALID_EVENT");
}

#[tokio::test]
async fn test_replay_window_is_validated() {
    let app = app(runtime());
    let (status, body) = call(
        &app,
        Method::POST,
        paths::REPLAY,
        Some(json!({"from": "2026-02-01T00:00:00Z", "to": "2026-01-01T00:00:00Z"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    let (status, body) = call(&app, Method::POST, paths::REPLAY, Some(json!({"eventTypes": ["USER_UPDATED"]}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["replayed"], 0);
}

#[tokio::test]
async fn test_saga_endpoints() {
    let app = app(runtime());

    let (status, body) = call(&app, Method::POST, paths::SAGAS, Some(json!({"sagaType": "NOOP", "data": {"k": 1}}))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["status"], "completed");
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = call(&app, Method::GET, &format!("{}/{}", paths::SAGAS, id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["saga_type"], "NOOP");

    let (_, body) = call(&app, Method::POST, &format!("{}/{}/cancel", paths::SAGAS, id), None).await;
    assert_eq!(body["data"]["cancelled"], false);

    let (_, body) = call(&app, Method::GET, "/api/v1/sagas?status=completed", None).await;
    assert_eq!(body["data"]["instances"].as_array().unwrap().len(), 1);
    assert_eq!(body["data"]["stats"]["NOOP"]["completed"], 1);

    let (status, body) = call(&app, Method::POST, paths::SAGAS, Some(json!({"sagaType": "MISSING"}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "SAGA_DEFINITION_NOT_FOUND");

    let missing = uuid::Uuid::new_v4();
    let (status, body) = call(&app, Method::GET, &format!("{}/{}", paths::SAGAS, missing), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "SAGA_NOT_FOUND");
}

#[tokio::test]
async fn test_route_migration_endpoints() {
    let app = app(runtime());

    let (status, body) = call(
        &app,
        Method::PUT,
        "/api/v1/routes/checkout",
        Some(json!({"status": "dual", "trafficSplitPercent": 20})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["traffic_split_percent"], 20);

    let (_, body) = call(&app, Method::GET, paths::ROUTES, None).await;
    let route = &body["data"][0];
    assert_eq!(route["config"]["name"], "checkout");
    assert_eq!(route["config"]["status"], "dual");
    assert_eq!(route["has_legacy"], true);

    let (status, body) = call(&app, Method::PUT, "/api/v1/routes/nowhere", Some(json!({"status": "migrated"}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "ROUTE_NOT_FOUND");
}

#[tokio::test]
async fn test_metrics_without_recorder_is_empty() {
    let app = app(runtime());
    let (status, body) = call(&app, Method::GET, "/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::Null);
}
