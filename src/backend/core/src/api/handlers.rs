//! API request handlers with proper error propagation.
//!
//! All handlers return `Result<impl IntoResponse, ConfluenceError>` so that
//! errors are converted to HTTP status codes via the `IntoResponse`
//! implementation on `ConfluenceError`.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::{ApiResponse, AppState};
use crate::error::{ConfluenceError, Result};
use crate::events::{EventFilter, System, UnifiedEvent};
use crate::resilience::CircuitState;
use crate::saga::SagaStatus;
use crate::strangler::{MigrationStatus, RouteRequest};

// ═══════════════════════════════════════════════════════════════════════════════
// Health Check
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn liveness() -> impl IntoResponse {
    Json(json!({ "status": "alive" }))
}

/// Aggregate health: `unhealthy` when the store fails its probe, `degraded`
/// while any breaker is not closed.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let runtime = &state.runtime;
    let store = runtime.store();

    let store_error = store.health_check().await.err();
    let stored_events = store.count().await.ok();

    let breakers = runtime.breakers().snapshot();
    let tripped: Vec<&str> = breakers
        .iter()
        .filter(|b| b.state != CircuitState::Closed)
        .map(|b| b.dependency.as_str())
        .collect();

    let (status, code) = match (&store_error, tripped.is_empty()) {
        (Some(_), _) => ("unhealthy", StatusCode::SERVICE_UNAVAILABLE),
        (None, false) => ("degraded", StatusCode::OK),
        (None, true) => ("healthy", StatusCode::OK),
    };

    if let Some(ref e) = store_error {
        tracing::warn!(error = %e, backend = store.backend(), "Event store health check failed");
    }

    let body = json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339(),
        "components": {
            "eventStore": {
                "backend": store.backend(),
                "healthy": store_error.is_none(),
                "events": stored_events,
            },
            "bus": runtime.bus().stats(),
            "sync": runtime.coordinator().stats(),
            "conflicts": runtime.resolver().stats(),
            "sagas": runtime.sagas().stats(),
            "breakers": breakers,
            "trippedBreakers": tripped,
        }
    });

    (code, Json(body))
}

pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = state.metrics.as_ref().map(|h| h.render()).unwrap_or_default();

    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

// ═══════════════════════════════════════════════════════════════════════════════
// Event Handlers
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn ingest_event(
    State(state): State<AppState>,
    Json(event): Json<UnifiedEvent>,
) -> Result<impl IntoResponse> {
    let outcome = state.runtime.coordinator().ingest(event).await?;
    let status = if outcome.duplicate {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(ApiResponse::success(outcome))))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventQuery {
    /// Comma-separated event types
    pub types: Option<String>,
    pub source: Option<System>,
    pub correlation_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub after: Option<u64>,
    pub limit: Option<usize>,
}

impl EventQuery {
    fn into_filter(self) -> EventFilter {
        let mut filter = EventFilter::new()
            .with_range(self.from, self.to)
            .with_types(split_types(self.types.as_deref()));
        if let Some(source) = self.source {
            filter = filter.with_source(source);
        }
        if let Some(id) = self.correlation_id {
            filter = filter.with_correlation_id(id);
        }
        if let Some(after) = self.after {
            filter = filter.after(after);
        }
        filter.with_limit(self.limit.unwrap_or(100).min(1000))
    }
}

fn split_types(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect()
    })
    .unwrap_or_default()
}

pub async fn query_events(
    State(state): State<AppState>,
    Query(query): Query<EventQuery>,
) -> Result<impl IntoResponse> {
    let events = state.runtime.coordinator().query(&query.into_filter()).await?;
    Ok(Json(ApiResponse::success(events)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayRequest {
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub event_types: Vec<String>,
}

pub async fn replay_events(
    State(state): State<AppState>,
    Json(req): Json<ReplayRequest>,
) -> Result<impl IntoResponse> {
    if let (Some(from), Some(to)) = (req.from, req.to) {
        if from > to {
            return Err(ConfluenceError::validation("replay window: 'from' is after 'to'"));
        }
    }
    let report = state
        .runtime
        .coordinator()
        .replay_events(req.from, req.to, req.event_types)
        .await?;
    Ok(Json(ApiResponse::success(report)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Resilience and Conflict Handlers
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn list_breakers(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(state.runtime.breakers().snapshot()))
}

#[derive(Debug, Deserialize)]
pub struct ConflictQuery {
    pub limit: Option<usize>,
}

pub async fn list_conflicts(
    State(state): State<AppState>,
    Query(query): Query<ConflictQuery>,
) -> impl IntoResponse {
    let resolver = state.runtime.resolver();
    let limit = query.limit.unwrap_or(50);
    Json(ApiResponse::success(json!({
        "stats": resolver.stats(),
        "recent": resolver.audit_log(limit),
    })))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Saga Handlers
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
pub struct SagaQuery {
    pub status: Option<SagaStatus>,
}

pub async fn list_sagas(
    State(state): State<AppState>,
    Query(query): Query<SagaQuery>,
) -> impl IntoResponse {
    let sagas = state.runtime.sagas();
    Json(ApiResponse::success(json!({
        "stats": sagas.stats(),
        "types": sagas.saga_types(),
        "instances": sagas.list(query.status),
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSagaRequest {
    pub saga_type: String,
    #[serde(default)]
    pub data: Value,
}

/// Runs the saga to a terminal state before responding.
pub async fn start_saga(
    State(state): State<AppState>,
    Json(req): Json<StartSagaRequest>,
) -> Result<impl IntoResponse> {
    let sagas = state.runtime.sagas();
    let saga_id = sagas.execute(&req.saga_type, req.data).await?;
    let instance = sagas.get(saga_id).ok_or_else(|| ConfluenceError::saga_not_found(saga_id))?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(instance))))
}

pub async fn get_saga(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<impl IntoResponse> {
    let instance = state
        .runtime
        .sagas()
        .get(id)
        .ok_or_else(|| ConfluenceError::saga_not_found(id))?;
    Ok(Json(ApiResponse::success(instance)))
}

pub async fn cancel_saga(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<impl IntoResponse> {
    let cancelled = state.runtime.sagas().cancel(id)?;
    Ok(Json(ApiResponse::success(json!({
        "sagaId": id,
        "cancelled": cancelled,
    }))))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Strangler Route Handlers
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn list_routes(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(state.runtime.router().routes()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

pub async fn dispatch_route(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<DispatchRequest>,
) -> Result<impl IntoResponse> {
    let request = RouteRequest {
        route: name,
        user_id: req.user_id,
        payload: req.payload,
        metadata: req.metadata,
    };
    let response = state.runtime.router().route(request).await?;
    Ok(Json(ApiResponse::success(response)))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRouteRequest {
    pub status: MigrationStatus,
    #[serde(default)]
    pub traffic_split_percent: Option<u8>,
}

pub async fn update_route(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<UpdateRouteRequest>,
) -> Result<impl IntoResponse> {
    let config = state
        .runtime
        .router()
        .set_status(&name, req.status, req.traffic_split_percent)?;
    Ok(Json(ApiResponse::success(config)))
}
