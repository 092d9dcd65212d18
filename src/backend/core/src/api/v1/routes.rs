//! V1 API routes.

use axum::{
    routing::{get, post},
    Router,
};

use crate::api::{handlers, AppState};

/// V1 API prefix.
pub const V1_PREFIX: &str = "/api/v1";

/// Build the V1 API router.
///
/// All routes are mounted under `/api/v1/`.
///
/// # Endpoints
///
/// ## Events
/// - `POST /api/v1/events` - Ingest an event
/// - `GET /api/v1/events` - Query stored events
/// - `POST /api/v1/replay` - Replay stored events to subscribers
///
/// ## Resilience and conflicts
/// - `GET /api/v1/breakers` - Circuit breaker state per dependency
/// - `GET /api/v1/conflicts` - Conflict stats and recent resolutions
///
/// ## Sagas
/// - `GET /api/v1/sagas` - Saga instances and per-type stats
/// - `POST /api/v1/sagas` - Start a saga of a registered type
/// - `GET /api/v1/sagas/:id` - One saga instance
/// - `POST /api/v1/sagas/:id/cancel` - Request cancellation
///
/// ## Strangler routes
/// - `GET /api/v1/routes` - Routes with migration status and stats
/// - `POST /api/v1/routes/:name` - Dispatch a request through a route
/// - `PUT /api/v1/routes/:name` - Change a route's migration status
pub fn v1_router() -> Router<AppState> {
    Router::new()
        .route("/events", post(handlers::ingest_event).get(handlers::query_events))
        .route("/replay", post(handlers::replay_events))
        .route("/breakers", get(handlers::list_breakers))
        .route("/conflicts", get(handlers::list_conflicts))
        .route("/sagas", get(handlers::list_sagas).post(handlers::start_saga))
        .route("/sagas/:id", get(handlers::get_saga))
        .route("/sagas/:id/cancel", post(handlers::cancel_saga))
        .route("/routes", get(handlers::list_routes))
        .route("/routes/:name", post(handlers::dispatch_route).put(handlers::update_route))
}

/// V1 API route constants for use in clients and documentation.
pub mod paths {
    pub const EVENTS: &str = "/api/v1/events";
    pub const REPLAY: &str = "/api/v1/replay";
    pub const BREAKERS: &str = "/api/v1/breakers";
    pub const CONFLICTS: &str = "/api/v1/conflicts";
    pub const SAGAS: &str = "/api/v1/sagas";
    pub const ROUTES: &str = "/api/v1/routes";
}
