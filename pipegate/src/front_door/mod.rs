//! HTTP front door.
//!
//! | Route | Auth | Purpose |
//! |-------|------|---------|
//! | `GET /sse` | bearer | open or resume a session's push stream |
//! | `POST /messages?session_id=` | bearer | submit one JSON-RPC message |
//! | `POST /route` | bearer | switch the backend (when enabled) |
//! | `GET /health` | none | liveness and backend status |
//! | `GET /metrics` | none | Prometheus text |

pub mod auth;
pub mod handlers;
pub mod sse;

use axum::Router;
use axum::middleware;
use axum::routing::{get, post};
use pipegate_core::{Bridge, SessionId};
use prometheus_client::registry::Registry;
use std::sync::Arc;

/// Query parameter carrying the session token.
///
/// Used both when advertising the endpoint and when parsing submissions.
pub const SESSION_QUERY_PARAM: &str = "session_id";

/// Query parameter that marks a new session as interested in unrouted
/// backend traffic.
pub const NOTIFICATIONS_QUERY_PARAM: &str = "notifications";

/// Submission address advertised in the `endpoint` event.
pub fn endpoint_path(session: &SessionId) -> String {
    format!("/messages/?{SESSION_QUERY_PARAM}={session}")
}

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub bridge: Arc<Bridge>,
    pub api_key: Option<Arc<str>>,
    pub prom_registry: Arc<Registry>,
}

impl AppState {
    pub fn new(bridge: Arc<Bridge>, api_key: Option<String>, prom_registry: Arc<Registry>) -> Self {
        Self {
            bridge,
            api_key: api_key.map(Arc::from),
            prom_registry,
        }
    }
}

/// Build the router. Authentication is applied to the protected routes only.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/sse", get(sse::sse_handler))
        .route("/sse/", get(sse::sse_handler))
        .route("/messages", post(handlers::messages_handler))
        .route("/messages/", post(handlers::messages_handler))
        .route("/route", post(handlers::route_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ));

    let public = Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/metrics", get(handlers::metrics_handler));

    protected.merge(public).with_state(state)
}
