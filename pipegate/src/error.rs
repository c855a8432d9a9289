//! Error types for the HTTP front door.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use pipegate_core::BridgeError;
use pipegate_core::jsonrpc::{JsonRpcId, error_response};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

/// Errors returned by front-door handlers.
#[derive(Error, Debug)]
pub enum FrontDoorError {
    /// No `Authorization` header (401).
    #[error("Missing Authorization header")]
    MissingAuth,

    /// `Authorization` header is not `Bearer <token>` (401).
    #[error("Invalid Authorization header format")]
    MalformedAuth,

    /// Bearer token does not match (403).
    #[error("Invalid API key")]
    InvalidApiKey,

    /// `POST /messages` without a session parameter (400).
    #[error("Missing session_id query parameter")]
    MissingSession,

    /// Body is not JSON (400).
    #[error("Invalid JSON body: {0}")]
    InvalidJson(String),

    /// Bridge rejected a message before an id could be read from it.
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    /// Bridge rejected a request carrying `id`.
    #[error("{source}")]
    Rejected { id: JsonRpcId, source: BridgeError },

    /// Prometheus text encoding failed (500).
    #[error("Failed to encode metrics: {0}")]
    Metrics(String),
}

/// HTTP status for a bridge error surfaced synchronously.
pub fn bridge_status(err: &BridgeError) -> StatusCode {
    match err {
        BridgeError::UnknownSession { .. } => StatusCode::NOT_FOUND,
        BridgeError::InvalidRequest { .. } | BridgeError::ParseError { .. } => {
            StatusCode::BAD_REQUEST
        }
        BridgeError::DuplicateRequestId { .. }
        | BridgeError::DuplicateDelivery { .. }
        | BridgeError::RouteDisabled => StatusCode::CONFLICT,
        BridgeError::SpawnError { .. }
        | BridgeError::WriteError { .. }
        | BridgeError::BackendRestarted { .. } => StatusCode::BAD_GATEWAY,
        BridgeError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
    }
}

fn jsonrpc_rejection(id: &JsonRpcId, err: &BridgeError) -> Response {
    let correlation_id = Uuid::new_v4().to_string();
    tracing::debug!(%id, correlation_id = %correlation_id, error = %err, "request rejected");
    let body = error_response(id, &err.to_jsonrpc_error(&correlation_id));
    (bridge_status(err), Json(body)).into_response()
}

impl IntoResponse for FrontDoorError {
    fn into_response(self) -> Response {
        match self {
            Self::Bridge(err) => jsonrpc_rejection(&JsonRpcId::Null, &err),
            Self::Rejected { id, source } => jsonrpc_rejection(&id, &source),
            other => {
                let status = match &other {
                    Self::MissingAuth | Self::MalformedAuth => StatusCode::UNAUTHORIZED,
                    Self::InvalidApiKey => StatusCode::FORBIDDEN,
                    Self::MissingSession | Self::InvalidJson(_) => StatusCode::BAD_REQUEST,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, Json(json!({ "error": other.to_string() }))).into_response()
            }
        }
    }
}

/// Failures that stop the server from starting.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] pipegate_core::config::ConfigError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
