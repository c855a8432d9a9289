//! `POST /messages`, `POST /route`, `GET /health` and `GET /metrics`.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use pipegate_core::config::BackendSpec;
use pipegate_core::jsonrpc::parse_id;
use pipegate_core::{HealthSnapshot, SessionId, SubmitOutcome};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

use super::{AppState, SESSION_QUERY_PARAM};
use crate::error::FrontDoorError;

/// Accept one JSON-RPC message for a session.
///
/// 202 means the message was accepted, not that a reply will follow.
pub async fn messages_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<Response, FrontDoorError> {
    let session = params
        .get(SESSION_QUERY_PARAM)
        .filter(|s| !s.is_empty())
        .map(|s| SessionId::from(s.as_str()))
        .ok_or(FrontDoorError::MissingSession)?;
    state.bridge.registry().route_submission(&session)?;

    let message: Value =
        serde_json::from_slice(&body).map_err(|e| FrontDoorError::InvalidJson(e.to_string()))?;
    let id = message.get("id").and_then(|v| parse_id(v).ok());

    match state.bridge.submit(&session, message).await {
        Ok(outcome) => {
            if let SubmitOutcome::Forwarded { upstream_id } = outcome {
                tracing::debug!(session_id = %session, upstream_id, "request accepted");
            }
            Ok((StatusCode::ACCEPTED, "Accepted").into_response())
        }
        Err(source) => Err(match id {
            Some(id) => FrontDoorError::Rejected { id, source },
            None => FrontDoorError::Bridge(source),
        }),
    }
}

/// Switch the backend. Responds with the new backend's status.
pub async fn route_handler(
    State(state): State<AppState>,
    Json(spec): Json<BackendSpec>,
) -> Result<Response, FrontDoorError> {
    let status = state.bridge.reroute(spec).await?;
    Ok(Json(status).into_response())
}

#[derive(Serialize)]
struct HealthBody {
    #[serde(flatten)]
    snapshot: HealthSnapshot,
    api_key_configured: bool,
}

pub async fn health_handler(State(state): State<AppState>) -> Response {
    let snapshot = state.bridge.health();
    let status = if snapshot.backend.alive {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = HealthBody {
        snapshot,
        api_key_configured: state.api_key.is_some(),
    };
    (status, Json(body)).into_response()
}

pub async fn metrics_handler(State(state): State<AppState>) -> Result<Response, FrontDoorError> {
    let mut buffer = String::new();
    prometheus_client::encoding::text::encode(&mut buffer, &state.prom_registry).map_err(|e| {
        tracing::error!(error = %e, "failed to encode metrics");
        FrontDoorError::Metrics(e.to_string())
    })?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buffer,
    )
        .into_response())
}
