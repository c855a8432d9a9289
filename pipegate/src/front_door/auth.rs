//! Bearer-token authentication.
//!
//! With no API key configured every request passes.

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;

use super::AppState;
use crate::error::FrontDoorError;

/// Extract the token from an `Authorization: Bearer <token>` value.
pub fn bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, FrontDoorError> {
    let Some(expected) = state.api_key.as_deref() else {
        return Ok(next.run(request).await);
    };

    let header = request
        .headers()
        .get(AUTHORIZATION)
        .ok_or(FrontDoorError::MissingAuth)?;
    let token = header
        .to_str()
        .ok()
        .and_then(bearer_token)
        .ok_or(FrontDoorError::MalformedAuth)?;

    if token != expected {
        tracing::warn!(path = %request.uri().path(), "rejected request with invalid API key");
        return Err(FrontDoorError::InvalidApiKey);
    }

    Ok(next.run(request).await)
}
