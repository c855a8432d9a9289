//! `GET /sse`: the push stream.
//!
//! The first event is `endpoint`, carrying the submission address for this
//! session. Replies follow as `message` events; keepalives are `: ping`
//! comments.

use axum::extract::{Query, State};
use axum::response::sse::{Event, Sse};
use futures_util::{Stream, StreamExt, stream};
use pipegate_core::SessionId;
use pipegate_core::session::Frame;
use std::collections::HashMap;
use std::convert::Infallible;

use super::{AppState, NOTIFICATIONS_QUERY_PARAM, SESSION_QUERY_PARAM, endpoint_path};
use crate::error::FrontDoorError;

fn frame_event(frame: Frame) -> Event {
    match frame {
        Frame::Message(value) => Event::default().event("message").data(value.to_string()),
        Frame::Keepalive => Event::default().comment("ping"),
    }
}

pub async fn sse_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, FrontDoorError> {
    let resume = params
        .get(SESSION_QUERY_PARAM)
        .map(|id| SessionId::from(id.as_str()));
    let interested = params
        .get(NOTIFICATIONS_QUERY_PARAM)
        .is_some_and(|v| v == "true" || v == "1");

    let handle = state.bridge.open_stream(resume.as_ref(), interested)?;
    let endpoint = Event::default()
        .event("endpoint")
        .data(endpoint_path(handle.session()));

    let frames = handle.map(|frame| Ok(frame_event(frame)));
    Ok(Sse::new(stream::once(async move { Ok(endpoint) }).chain(frames)))
}
