//! Streaming endpoint.

use std::convert::Infallible;

use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tracing::{instrument, warn};

use crate::api::error::{ApiError, ApiResult, ValidationIssue};
use crate::api::state::AppState;
use crate::canon::OutboundEvent;

/// Request to answer the latest user message of a conversation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRequest {
    #[serde(default)]
    pub session_id: Option<String>,
}

impl StreamRequest {
    fn validate(self) -> Result<String, ApiError> {
        match self.session_id {
            None => Err(ApiError::invalid("sessionId", "Required")),
            Some(id) if id.trim().is_empty() => {
                Err(ApiError::invalid("sessionId", "Must not be empty"))
            }
            Some(id) => Ok(id),
        }
    }
}

/// Stream the assistant's reply as server-sent events.
///
/// POST /api/chat/stream
///
/// Errors before the first byte are plain HTTP errors. Everything after is
/// an in-band `error` event.
#[instrument(skip(state, payload))]
pub async fn stream_chat(
    State(state): State<AppState>,
    payload: Result<Json<StreamRequest>, JsonRejection>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let Json(request) = payload.map_err(|rejection| {
        ApiError::Validation(vec![ValidationIssue::new("body", rejection.body_text())])
    })?;
    let conversation_id = request.validate()?;

    let events = state.coordinator.start(&conversation_id).await?;
    let keepalive = state.coordinator.config().keepalive();

    let stream = events.map(|event| Ok::<_, Infallible>(sse_event(&event)));

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(keepalive).text(" keepalive")))
}

fn sse_event(event: &OutboundEvent) -> Event {
    match event.to_json() {
        Ok(json) => Event::default().event(event.kind()).data(json),
        Err(e) => {
            warn!(kind = event.kind(), error = %e, "Failed to encode stream event");
            Event::default()
                .event("error")
                .data(r#"{"type":"error","error":"Failed to encode event"}"#)
        }
    }
}
