//! Health check.

use axum::{Json, extract::State};
use serde::Serialize;

use crate::api::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Conversations with a live agent session.
    pub active_sessions: usize,
}

/// Health check endpoint.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let healthy = match state.db {
        Some(ref db) => db.is_healthy().await,
        None => true,
    };

    Json(HealthResponse {
        status: if healthy { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_sessions: state.registry.active_ids().await.len(),
    })
}
