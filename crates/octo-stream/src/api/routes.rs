//! API route definitions.

use axum::{
    Router,
    routing::{delete, get, post},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::handlers;
use super::state::AppState;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let api_routes = Router::new()
        // Streaming
        .route("/chat/stream", post(handlers::stream_chat))
        // Conversations
        .route("/conversations", post(handlers::create_conversation))
        .route("/conversations/{id}", get(handlers::get_conversation))
        .route(
            "/conversations/{id}/messages",
            get(handlers::list_messages).post(handlers::add_message),
        )
        .route("/conversations/{id}/subagents", get(handlers::list_subagents))
        .route("/conversations/{id}/session", delete(handlers::dispose_session));

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api", api_routes)
        .layer(trace_layer)
        .layer(cors)
        .with_state(state)
}
