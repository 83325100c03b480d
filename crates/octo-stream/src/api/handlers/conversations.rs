//! Conversation, message and subagent handlers.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::chat::{Conversation, CreateConversation, CreateMessage, Message, MessageRole, Subagent};
use crate::stream::derive_title;
use crate::subagent::SubagentPhase;

/// Title budget for conversations titled from the API.
const API_TITLE_MAX_CHARS: usize = 80;

/// Create a conversation.
///
/// POST /api/conversations
#[instrument(skip(state))]
pub async fn create_conversation(
    State(state): State<AppState>,
    Json(request): Json<CreateConversation>,
) -> ApiResult<(StatusCode, Json<Conversation>)> {
    if let Some(ref id) = request.id
        && id.trim().is_empty()
    {
        return Err(ApiError::invalid("id", "Must not be empty"));
    }

    let conversation = state.store.create_conversation(request).await?;
    info!(conversation_id = %conversation.id, "Created conversation");
    Ok((StatusCode::CREATED, Json(conversation)))
}

/// GET /api/conversations/{id}
pub async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Conversation>> {
    state
        .store
        .get_conversation(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Conversation {} not found", id)))
}

/// Request to append a message.
#[derive(Debug, Deserialize)]
pub struct AddMessageRequest {
    /// Defaults to `user`.
    #[serde(default)]
    pub role: Option<MessageRole>,
    pub content: String,
}

/// Append a message to a conversation.
///
/// The first user message titles an untitled conversation.
///
/// POST /api/conversations/{id}/messages
#[instrument(skip(state, request))]
pub async fn add_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<AddMessageRequest>,
) -> ApiResult<(StatusCode, Json<Message>)> {
    if request.content.trim().is_empty() {
        return Err(ApiError::invalid("content", "Must not be empty"));
    }

    let conversation = state
        .store
        .get_conversation(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Conversation {} not found", id)))?;

    let role = request.role.unwrap_or(MessageRole::User);
    let message = state
        .store
        .add_message(
            &id,
            CreateMessage {
                role,
                content: request.content,
            },
        )
        .await?;

    if role == MessageRole::User && conversation.title.as_deref().is_none_or(str::is_empty) {
        let title = derive_title(&message.content, API_TITLE_MAX_CHARS);
        if let Err(e) = state.store.set_title(&id, &title).await {
            warn!(conversation_id = %id, error = %e, "Failed to set conversation title");
        }
    }

    Ok((StatusCode::CREATED, Json(message)))
}

/// GET /api/conversations/{id}/messages
pub async fn list_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<Message>>> {
    ensure_conversation(&state, &id).await?;
    Ok(Json(state.store.list_messages(&id).await?))
}

/// Current subagents of a conversation.
///
/// Polling backstop for completions the stream did not deliver.
///
/// GET /api/conversations/{id}/subagents
pub async fn list_subagents(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<SubagentResponse>>> {
    ensure_conversation(&state, &id).await?;
    let records = state.tracker().list(&id).await?;
    Ok(Json(records.into_iter().map(SubagentResponse::from).collect()))
}

/// Subagent record plus its client-facing phase.
#[derive(Debug, Serialize)]
pub struct SubagentResponse {
    #[serde(flatten)]
    pub record: Subagent,
    pub phase: SubagentPhase,
}

impl From<Subagent> for SubagentResponse {
    fn from(record: Subagent) -> Self {
        let phase = SubagentPhase::of(&record);
        Self { record, phase }
    }
}

#[derive(Debug, Serialize)]
pub struct DisposeResponse {
    pub disposed: bool,
}

/// Shut down the conversation's agent session.
///
/// DELETE /api/conversations/{id}/session
#[instrument(skip(state))]
pub async fn dispose_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<DisposeResponse>> {
    if let Some(handle) = state.registry.get(&id).await
        && handle.is_streaming()
    {
        return Err(ApiError::conflict(format!(
            "Conversation {} is streaming a response",
            id
        )));
    }

    let disposed = state.registry.dispose(&id).await?;
    Ok(Json(DisposeResponse { disposed }))
}

async fn ensure_conversation(state: &AppState, id: &str) -> ApiResult<()> {
    match state.store.get_conversation(id).await? {
        Some(_) => Ok(()),
        None => Err(ApiError::not_found(format!("Conversation {} not found", id))),
    }
}
