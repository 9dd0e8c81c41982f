use axum::{
    Extension, Json,
    extract::{Path, State, rejection::PathRejection},
    response::IntoResponse,
};
use tracing::info;

use parley_db::models::ConversationRow;
use parley_gateway::identity::Identity;
use parley_types::api::{ConversationResponse, DeleteResponse, MessageResponse};
use parley_types::models::{ConversationId, UserId};

use crate::auth::AppState;
use crate::error::{ApiError, blocking};

/// GET /conversations/{user_id}. Callers may only list their own.
pub async fn list_conversations(
    State(state): State<AppState>,
    path: Result<Path<UserId>, PathRejection>,
    Extension(caller): Extension<Identity>,
) -> Result<impl IntoResponse, ApiError> {
    let Path(user_id) = path?;
    if user_id != caller.user_id {
        return Err(ApiError::Forbidden("Cannot list another user's conversations".into()));
    }

    let store = state.store.clone();
    let rows = blocking(move || Ok(store.list_conversations(user_id)?)).await?;

    let conversations: Vec<ConversationResponse> = rows.into_iter().map(Into::into).collect();
    Ok(Json(conversations))
}

/// GET /messages/{conversation_id}, ordered by (timestamp, id).
pub async fn get_messages(
    State(state): State<AppState>,
    path: Result<Path<ConversationId>, PathRejection>,
    Extension(caller): Extension<Identity>,
) -> Result<impl IntoResponse, ApiError> {
    let Path(conversation_id) = path?;

    let store = state.store.clone();
    let rows = blocking(move || {
        let conversation = store.get_conversation(conversation_id)?;
        authorize(conversation, caller.user_id)?;
        Ok(store.list_messages(conversation_id)?)
    })
    .await?;

    let messages: Vec<MessageResponse> = rows.into_iter().map(Into::into).collect();
    Ok(Json(messages))
}

/// DELETE /conversation/{conversation_id}. Messages go with it.
pub async fn delete_conversation(
    State(state): State<AppState>,
    path: Result<Path<ConversationId>, PathRejection>,
    Extension(caller): Extension<Identity>,
) -> Result<impl IntoResponse, ApiError> {
    let Path(conversation_id) = path?;

    let store = state.store.clone();
    let user_id = caller.user_id;
    blocking(move || {
        let conversation = store.get_conversation(conversation_id)?;
        authorize(conversation, user_id)?;
        if !store.delete_conversation(conversation_id)? {
            // Lost a race with another delete
            return Err(ApiError::NotFound("Conversation not found".into()));
        }
        Ok(())
    })
    .await?;

    info!("{} ({}) deleted conversation {}", caller.username, caller.user_id, conversation_id);
    Ok(Json(DeleteResponse {
        message: "Conversation deleted successfully".into(),
    }))
}

fn authorize(conversation: Option<ConversationRow>, user: UserId) -> Result<ConversationRow, ApiError> {
    let conversation = conversation.ok_or_else(|| ApiError::NotFound("Conversation not found".into()))?;
    if !conversation.has_participant(user) {
        return Err(ApiError::Forbidden("Not a participant of this conversation".into()));
    }
    Ok(conversation)
}
