//! Chat and message REST routes.
//!
//! Loading history and chat lists goes over HTTP; live traffic uses the
//! relay and change-feed websockets.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use events::{Chat, ChatKind, ErrorPayload, Message};
use serde::Deserialize;
use tracing::warn;

use crate::error::ErrorCode;
use crate::services::chat;
use crate::services::message::MessageError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChatBody {
    pub creator_id: String,
    pub name: String,
    pub kind: ChatKind,
    #[serde(default)]
    pub participants: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantBody {
    pub user_id: String,
}

/// `GET /api/users/:user_id/chats`: chats for a user, most recent first.
pub async fn list_chats(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<Chat>>, ApiError> {
    let chats = chat::list_chats(&state, &user_id)
        .await
        .map_err(message_error_response)?;
    Ok(Json(chats))
}

/// `POST /api/chats`: create a chat.
pub async fn create_chat(
    State(state): State<AppState>,
    Json(body): Json<CreateChatBody>,
) -> Result<(StatusCode, Json<Chat>), ApiError> {
    if body.creator_id.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "E_INVALID", "creatorId is required"));
    }
    let chat = chat::create_chat(&state, &body.creator_id, &body.name, body.kind, body.participants)
        .await
        .map_err(message_error_response)?;
    Ok((StatusCode::CREATED, Json(chat)))
}

/// `POST /api/chats/:id/participants`: add a participant.
pub async fn add_participant(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Json(body): Json<ParticipantBody>,
) -> Result<Json<Chat>, ApiError> {
    let chat = chat::add_participant(&state, &chat_id, &body.user_id)
        .await
        .map_err(message_error_response)?;
    Ok(Json(chat))
}

/// `DELETE /api/chats/:id/participants/:user_id`: remove a participant.
pub async fn remove_participant(
    State(state): State<AppState>,
    Path((chat_id, user_id)): Path<(String, String)>,
) -> Result<Json<Chat>, ApiError> {
    let chat = chat::remove_participant(&state, &chat_id, &user_id)
        .await
        .map_err(message_error_response)?;
    Ok(Json(chat))
}

/// `GET /api/chats/:id/messages`: full history, oldest first.
pub async fn list_messages(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let messages = chat::chat_messages(&state, &chat_id)
        .await
        .map_err(message_error_response)?;
    Ok(Json(messages))
}

/// `POST /api/messages/:id/read`: add the user to `readBy`.
pub async fn mark_read(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
    Json(body): Json<ParticipantBody>,
) -> Result<Json<Message>, ApiError> {
    let message = chat::mark_read(&state, &message_id, &body.user_id)
        .await
        .map_err(message_error_response)?;
    Ok(Json(message))
}

/// Error response: HTTP status plus an `{code, message}` body.
pub(crate) type ApiError = (StatusCode, Json<ErrorPayload>);

fn api_error(status: StatusCode, code: &str, message: impl Into<String>) -> ApiError {
    (status, Json(ErrorPayload { code: code.to_owned(), message: message.into() }))
}

pub(crate) fn message_error_status(err: &MessageError) -> StatusCode {
    match err {
        MessageError::ChatNotFound(_) | MessageError::NotFound(_) => StatusCode::NOT_FOUND,
        MessageError::NotParticipant { .. } => StatusCode::FORBIDDEN,
        MessageError::Conflict(_) => StatusCode::CONFLICT,
        MessageError::Invalid(_) => StatusCode::BAD_REQUEST,
        MessageError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) fn message_error_response(err: MessageError) -> ApiError {
    let status = message_error_status(&err);
    if status.is_server_error() {
        warn!(code = err.error_code(), error = %err, "chat route failed");
    }
    api_error(status, err.error_code(), err.to_string())
}

#[cfg(test)]
#[path = "chats_test.rs"]
mod tests;
