//! Chat metadata: creation, membership changes and listing.
//!
//! Membership rules live on [`events::Chat`]; this module loads the chat,
//! applies the change and writes the participant set back.

use events::{Chat, ChatKind, Message};
use tracing::info;

use crate::services::message::MessageError;
use crate::state::AppState;

/// Create a chat. The creator is always a participant.
///
/// # Errors
///
/// Returns [`MessageError::Invalid`] when the participant set does not fit
/// the chat kind.
pub async fn create_chat(
    state: &AppState,
    creator_id: &str,
    name: &str,
    kind: ChatKind,
    participants: Vec<String>,
) -> Result<Chat, MessageError> {
    let members = participants
        .into_iter()
        .chain(std::iter::once(creator_id.to_owned()));
    let chat = Chat::new(name, kind, members)?;
    state.store.create_chat(&chat).await
}

/// # Errors
///
/// Returns [`MessageError::ChatNotFound`] for an unknown chat.
pub async fn get_chat(state: &AppState, chat_id: &str) -> Result<Chat, MessageError> {
    state
        .store
        .get_chat(chat_id)
        .await?
        .ok_or_else(|| MessageError::ChatNotFound(chat_id.to_owned()))
}

/// Chats for a user, most recently active first.
///
/// # Errors
///
/// Propagates store errors.
pub async fn list_chats(state: &AppState, user_id: &str) -> Result<Vec<Chat>, MessageError> {
    let mut chats = state.store.list_chats_for_user(user_id).await?;
    chats.sort_by(|a, b| b.last_activity().cmp(&a.last_activity()).then_with(|| a.id.cmp(&b.id)));
    Ok(chats)
}

/// # Errors
///
/// Direct chats reject new participants.
pub async fn add_participant(state: &AppState, chat_id: &str, user_id: &str) -> Result<Chat, MessageError> {
    let mut chat = get_chat(state, chat_id).await?;
    if chat.add_participant(user_id)? {
        state.store.update_participants(&chat).await?;
        info!(%chat_id, %user_id, "participant added");
    }
    Ok(chat)
}

/// # Errors
///
/// Rejects removals that leave fewer than two participants.
pub async fn remove_participant(state: &AppState, chat_id: &str, user_id: &str) -> Result<Chat, MessageError> {
    let mut chat = get_chat(state, chat_id).await?;
    if chat.remove_participant(user_id)? {
        state.store.update_participants(&chat).await?;
        info!(%chat_id, %user_id, "participant removed");
    }
    Ok(chat)
}

/// Message history of a chat, oldest first.
///
/// # Errors
///
/// Returns [`MessageError::ChatNotFound`] for an unknown chat.
pub async fn chat_messages(state: &AppState, chat_id: &str) -> Result<Vec<Message>, MessageError> {
    get_chat(state, chat_id).await?;
    state.store.list_messages(chat_id).await
}

/// Record that `user_id` has read a message.
///
/// # Errors
///
/// Returns [`MessageError::NotFound`] for an unknown message.
pub async fn mark_read(state: &AppState, message_id: &str, user_id: &str) -> Result<Message, MessageError> {
    if user_id.trim().is_empty() {
        return Err(events::EventError::MissingField("userId").into());
    }
    state.store.mark_read(message_id, user_id).await
}

#[cfg(test)]
#[path = "chat_test.rs"]
mod tests;
