//! Network seams used by the chat session.
//!
//! Three independent channels reach the server: the message log (REST, the
//! source of truth), the relay link (websocket push plus publish), and the
//! change-feed (websocket push of committed inserts). The session only sees
//! these traits; [`api`], [`relay`] and [`feed`] provide the real adapters.

pub mod api;
pub mod feed;
pub mod relay;

use async_trait::async_trait;
use events::{Chat, ChatKind, ClientEvent, Message, MessageRow, ServerEvent};
use serde::Serialize;

use crate::error::ClientError;
use crate::subscription::Subscription;

/// Request body for creating a chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewChat {
    pub creator_id: String,
    pub name: String,
    pub kind: ChatKind,
    pub participants: Vec<String>,
}

/// Durable message log.
#[async_trait]
pub trait MessageLog: Send + Sync {
    async fn list_chats(&self, user_id: &str) -> Result<Vec<Chat>, ClientError>;
    async fn create_chat(&self, chat: &NewChat) -> Result<Chat, ClientError>;
    /// Full history of a chat, oldest first.
    async fn load_messages(&self, chat_id: &str) -> Result<Vec<Message>, ClientError>;
    async fn mark_read(&self, message_id: &str, user_id: &str) -> Result<Message, ClientError>;
}

/// Realtime relay connection.
#[async_trait]
pub trait RelayLink: Send + Sync {
    /// Fire-and-forget event (join, leave, typing, presence).
    async fn emit(&self, event: ClientEvent) -> Result<(), ClientError>;
    /// Send a message and wait for the relay to confirm persistence.
    /// Returns the stored copy.
    async fn publish(&self, message: Message) -> Result<Message, ClientError>;
    /// Stream of every event pushed by the relay.
    fn subscribe(&self) -> Subscription<ServerEvent>;
}

/// Change-feed of committed message inserts.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe_inserts(&self, chat_id: &str) -> Result<Subscription<MessageRow>, ClientError>;
}

/// Turn an `http(s)://` base URL into a `ws(s)://` URL for `path`.
///
/// # Errors
///
/// Returns [`ClientError::InvalidBaseUrl`] for any other scheme.
pub fn ws_url(base_url: &str, path: &str) -> Result<String, ClientError> {
    let base_url = base_url.trim_end_matches('/');
    if let Some(rest) = base_url.strip_prefix("http://") {
        return Ok(format!("ws://{rest}{path}"));
    }
    if let Some(rest) = base_url.strip_prefix("https://") {
        return Ok(format!("wss://{rest}{path}"));
    }
    Err(ClientError::InvalidBaseUrl(base_url.to_owned()))
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;

#[cfg(test)]
#[path = "fakes_test.rs"]
pub mod fakes;
