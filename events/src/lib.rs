//! Shared chat model and JSON event codec for the realtime relay.
//!
//! This crate owns the wire representation used by `server`, `client` and
//! `cli`. Relay traffic is JSON text frames shaped `{"event": .., "data": ..}`
//! where every event name maps to one typed payload. Required fields are
//! checked in [`ClientEvent::decode`] / [`ServerEvent::decode`] so handlers
//! never see half-formed events.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Error returned by the event codec and model constructors.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// The payload is not valid JSON or does not match any event shape.
    #[error("invalid event json: {0}")]
    Json(#[from] serde_json::Error),
    /// A required string field is missing or blank.
    #[error("missing or empty field `{0}`")]
    MissingField(&'static str),
    /// A chat violates its participant invariant.
    #[error("invalid chat: {0}")]
    InvalidChat(String),
}

/// Current UTC time truncated to microseconds, the precision Postgres keeps.
#[must_use]
pub fn now_utc() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now.replace_microsecond(now.microsecond()).unwrap_or(now)
}

fn require(value: &str, field: &'static str) -> Result<(), EventError> {
    if value.trim().is_empty() {
        return Err(EventError::MissingField(field));
    }
    Ok(())
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_false(value: &bool) -> bool {
    !*value
}

// =============================================================================
// CHAT
// =============================================================================

/// Conversation kind. A direct chat has exactly two participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Direct,
    Group,
}

impl ChatKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "direct" => Some(Self::Direct),
            "group" => Some(Self::Group),
            _ => None,
        }
    }
}

/// Denormalized pointer to the newest message of a chat, used for list sorting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    pub id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// A conversation between two or more users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: String,
    pub name: String,
    pub kind: ChatKind,
    pub participants: BTreeSet<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<LastMessage>,
}

impl Chat {
    /// Build a new chat with a fresh id.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::InvalidChat`] when the participant count does not
    /// fit the chat kind.
    pub fn new(
        name: impl Into<String>,
        kind: ChatKind,
        participants: impl IntoIterator<Item = String>,
    ) -> Result<Self, EventError> {
        let now = now_utc();
        let chat = Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            kind,
            participants: participants.into_iter().collect(),
            created_at: now,
            updated_at: now,
            last_message: None,
        };
        chat.validate()?;
        Ok(chat)
    }

    /// Check the participant invariant for the chat kind.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::InvalidChat`] on a violated invariant.
    pub fn validate(&self) -> Result<(), EventError> {
        require(&self.id, "id")?;
        if self.participants.iter().any(|p| p.trim().is_empty()) {
            return Err(EventError::InvalidChat("blank participant id".into()));
        }
        let count = self.participants.len();
        match self.kind {
            ChatKind::Direct if count != 2 => Err(EventError::InvalidChat(format!(
                "direct chat needs exactly 2 participants, got {count}"
            ))),
            ChatKind::Group if count < 2 => Err(EventError::InvalidChat(format!(
                "group chat needs at least 2 participants, got {count}"
            ))),
            _ => Ok(()),
        }
    }

    /// Add a participant. Returns `false` if the user was already present.
    ///
    /// # Errors
    ///
    /// Direct chats have a fixed membership and reject additions.
    pub fn add_participant(&mut self, user_id: &str) -> Result<bool, EventError> {
        require(user_id, "userId")?;
        if self.participants.contains(user_id) {
            return Ok(false);
        }
        if self.kind == ChatKind::Direct {
            return Err(EventError::InvalidChat("cannot add participants to a direct chat".into()));
        }
        self.participants.insert(user_id.to_owned());
        self.updated_at = now_utc();
        Ok(true)
    }

    /// Remove a participant. Returns `false` if the user was not present.
    ///
    /// # Errors
    ///
    /// Rejects removals that would drop the chat below its minimum size.
    pub fn remove_participant(&mut self, user_id: &str) -> Result<bool, EventError> {
        if !self.participants.contains(user_id) {
            return Ok(false);
        }
        if self.participants.len() <= 2 {
            return Err(EventError::InvalidChat(format!(
                "{} chat cannot drop below 2 participants",
                self.kind.as_str()
            )));
        }
        self.participants.remove(user_id);
        self.updated_at = now_utc();
        Ok(true)
    }

    /// Advance the last-message pointer if `timestamp` is the newest seen.
    /// Returns whether the pointer moved.
    pub fn record_message(&mut self, id: &str, timestamp: OffsetDateTime) -> bool {
        let newer = self
            .last_message
            .as_ref()
            .is_none_or(|last| timestamp > last.timestamp);
        if newer {
            self.last_message = Some(LastMessage { id: id.to_owned(), timestamp });
            if timestamp > self.updated_at {
                self.updated_at = timestamp;
            }
        }
        newer
    }

    /// Timestamp used to order the chat list: last message, else last update.
    #[must_use]
    pub fn last_activity(&self) -> OffsetDateTime {
        self.last_message
            .as_ref()
            .map_or(self.updated_at, |last| last.timestamp)
    }
}

// =============================================================================
// MESSAGE
// =============================================================================

/// Which delivery path produced a message copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Origin {
    Relay,
    ChangeFeed,
    Local,
}

/// One chat message. `id` is the sole deduplication key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default)]
    pub read_by: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Origin>,
    /// Client-assigned arrival counter, only used to break timestamp ties.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    /// Set on the sender's local copy until the store confirms it.
    #[serde(default, skip_serializing_if = "is_false")]
    pub unconfirmed: bool,
}

impl Message {
    /// New outgoing message with a fresh id. The sender has read it.
    pub fn new(chat_id: impl Into<String>, sender_id: impl Into<String>, content: impl Into<String>) -> Self {
        let sender_id = sender_id.into();
        Self {
            id: Uuid::new_v4().to_string(),
            chat_id: chat_id.into(),
            read_by: BTreeSet::from([sender_id.clone()]),
            sender_id,
            content: content.into(),
            timestamp: now_utc(),
            origin: None,
            sequence: None,
            unconfirmed: false,
        }
    }

    #[must_use]
    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = Some(origin);
        self
    }

    #[must_use]
    pub fn is_read_by(&self, user_id: &str) -> bool {
        self.read_by.contains(user_id)
    }

    /// Check required fields.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::MissingField`] naming the first blank field.
    pub fn validate(&self) -> Result<(), EventError> {
        require(&self.id, "id")?;
        require(&self.chat_id, "chatId")?;
        require(&self.sender_id, "senderId")?;
        require(&self.content, "content")
    }
}

// =============================================================================
// CHANGE FEED
// =============================================================================

/// A `messages` row in the store's native shape, as delivered by the change-feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default)]
    pub read_by: Vec<String>,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Self {
            id: row.id,
            chat_id: row.chat_id,
            sender_id: row.sender_id,
            content: row.content,
            timestamp: row.created_at,
            read_by: row.read_by.into_iter().collect(),
            origin: Some(Origin::ChangeFeed),
            sequence: None,
            unconfirmed: false,
        }
    }
}

impl From<&Message> for MessageRow {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id.clone(),
            chat_id: message.chat_id.clone(),
            sender_id: message.sender_id.clone(),
            content: message.content.clone(),
            created_at: message.timestamp,
            read_by: message.read_by.iter().cloned().collect(),
        }
    }
}

/// Row-change kinds published by the change-feed. Only inserts are emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    #[serde(rename = "INSERT")]
    Insert,
}

/// One change-feed notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub table: String,
    pub record: MessageRow,
}

impl ChangeEvent {
    #[must_use]
    pub fn insert(record: MessageRow) -> Self {
        Self { kind: ChangeKind::Insert, table: "messages".into(), record }
    }

    /// Decode one change-feed frame.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed JSON or blank row ids.
    pub fn decode(text: &str) -> Result<Self, EventError> {
        let event: Self = serde_json::from_str(text)?;
        require(&event.record.id, "id")?;
        require(&event.record.chat_id, "chat_id")?;
        Ok(event)
    }

    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }
}

// =============================================================================
// RELAY EVENTS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRef {
    pub chat_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub chat_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRef {
    pub user_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    pub user_id: String,
    pub status: PresenceStatus,
}

/// Sent back to the sender when a message could not be persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendFailure {
    pub id: String,
    pub chat_id: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

/// Events a client sends to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinChat(ChatRef),
    LeaveChat(ChatRef),
    SendMessage(Message),
    Typing(TypingPayload),
    StopTyping(TypingPayload),
    UserOnline(UserRef),
}

impl ClientEvent {
    /// Wire name of the event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinChat(_) => "join_chat",
            Self::LeaveChat(_) => "leave_chat",
            Self::SendMessage(_) => "send_message",
            Self::Typing(_) => "typing",
            Self::StopTyping(_) => "stop_typing",
            Self::UserOnline(_) => "user_online",
        }
    }

    /// Parse and validate one inbound relay frame.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Json`] for unknown events or missing fields and
    /// [`EventError::MissingField`] for blank identifiers.
    pub fn decode(text: &str) -> Result<Self, EventError> {
        let event: Self = serde_json::from_str(text)?;
        event.validate()?;
        Ok(event)
    }

    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Check required fields of the payload.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::MissingField`] naming the first blank field.
    pub fn validate(&self) -> Result<(), EventError> {
        match self {
            Self::JoinChat(r) | Self::LeaveChat(r) => require(&r.chat_id, "chatId"),
            Self::SendMessage(m) => m.validate(),
            Self::Typing(t) | Self::StopTyping(t) => {
                require(&t.chat_id, "chatId")?;
                require(&t.user_id, "userId")
            }
            Self::UserOnline(u) => require(&u.user_id, "userId"),
        }
    }
}

/// Events the relay pushes to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    NewMessage(Message),
    MessageAck(Message),
    MessageFailed(SendFailure),
    UserTyping(TypingPayload),
    UserStopTyping(TypingPayload),
    UserStatusChange(StatusChange),
    Error(ErrorPayload),
}

impl ServerEvent {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::NewMessage(_) => "new_message",
            Self::MessageAck(_) => "message_ack",
            Self::MessageFailed(_) => "message_failed",
            Self::UserTyping(_) => "user_typing",
            Self::UserStopTyping(_) => "user_stop_typing",
            Self::UserStatusChange(_) => "user_status_change",
            Self::Error(_) => "error",
        }
    }

    /// Build an `error` event.
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload { code: code.into(), message: message.into() })
    }

    /// Parse one outbound relay frame on the client side.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed frames or messages with blank ids.
    pub fn decode(text: &str) -> Result<Self, EventError> {
        let event: Self = serde_json::from_str(text)?;
        if let Self::NewMessage(m) | Self::MessageAck(m) = &event {
            m.validate()?;
        }
        Ok(event)
    }

    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
