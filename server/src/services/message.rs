//! Message service: the persisted message log and the relay publish path.
//!
//! DESIGN
//! ======
//! `MessageStore` is the seam between the relay and Postgres. The relay
//! persists first and broadcasts second: a `new_message` event always carries
//! the stored record, so every recipient sees the same id and timestamp.
//! Inserts are idempotent on `id`, which makes a client resend of an
//! unconfirmed message safe.
//!
//! ERROR HANDLING
//! ==============
//! Persistence failures are logged here and returned to the caller; nothing
//! is broadcast for a message the store did not accept.

use async_trait::async_trait;
use events::{Chat, ChatKind, LastMessage, Message, Origin, ServerEvent};
use sqlx::PgPool;
use time::OffsetDateTime;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::ErrorCode;
use crate::services::room;
use crate::state::AppState;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("chat not found: {0}")]
    ChatNotFound(String),
    #[error("message not found: {0}")]
    NotFound(String),
    #[error("user {user_id} is not a participant of chat {chat_id}")]
    NotParticipant { chat_id: String, user_id: String },
    #[error("message id {0} is already used by a different message")]
    Conflict(String),
    #[error("invalid payload: {0}")]
    Invalid(#[from] events::EventError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ErrorCode for MessageError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::ChatNotFound(_) => "E_CHAT_NOT_FOUND",
            Self::NotFound(_) => "E_MESSAGE_NOT_FOUND",
            Self::NotParticipant { .. } => "E_NOT_PARTICIPANT",
            Self::Conflict(_) => "E_MESSAGE_CONFLICT",
            Self::Invalid(_) => "E_INVALID",
            Self::Database(_) => "E_DATABASE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

/// Durable storage for chats and messages.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert a message with its client-assigned id and return the stored
    /// record. Re-inserting an identical message returns the existing row.
    async fn insert_message(&self, message: &Message) -> Result<Message, MessageError>;

    async fn get_message(&self, message_id: &str) -> Result<Option<Message>, MessageError>;

    /// All messages of a chat ordered by timestamp, then id.
    async fn list_messages(&self, chat_id: &str) -> Result<Vec<Message>, MessageError>;

    /// Add `user_id` to the message's `readBy` set.
    async fn mark_read(&self, message_id: &str, user_id: &str) -> Result<Message, MessageError>;

    async fn create_chat(&self, chat: &Chat) -> Result<Chat, MessageError>;

    async fn get_chat(&self, chat_id: &str) -> Result<Option<Chat>, MessageError>;

    /// Chats the user participates in, most recently active first.
    async fn list_chats_for_user(&self, user_id: &str) -> Result<Vec<Chat>, MessageError>;

    /// Replace the stored participant set with `chat.participants`.
    async fn update_participants(&self, chat: &Chat) -> Result<(), MessageError>;
}

// =============================================================================
// PUBLISH
// =============================================================================

/// Persist a message and broadcast the stored record to its room.
///
/// The room receives `new_message` on every member connection, the
/// publisher's included. Nothing is broadcast when the insert fails.
///
/// # Errors
///
/// Returns validation and store errors unchanged.
pub async fn publish_message(state: &AppState, connection_id: Uuid, message: Message) -> Result<Message, MessageError> {
    message.validate()?;
    let message = Message { origin: None, sequence: None, unconfirmed: false, ..message };

    let mut persisted = match state.store.insert_message(&message).await {
        Ok(persisted) => persisted,
        Err(e) => {
            error!(error = %e, %connection_id, id = %message.id, chat_id = %message.chat_id, "message persist failed");
            return Err(e);
        }
    };
    persisted.origin = Some(Origin::Relay);

    let delivered = room::broadcast(state, &persisted.chat_id, &ServerEvent::NewMessage(persisted.clone()), None).await;
    info!(%connection_id, id = %persisted.id, chat_id = %persisted.chat_id, delivered, "message published");
    Ok(persisted)
}

// =============================================================================
// POSTGRES STORE
// =============================================================================

type MessageTuple = (String, String, String, String, OffsetDateTime, Vec<String>);

type ChatTuple = (
    String,
    String,
    String,
    OffsetDateTime,
    OffsetDateTime,
    Option<String>,
    Option<OffsetDateTime>,
    Vec<String>,
);

const MESSAGE_COLUMNS: &str = "id, chat_id, sender_id, content, created_at, read_by";

const CHAT_SELECT: &str = "SELECT c.id, c.name, c.kind, c.created_at, c.updated_at, c.last_message_id, c.last_message_at, \
     ARRAY(SELECT p.user_id FROM chat_participants p WHERE p.chat_id = c.id ORDER BY p.user_id) AS participants \
     FROM chats c";

/// Postgres-backed [`MessageStore`].
#[derive(Clone)]
pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn message_from_tuple((id, chat_id, sender_id, content, created_at, read_by): MessageTuple) -> Message {
    Message {
        id,
        chat_id,
        sender_id,
        content,
        timestamp: created_at,
        read_by: read_by.into_iter().collect(),
        origin: None,
        sequence: None,
        unconfirmed: false,
    }
}

fn chat_from_tuple(row: ChatTuple) -> Result<Chat, MessageError> {
    let (id, name, kind, created_at, updated_at, last_id, last_at, participants) = row;
    let Some(kind) = ChatKind::parse(&kind) else {
        return Err(events::EventError::InvalidChat(format!("unknown chat kind {kind}")).into());
    };
    let last_message = match (last_id, last_at) {
        (Some(id), Some(timestamp)) => Some(LastMessage { id, timestamp }),
        _ => None,
    };
    Ok(Chat {
        id,
        name,
        kind,
        participants: participants.into_iter().collect(),
        created_at,
        updated_at,
        last_message,
    })
}

/// True when a stored row and an incoming message describe the same send.
fn same_message(stored: &Message, incoming: &Message) -> bool {
    stored.chat_id == incoming.chat_id && stored.sender_id == incoming.sender_id && stored.content == incoming.content
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn insert_message(&self, message: &Message) -> Result<Message, MessageError> {
        let mut tx = self.pool.begin().await?;

        // None: chat missing. Some(false): sender is not a participant.
        let membership: Option<bool> = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM chat_participants WHERE chat_id = $1 AND user_id = $2) \
             FROM chats WHERE id = $1",
        )
        .bind(&message.chat_id)
        .bind(&message.sender_id)
        .fetch_optional(&mut *tx)
        .await?;
        match membership {
            None => return Err(MessageError::ChatNotFound(message.chat_id.clone())),
            Some(false) => {
                return Err(MessageError::NotParticipant {
                    chat_id: message.chat_id.clone(),
                    user_id: message.sender_id.clone(),
                });
            }
            Some(true) => {}
        }

        let sql = format!(
            "INSERT INTO messages ({MESSAGE_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (id) DO NOTHING RETURNING {MESSAGE_COLUMNS}"
        );
        let inserted = sqlx::query_as::<_, MessageTuple>(&sql)
            .bind(&message.id)
            .bind(&message.chat_id)
            .bind(&message.sender_id)
            .bind(&message.content)
            .bind(message.timestamp)
            .bind(message.read_by.iter().cloned().collect::<Vec<_>>())
            .fetch_optional(&mut *tx)
            .await?;

        let stored = if let Some(row) = inserted {
            let stored = message_from_tuple(row);
            sqlx::query(
                "UPDATE chats SET last_message_id = $1, last_message_at = $2, updated_at = now() \
                 WHERE id = $3 AND (last_message_at IS NULL OR last_message_at < $2)",
            )
            .bind(&stored.id)
            .bind(stored.timestamp)
            .bind(&stored.chat_id)
            .execute(&mut *tx)
            .await?;
            stored
        } else {
            let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1");
            let existing = message_from_tuple(
                sqlx::query_as::<_, MessageTuple>(&sql)
                    .bind(&message.id)
                    .fetch_one(&mut *tx)
                    .await?,
            );
            if !same_message(&existing, message) {
                return Err(MessageError::Conflict(message.id.clone()));
            }
            existing
        };

        tx.commit().await?;
        Ok(stored)
    }

    async fn get_message(&self, message_id: &str) -> Result<Option<Message>, MessageError> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1");
        let row = sqlx::query_as::<_, MessageTuple>(&sql)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(message_from_tuple))
    }

    async fn list_messages(&self, chat_id: &str) -> Result<Vec<Message>, MessageError> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE chat_id = $1 ORDER BY created_at ASC, id ASC");
        let rows = sqlx::query_as::<_, MessageTuple>(&sql)
            .bind(chat_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(message_from_tuple).collect())
    }

    async fn mark_read(&self, message_id: &str, user_id: &str) -> Result<Message, MessageError> {
        let sql = format!(
            "UPDATE messages SET read_by = CASE WHEN $2 = ANY(read_by) THEN read_by ELSE array_append(read_by, $2) END \
             WHERE id = $1 RETURNING {MESSAGE_COLUMNS}"
        );
        let row = sqlx::query_as::<_, MessageTuple>(&sql)
            .bind(message_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(message_from_tuple)
            .ok_or_else(|| MessageError::NotFound(message_id.to_owned()))
    }

    async fn create_chat(&self, chat: &Chat) -> Result<Chat, MessageError> {
        chat.validate()?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO chats (id, name, kind, created_at, updated_at) VALUES ($1, $2, $3, $4, $5)")
            .bind(&chat.id)
            .bind(&chat.name)
            .bind(chat.kind.as_str())
            .bind(chat.created_at)
            .bind(chat.updated_at)
            .execute(&mut *tx)
            .await?;
        for user_id in &chat.participants {
            sqlx::query("INSERT INTO chat_participants (chat_id, user_id) VALUES ($1, $2)")
                .bind(&chat.id)
                .bind(user_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        info!(chat_id = %chat.id, kind = chat.kind.as_str(), participants = chat.participants.len(), "chat created");
        Ok(chat.clone())
    }

    async fn get_chat(&self, chat_id: &str) -> Result<Option<Chat>, MessageError> {
        let sql = format!("{CHAT_SELECT} WHERE c.id = $1");
        let row = sqlx::query_as::<_, ChatTuple>(&sql)
            .bind(chat_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(chat_from_tuple).transpose()
    }

    async fn list_chats_for_user(&self, user_id: &str) -> Result<Vec<Chat>, MessageError> {
        let sql = format!(
            "{CHAT_SELECT} WHERE EXISTS (SELECT 1 FROM chat_participants me WHERE me.chat_id = c.id AND me.user_id = $1) \
             ORDER BY COALESCE(c.last_message_at, c.updated_at) DESC, c.id ASC"
        );
        let rows = sqlx::query_as::<_, ChatTuple>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(chat_from_tuple).collect()
    }

    async fn update_participants(&self, chat: &Chat) -> Result<(), MessageError> {
        chat.validate()?;
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query("UPDATE chats SET updated_at = $2 WHERE id = $1")
            .bind(&chat.id)
            .bind(chat.updated_at)
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(MessageError::ChatNotFound(chat.id.clone()));
        }
        sqlx::query("DELETE FROM chat_participants WHERE chat_id = $1")
            .bind(&chat.id)
            .execute(&mut *tx)
            .await?;
        for user_id in &chat.participants {
            sqlx::query("INSERT INTO chat_participants (chat_id, user_id) VALUES ($1, $2)")
                .bind(&chat.id)
                .bind(user_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "message_test.rs"]
mod tests;
