use super::*;
use std::sync::Mutex;

use async_trait::async_trait;
use events::{Chat, ChatKind, ChangeEvent, Message, MessageRow};
use tokio::time::{Duration, timeout};

use crate::services::message::MessageError;
use crate::services::room;

// =============================================================================
// IN-MEMORY STORE
// =============================================================================

#[derive(Default)]
struct MemoryInner {
    chats: HashMap<String, Chat>,
    messages: Vec<Message>,
}

/// In-memory [`MessageStore`] with the same semantics as the Postgres store.
/// With a feed hub attached, inserts are published like the `NOTIFY` trigger.
#[derive(Default)]
pub struct MemoryMessageStore {
    inner: Mutex<MemoryInner>,
    feed: Option<ChangeFeedHub>,
}

impl MemoryMessageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_feed(feed: ChangeFeedHub) -> Self {
        Self { inner: Mutex::default(), feed: Some(feed) }
    }

    pub fn message_count(&self) -> usize {
        self.inner.lock().expect("store mutex should lock").messages.len()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn insert_message(&self, message: &Message) -> Result<Message, MessageError> {
        let stored = {
            let mut inner = self.inner.lock().expect("store mutex should lock");
            let Some(chat) = inner.chats.get(&message.chat_id) else {
                return Err(MessageError::ChatNotFound(message.chat_id.clone()));
            };
            if !chat.participants.contains(&message.sender_id) {
                return Err(MessageError::NotParticipant {
                    chat_id: message.chat_id.clone(),
                    user_id: message.sender_id.clone(),
                });
            }
            if let Some(existing) = inner.messages.iter().find(|m| m.id == message.id) {
                if existing.content != message.content || existing.chat_id != message.chat_id {
                    return Err(MessageError::Conflict(message.id.clone()));
                }
                return Ok(existing.clone());
            }
            let stored = Message { origin: None, sequence: None, unconfirmed: false, ..message.clone() };
            inner.messages.push(stored.clone());
            if let Some(chat) = inner.chats.get_mut(&stored.chat_id) {
                chat.record_message(&stored.id, stored.timestamp);
            }
            stored
        };
        if let Some(feed) = &self.feed {
            feed.publish(&ChangeEvent::insert(MessageRow::from(&stored))).await;
        }
        Ok(stored)
    }

    async fn get_message(&self, message_id: &str) -> Result<Option<Message>, MessageError> {
        let inner = self.inner.lock().expect("store mutex should lock");
        Ok(inner.messages.iter().find(|m| m.id == message_id).cloned())
    }

    async fn list_messages(&self, chat_id: &str) -> Result<Vec<Message>, MessageError> {
        let inner = self.inner.lock().expect("store mutex should lock");
        let mut out = inner
            .messages
            .iter()
            .filter(|m| m.chat_id == chat_id)
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn mark_read(&self, message_id: &str, user_id: &str) -> Result<Message, MessageError> {
        let mut inner = self.inner.lock().expect("store mutex should lock");
        let Some(message) = inner.messages.iter_mut().find(|m| m.id == message_id) else {
            return Err(MessageError::NotFound(message_id.to_owned()));
        };
        message.read_by.insert(user_id.to_owned());
        Ok(message.clone())
    }

    async fn create_chat(&self, chat: &Chat) -> Result<Chat, MessageError> {
        chat.validate()?;
        let mut inner = self.inner.lock().expect("store mutex should lock");
        inner.chats.insert(chat.id.clone(), chat.clone());
        Ok(chat.clone())
    }

    async fn get_chat(&self, chat_id: &str) -> Result<Option<Chat>, MessageError> {
        let inner = self.inner.lock().expect("store mutex should lock");
        Ok(inner.chats.get(chat_id).cloned())
    }

    async fn list_chats_for_user(&self, user_id: &str) -> Result<Vec<Chat>, MessageError> {
        let inner = self.inner.lock().expect("store mutex should lock");
        Ok(inner
            .chats
            .values()
            .filter(|c| c.participants.contains(user_id))
            .cloned()
            .collect())
    }

    async fn update_participants(&self, chat: &Chat) -> Result<(), MessageError> {
        chat.validate()?;
        let mut inner = self.inner.lock().expect("store mutex should lock");
        let Some(stored) = inner.chats.get_mut(&chat.id) else {
            return Err(MessageError::ChatNotFound(chat.id.clone()));
        };
        stored.participants = chat.participants.clone();
        stored.updated_at = chat.updated_at;
        Ok(())
    }
}

/// Store whose every operation fails with a database error.
pub struct FailingStore;

fn unavailable() -> MessageError {
    MessageError::Database(sqlx::Error::PoolTimedOut)
}

#[async_trait]
impl MessageStore for FailingStore {
    async fn insert_message(&self, _message: &Message) -> Result<Message, MessageError> {
        Err(unavailable())
    }
    async fn get_message(&self, _message_id: &str) -> Result<Option<Message>, MessageError> {
        Err(unavailable())
    }
    async fn list_messages(&self, _chat_id: &str) -> Result<Vec<Message>, MessageError> {
        Err(unavailable())
    }
    async fn mark_read(&self, _message_id: &str, _user_id: &str) -> Result<Message, MessageError> {
        Err(unavailable())
    }
    async fn create_chat(&self, _chat: &Chat) -> Result<Chat, MessageError> {
        Err(unavailable())
    }
    async fn get_chat(&self, _chat_id: &str) -> Result<Option<Chat>, MessageError> {
        Err(unavailable())
    }
    async fn list_chats_for_user(&self, _user_id: &str) -> Result<Vec<Chat>, MessageError> {
        Err(unavailable())
    }
    async fn update_participants(&self, _chat: &Chat) -> Result<(), MessageError> {
        Err(unavailable())
    }
}

// =============================================================================
// STATE
// =============================================================================

/// App state over an in-memory store wired to the state's own feed hub.
#[must_use]
pub fn test_app_state() -> AppState {
    let feed = ChangeFeedHub::new();
    let store = Arc::new(MemoryMessageStore::with_feed(feed.clone()));
    AppState { feed, ..AppState::new(store, RelayConfig::default()) }
}

#[must_use]
pub fn test_app_state_with_store(store: Arc<dyn MessageStore>) -> AppState {
    AppState::new(store, RelayConfig::default())
}

/// Register a fake connection and return its id and outbound queue.
pub async fn register(state: &AppState) -> (Uuid, mpsc::Receiver<ServerEvent>) {
    let (tx, rx) = mpsc::channel(64);
    let id = Uuid::new_v4();
    room::register_connection(state, id, tx).await;
    (id, rx)
}

/// Register a connection and join it to `chat_id`.
pub async fn register_in_room(state: &AppState, chat_id: &str) -> (Uuid, mpsc::Receiver<ServerEvent>) {
    let (id, rx) = register(state).await;
    room::join_room(state, id, chat_id).await;
    (id, rx)
}

/// Persist a group chat with the given participants.
pub async fn seed_chat(state: &AppState, participants: &[&str]) -> Chat {
    let kind = if participants.len() == 2 { ChatKind::Direct } else { ChatKind::Group };
    let chat = Chat::new("test chat", kind, participants.iter().map(|p| (*p).to_owned()))
        .expect("seed chat should be valid");
    state.store.create_chat(&chat).await.expect("seed chat should persist")
}

pub async fn recv_event(rx: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
    timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("event receive timed out")
        .expect("event channel closed unexpectedly")
}

pub async fn assert_no_event(rx: &mut mpsc::Receiver<ServerEvent>) {
    assert!(
        timeout(Duration::from_millis(80), rx.recv()).await.is_err(),
        "expected no event"
    );
}
