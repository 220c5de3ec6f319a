//! Chat session controller.
//!
//! DESIGN
//! ======
//! `ChatSession` binds the three network seams to one [`ChatStore`] for a
//! single user. At most one chat is open at a time; opening a chat wires its
//! change-feed subscription and relay room, loads history and marks it read.
//! Inbound traffic is pulled with [`ChatSession::process_next`], which waits
//! on the relay stream, the open chat's change-feed and the typing timers,
//! applies whatever arrives first and reports it.
//!
//! Lifecycle of the open chat:
//!
//! ```text
//! Closed -> Opening -> Open -> Closing -> Closed
//! ```
//!
//! ERROR HANDLING
//! ==============
//! Nothing here returns an error. Network failures are logged with
//! `tracing::warn!` and degrade: a failed subscribe or join leaves the chat
//! usable through manual reload, a failed send keeps the local copy flagged
//! unconfirmed.

use std::sync::Arc;

use events::{
    Chat, ChatKind, ChatRef, ClientEvent, ErrorPayload, Message, MessageRow, Origin, SendFailure, ServerEvent,
    TypingPayload, UserRef,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::net::{ChangeFeed, MessageLog, NewChat, RelayLink};
use crate::store::{ChatStore, MergeOutcome};
use crate::subscription::Subscription;
use crate::typing::TypingPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Opening,
    Open,
    Closing,
}

/// Result of [`ChatSession::send_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The relay persisted the message.
    Confirmed(Message),
    /// Persistence failed or the relay is unreachable. The local copy stays
    /// in the store flagged `unconfirmed`.
    Unconfirmed(Message),
    /// Blank content; nothing was sent.
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Relay,
    ChangeFeed,
}

/// What [`ChatSession::process_next`] applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Message { chat_id: String, message_id: String, outcome: MergeOutcome },
    Typing { chat_id: String, user_id: String, typing: bool },
    Presence { user_id: String, online: bool },
    SendFailed(SendFailure),
    RelayError(ErrorPayload),
    /// Timer expiries: own chats that went idle and remote typers that timed out.
    Timers { stopped: Vec<String>, expired: Vec<TypingPayload> },
    ChannelClosed(Channel),
    /// Nothing to wait on.
    Idle,
}

pub struct ChatSession {
    user_id: String,
    log: Arc<dyn MessageLog>,
    relay: Arc<dyn RelayLink>,
    feed: Arc<dyn ChangeFeed>,
    store: ChatStore,
    typing: TypingPolicy,
    state: SessionState,
    relay_events: Option<Subscription<ServerEvent>>,
    feed_subscription: Option<(String, Subscription<MessageRow>)>,
}

impl ChatSession {
    pub fn new(
        user_id: impl Into<String>,
        log: Arc<dyn MessageLog>,
        relay: Arc<dyn RelayLink>,
        feed: Arc<dyn ChangeFeed>,
    ) -> Self {
        let user_id = user_id.into();
        Self {
            store: ChatStore::new(user_id.clone()),
            user_id,
            log,
            relay,
            feed,
            typing: TypingPolicy::new(),
            state: SessionState::Closed,
            relay_events: None,
            feed_subscription: None,
        }
    }

    /// Register the relay listener (once per session) and announce presence.
    pub async fn connect(&mut self) {
        if self.relay_events.is_none() {
            self.relay_events = Some(self.relay.subscribe());
            debug!(user_id = %self.user_id, "session: relay listener registered");
        }
        self.store.set_online(&self.user_id, true);
        self.emit(ClientEvent::UserOnline(UserRef { user_id: self.user_id.clone() }))
            .await;
    }

    // =========================================================================
    // OPEN / CLOSE
    // =========================================================================

    pub async fn open_chat(&mut self, chat_id: &str) {
        if self.store.active_chat() == Some(chat_id) && self.state == SessionState::Open {
            self.force_reload().await;
            return;
        }
        if self.store.active_chat().is_some() {
            self.close_chat().await;
        }
        if self.relay_events.is_none() {
            self.connect().await;
        }

        self.state = SessionState::Opening;
        self.store.set_active_chat(Some(chat_id.to_owned()));
        self.store.zero_unread(chat_id);

        match self.feed.subscribe_inserts(chat_id).await {
            Ok(subscription) => self.feed_subscription = Some((chat_id.to_owned(), subscription)),
            Err(error) => warn!(%chat_id, %error, "session: change-feed subscribe failed"),
        }
        self.emit(ClientEvent::JoinChat(ChatRef { chat_id: chat_id.to_owned() }))
            .await;

        self.load_messages(chat_id).await;
        self.mark_as_read(chat_id).await;
        self.state = SessionState::Open;
        info!(%chat_id, user_id = %self.user_id, "session: chat open");
    }

    pub async fn close_chat(&mut self) {
        let Some(chat_id) = self.store.active_chat().map(ToOwned::to_owned) else {
            return;
        };
        self.state = SessionState::Closing;

        if self.typing.stop(&chat_id) {
            self.emit(ClientEvent::StopTyping(self.typing_payload(&chat_id)))
                .await;
        }
        if let Some((_, subscription)) = self.feed_subscription.take() {
            subscription.cancel();
        }
        self.emit(ClientEvent::LeaveChat(ChatRef { chat_id: chat_id.clone() }))
            .await;

        self.store.set_active_chat(None);
        self.state = SessionState::Closed;
        info!(%chat_id, user_id = %self.user_id, "session: chat closed");
    }

    // =========================================================================
    // MESSAGES
    // =========================================================================

    /// Optimistically insert, stop typing, then publish through the relay.
    pub async fn send_message(&mut self, chat_id: &str, content: &str) -> SendOutcome {
        match self.begin_send(chat_id, content).await {
            Some(pending) => self.finish_send(pending).await,
            None => SendOutcome::Empty,
        }
    }

    /// First half of [`send_message`](Self::send_message): insert the local
    /// copy flagged `unconfirmed` and emit `stop_typing`. Returns the wire
    /// message to hand to [`finish_send`](Self::finish_send), or `None` for
    /// blank content.
    pub async fn begin_send(&mut self, chat_id: &str, content: &str) -> Option<Message> {
        if content.trim().is_empty() {
            return None;
        }

        let mut local = Message::new(chat_id, &self.user_id, content).with_origin(Origin::Local);
        local.unconfirmed = true;
        let wire = Message { origin: None, unconfirmed: false, ..local.clone() };
        self.store.add_or_update_message(local);

        self.typing.stop(chat_id);
        self.emit(ClientEvent::StopTyping(self.typing_payload(chat_id)))
            .await;
        Some(wire)
    }

    /// Publish a message staged by [`begin_send`](Self::begin_send) and
    /// settle the local copy with the relay's answer.
    pub async fn finish_send(&mut self, wire: Message) -> SendOutcome {
        let chat_id = wire.chat_id.clone();
        match self.relay.publish(wire.clone()).await {
            Ok(stored) => {
                self.store.add_or_update_message(stored.with_origin(Origin::Relay));
                let confirmed = self.store.message(&chat_id, &wire.id).cloned().unwrap_or(wire);
                SendOutcome::Confirmed(confirmed)
            }
            Err(error) => {
                warn!(%chat_id, message_id = %wire.id, %error, "session: send failed, message left unconfirmed");
                let local = self.store.message(&chat_id, &wire.id).cloned().unwrap_or(wire);
                SendOutcome::Unconfirmed(local)
            }
        }
    }

    /// Reload a chat's history from the message log. Returns whether the
    /// result was applied; loads for a chat that is no longer open are
    /// discarded.
    pub async fn load_messages(&mut self, chat_id: &str) -> bool {
        match self.log.load_messages(chat_id).await {
            Ok(messages) => {
                let applied = self.store.replace_messages_if_active(chat_id, messages);
                if !applied {
                    debug!(%chat_id, "session: discarded stale load");
                }
                applied
            }
            Err(error) => {
                warn!(%chat_id, %error, "session: load messages failed");
                false
            }
        }
    }

    /// Manual recovery: reload and re-mark the open chat.
    pub async fn force_reload(&mut self) -> bool {
        let Some(chat_id) = self.store.active_chat().map(ToOwned::to_owned) else {
            return false;
        };
        let applied = self.load_messages(&chat_id).await;
        self.mark_as_read(&chat_id).await;
        applied
    }

    /// Mark every message the user has not read. Returns how many were
    /// marked; failures are logged and picked up by the next call.
    pub async fn mark_as_read(&mut self, chat_id: &str) -> usize {
        let mut marked = Vec::new();
        for message_id in self.store.unread_ids(chat_id) {
            match self.log.mark_read(&message_id, &self.user_id).await {
                Ok(_) => marked.push(message_id),
                Err(error) => warn!(%chat_id, %message_id, %error, "session: mark read failed"),
            }
        }
        let count = self.store.mark_read_locally(chat_id, &marked);
        self.store.zero_unread(chat_id);
        count
    }

    // =========================================================================
    // TYPING
    // =========================================================================

    pub async fn set_typing(&mut self, chat_id: &str, is_typing: bool) {
        if is_typing {
            if self.typing.keystroke(chat_id, Instant::now()) {
                self.emit(ClientEvent::Typing(self.typing_payload(chat_id)))
                    .await;
            }
        } else if self.typing.stop(chat_id) {
            self.emit(ClientEvent::StopTyping(self.typing_payload(chat_id)))
                .await;
        }
    }

    // =========================================================================
    // CHATS
    // =========================================================================

    /// Refresh the chat list from the message log.
    pub async fn list_chats(&mut self) -> Vec<Chat> {
        match self.log.list_chats(&self.user_id).await {
            Ok(chats) => self.store.set_chats(chats),
            Err(error) => warn!(user_id = %self.user_id, %error, "session: list chats failed"),
        }
        self.store.chats().into_iter().cloned().collect()
    }

    pub async fn create_chat(&mut self, name: &str, kind: ChatKind, participants: Vec<String>) -> Option<Chat> {
        let request = NewChat { creator_id: self.user_id.clone(), name: name.to_owned(), kind, participants };
        match self.log.create_chat(&request).await {
            Ok(chat) => {
                self.store.upsert_chat(chat.clone());
                Some(chat)
            }
            Err(error) => {
                warn!(%name, %error, "session: create chat failed");
                None
            }
        }
    }

    // =========================================================================
    // INBOUND
    // =========================================================================

    /// Wait for the next relay event, change-feed row or typing timer and
    /// apply it to the store.
    pub async fn process_next(&mut self) -> Applied {
        let deadline = match (self.typing.next_deadline(), self.store.next_typing_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        if self.relay_events.is_none() && self.feed_subscription.is_none() && deadline.is_none() {
            return Applied::Idle;
        }

        tokio::select! {
            event = next_or_pending(self.relay_events.as_mut()) => match event {
                Some(event) => self.apply_server_event(event),
                None => {
                    self.relay_events = None;
                    warn!("session: relay stream closed");
                    Applied::ChannelClosed(Channel::Relay)
                }
            },
            row = next_or_pending(self.feed_subscription.as_mut().map(|(_, sub)| sub)) => match row {
                Some(row) => self.merge(Message::from(row)),
                None => {
                    self.feed_subscription = None;
                    warn!("session: change-feed closed, manual reload only");
                    Applied::ChannelClosed(Channel::ChangeFeed)
                }
            },
            () = sleep_until_or_pending(deadline) => self.apply_timers(Instant::now()).await,
        }
    }

    fn apply_server_event(&mut self, event: ServerEvent) -> Applied {
        match event {
            ServerEvent::NewMessage(message) | ServerEvent::MessageAck(message) => {
                self.merge(message.with_origin(Origin::Relay))
            }
            ServerEvent::MessageFailed(failure) => {
                warn!(chat_id = %failure.chat_id, message_id = %failure.id, error = %failure.error, "session: relay rejected message");
                Applied::SendFailed(failure)
            }
            ServerEvent::UserTyping(payload) => {
                self.store.set_typing(&payload.chat_id, &payload.user_id, Instant::now());
                Applied::Typing { chat_id: payload.chat_id, user_id: payload.user_id, typing: true }
            }
            ServerEvent::UserStopTyping(payload) => {
                self.store.clear_typing(&payload.chat_id, &payload.user_id);
                Applied::Typing { chat_id: payload.chat_id, user_id: payload.user_id, typing: false }
            }
            ServerEvent::UserStatusChange(change) => {
                let online = change.status == events::PresenceStatus::Online;
                self.store.set_online(&change.user_id, online);
                Applied::Presence { user_id: change.user_id, online }
            }
            ServerEvent::Error(payload) => {
                warn!(code = %payload.code, message = %payload.message, "session: relay error");
                Applied::RelayError(payload)
            }
        }
    }

    fn merge(&mut self, message: Message) -> Applied {
        let chat_id = message.chat_id.clone();
        let message_id = message.id.clone();
        let outcome = self.store.add_or_update_message(message);
        Applied::Message { chat_id, message_id, outcome }
    }

    async fn apply_timers(&mut self, now: Instant) -> Applied {
        let stopped = self.typing.expired(now);
        for chat_id in &stopped {
            self.emit(ClientEvent::StopTyping(self.typing_payload(chat_id)))
                .await;
        }
        let expired = self.store.expire_typing(now);
        Applied::Timers { stopped, expired }
    }

    // =========================================================================
    // OBSERVERS
    // =========================================================================

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub fn active_chat(&self) -> Option<&str> {
        self.store.active_chat()
    }

    #[must_use]
    pub fn chats(&self) -> Vec<&Chat> {
        self.store.chats()
    }

    #[must_use]
    pub fn messages(&self, chat_id: &str) -> &[Message] {
        self.store.messages(chat_id)
    }

    #[must_use]
    pub fn unread_count(&self, chat_id: &str) -> usize {
        self.store.unread_count(chat_id)
    }

    #[must_use]
    pub fn typing_users(&self, chat_id: &str) -> Vec<String> {
        self.store.typing_users(chat_id)
    }

    #[must_use]
    pub fn is_online(&self, user_id: &str) -> bool {
        self.store.is_online(user_id)
    }

    #[must_use]
    pub fn store(&self) -> &ChatStore {
        &self.store
    }

    // =========================================================================
    // HELPERS
    // =========================================================================

    fn typing_payload(&self, chat_id: &str) -> TypingPayload {
        TypingPayload { chat_id: chat_id.to_owned(), user_id: self.user_id.clone() }
    }

    async fn emit(&self, event: ClientEvent) {
        let name = event.name();
        if let Err(error) = self.relay.emit(event).await {
            warn!(event = name, %error, "session: relay emit failed");
        }
    }
}

async fn next_or_pending<T>(subscription: Option<&mut Subscription<T>>) -> Option<T> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_or_pending(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
