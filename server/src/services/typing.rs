//! Typing-presence tracking for chat rooms.
//!
//! DESIGN
//! ======
//! `TypingTracker` is a pure set store (`chat_id -> {user_id}`); it never
//! expires anything on its own. Expiry is the relay's policy: every `typing`
//! refresh pushes the entry's deadline out by `typing_timeout`, and a
//! background sweeper drops entries whose deadline has passed and tells the
//! room the user stopped typing.

use std::collections::{HashMap, HashSet};

use events::{ServerEvent, TypingPayload};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};
use uuid::Uuid;

use crate::services::room;
use crate::state::AppState;

// =============================================================================
// TRACKER
// =============================================================================

#[derive(Debug, Default)]
pub struct TypingTracker {
    chats: HashMap<String, HashSet<String>>,
}

impl TypingTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `user_id` as typing in `chat_id`. Returns `true` if newly added.
    pub fn add(&mut self, chat_id: &str, user_id: &str) -> bool {
        self.chats
            .entry(chat_id.to_owned())
            .or_default()
            .insert(user_id.to_owned())
    }

    /// Returns `true` if the entry existed.
    pub fn remove(&mut self, chat_id: &str, user_id: &str) -> bool {
        let Some(users) = self.chats.get_mut(chat_id) else {
            return false;
        };
        let removed = users.remove(user_id);
        if users.is_empty() {
            self.chats.remove(chat_id);
        }
        removed
    }

    /// Users typing in `chat_id` other than `excluding`, sorted.
    #[must_use]
    pub fn get(&self, chat_id: &str, excluding: &str) -> Vec<String> {
        let Some(users) = self.chats.get(chat_id) else {
            return Vec::new();
        };
        let mut out = users
            .iter()
            .filter(|u| u.as_str() != excluding)
            .cloned()
            .collect::<Vec<_>>();
        out.sort();
        out
    }

    /// Drop `user_id` from every chat. Returns the chats it was typing in.
    pub fn remove_user(&mut self, user_id: &str) -> Vec<String> {
        let mut chats = Vec::new();
        self.chats.retain(|chat_id, users| {
            if users.remove(user_id) {
                chats.push(chat_id.clone());
            }
            !users.is_empty()
        });
        chats.sort();
        chats
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chats.is_empty()
    }
}

// =============================================================================
// RELAY OPERATIONS
// =============================================================================

/// Record a typing refresh and tell the rest of the room.
pub async fn start_typing(state: &AppState, connection_id: Uuid, payload: &TypingPayload) {
    let deadline = Instant::now() + state.config.typing_timeout;
    let mut relay = state.relay.write().await;
    if relay.typing.add(&payload.chat_id, &payload.user_id) {
        debug!(chat_id = %payload.chat_id, user_id = %payload.user_id, "typing started");
    }
    relay.typing_deadlines.insert(payload.clone(), deadline);
    room::fanout(&relay, &payload.chat_id, &ServerEvent::UserTyping(payload.clone()), Some(connection_id));
}

/// Clear a typing entry and tell the rest of the room.
pub async fn stop_typing(state: &AppState, connection_id: Uuid, payload: &TypingPayload) {
    let mut relay = state.relay.write().await;
    relay.typing.remove(&payload.chat_id, &payload.user_id);
    relay.typing_deadlines.remove(payload);
    room::fanout(
        &relay,
        &payload.chat_id,
        &ServerEvent::UserStopTyping(payload.clone()),
        Some(connection_id),
    );
}

/// Users currently typing in `chat_id`, excluding the caller. Entries past
/// their deadline are hidden even if the sweeper has not dropped them yet.
pub async fn typing_users(state: &AppState, chat_id: &str, excluding: &str) -> Vec<String> {
    let now = Instant::now();
    let relay = state.relay.read().await;
    relay
        .typing
        .get(chat_id, excluding)
        .into_iter()
        .filter(|user_id| {
            let entry = TypingPayload { chat_id: chat_id.to_owned(), user_id: user_id.clone() };
            relay.typing_deadlines.get(&entry).is_some_and(|deadline| *deadline > now)
        })
        .collect()
}

/// Drop typing entries whose deadline has passed. Returns how many expired.
pub async fn sweep_expired(state: &AppState) -> usize {
    let now = Instant::now();
    let mut relay = state.relay.write().await;

    let expired = relay
        .typing_deadlines
        .iter()
        .filter(|(_, deadline)| **deadline <= now)
        .map(|(entry, _)| entry.clone())
        .collect::<Vec<_>>();

    for entry in &expired {
        relay.typing_deadlines.remove(entry);
        relay.typing.remove(&entry.chat_id, &entry.user_id);
        room::fanout(&relay, &entry.chat_id, &ServerEvent::UserStopTyping(entry.clone()), None);
    }

    if !expired.is_empty() {
        debug!(count = expired.len(), "expired idle typing entries");
    }
    expired.len()
}

/// Spawn the background typing sweeper. Returns a handle for shutdown.
pub fn spawn_typing_sweeper(state: AppState) -> JoinHandle<()> {
    let interval = state.config.typing_sweep_interval;
    info!(
        interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
        timeout_ms = u64::try_from(state.config.typing_timeout.as_millis()).unwrap_or(u64::MAX),
        "typing sweeper configured"
    );
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            sweep_expired(&state).await;
        }
    })
}

#[cfg(test)]
#[path = "typing_test.rs"]
mod tests;
