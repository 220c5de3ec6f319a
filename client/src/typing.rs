//! Outgoing typing indicator policy.
//!
//! Keystrokes emit `typing` at most once per [`TYPING_RATE_LIMIT`] per chat
//! and push back an idle deadline of [`TYPING_IDLE_TIMEOUT`]. When the
//! deadline passes the caller emits `stop_typing`. Sending, blurring or
//! closing the chat calls [`TypingPolicy::stop`] which forgets both.
//!
//! The policy only decides; the session controller owns the relay link and
//! drives `expired` from its event loop.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

pub const TYPING_RATE_LIMIT: Duration = Duration::from_millis(2000);
pub const TYPING_IDLE_TIMEOUT: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone, Copy)]
struct ChatTyping {
    last_emit: Instant,
    deadline: Instant,
}

#[derive(Debug, Default)]
pub struct TypingPolicy {
    chats: HashMap<String, ChatTyping>,
}

impl TypingPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a keystroke. Returns true when a `typing` event should be sent.
    pub fn keystroke(&mut self, chat_id: &str, now: Instant) -> bool {
        let deadline = now + TYPING_IDLE_TIMEOUT;
        match self.chats.get_mut(chat_id) {
            Some(entry) => {
                entry.deadline = deadline;
                if now.duration_since(entry.last_emit) > TYPING_RATE_LIMIT {
                    entry.last_emit = now;
                    return true;
                }
                false
            }
            None => {
                self.chats.insert(chat_id.to_owned(), ChatTyping { last_emit: now, deadline });
                true
            }
        }
    }

    /// Forget typing state for `chat_id`. Returns true when the chat was
    /// marked typing, meaning a `stop_typing` event should be sent.
    pub fn stop(&mut self, chat_id: &str) -> bool {
        self.chats.remove(chat_id).is_some()
    }

    #[must_use]
    pub fn is_typing(&self, chat_id: &str) -> bool {
        self.chats.contains_key(chat_id)
    }

    /// Remove and return chats whose idle deadline has passed.
    pub fn expired(&mut self, now: Instant) -> Vec<String> {
        let mut expired = self
            .chats
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(chat_id, _)| chat_id.clone())
            .collect::<Vec<_>>();
        for chat_id in &expired {
            self.chats.remove(chat_id);
        }
        expired.sort();
        expired
    }

    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.chats.values().map(|entry| entry.deadline).min()
    }
}

#[cfg(test)]
#[path = "typing_test.rs"]
mod tests;
