//! Client reconciliation store.
//!
//! DESIGN
//! ======
//! The store is the client's single view of chats, messages, unread counts,
//! remote typing and presence. Messages arrive from two independent
//! channels (relay push and change-feed push) with no ordering between them,
//! so the same logical message may show up twice in either order.
//! `add_or_update_message` makes that harmless: `id` is the only dedup key,
//! duplicates only grow `readBy`, and every list is kept in a deterministic
//! order of (`timestamp`, `sequence`, `id`).
//!
//! The store does no I/O. The session controller feeds it and reads it.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use events::{Chat, Message, Origin, TypingPayload};
use tokio::time::Instant;

/// Remote typing entries without a refresh for this long are dropped.
pub const REMOTE_TYPING_TIMEOUT: Duration = Duration::from_millis(3000);

/// Result of merging one message into the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// First copy of this message id.
    Inserted,
    /// Known id; `readBy` grew or a local echo was confirmed.
    Merged,
    /// Known id; nothing changed.
    Unchanged,
}

#[derive(Debug)]
pub struct ChatStore {
    current_user: String,
    chats: HashMap<String, Chat>,
    messages: HashMap<String, Vec<Message>>,
    unread: HashMap<String, usize>,
    /// chat id -> user id -> expiry.
    typing: HashMap<String, HashMap<String, Instant>>,
    online: HashSet<String>,
    active_chat: Option<String>,
    next_sequence: u64,
}

impl ChatStore {
    #[must_use]
    pub fn new(current_user: impl Into<String>) -> Self {
        Self {
            current_user: current_user.into(),
            chats: HashMap::new(),
            messages: HashMap::new(),
            unread: HashMap::new(),
            typing: HashMap::new(),
            online: HashSet::new(),
            active_chat: None,
            next_sequence: 0,
        }
    }

    #[must_use]
    pub fn current_user(&self) -> &str {
        &self.current_user
    }

    // =========================================================================
    // ACTIVE CHAT
    // =========================================================================

    pub fn set_active_chat(&mut self, chat_id: Option<String>) {
        self.active_chat = chat_id;
    }

    #[must_use]
    pub fn active_chat(&self) -> Option<&str> {
        self.active_chat.as_deref()
    }

    #[must_use]
    pub fn is_active(&self, chat_id: &str) -> bool {
        self.active_chat.as_deref() == Some(chat_id)
    }

    // =========================================================================
    // CHATS
    // =========================================================================

    /// Insert or replace chat metadata, keeping the newer last-message pointer.
    pub fn upsert_chat(&mut self, mut chat: Chat) {
        if let Some(last) = self.chats.get(&chat.id).and_then(|c| c.last_message.clone()) {
            chat.record_message(&last.id, last.timestamp);
        }
        self.chats.insert(chat.id.clone(), chat);
    }

    /// Replace the chat list wholesale.
    pub fn set_chats(&mut self, chats: Vec<Chat>) {
        let previous = std::mem::take(&mut self.chats);
        for mut chat in chats {
            if let Some(last) = previous.get(&chat.id).and_then(|c| c.last_message.clone()) {
                chat.record_message(&last.id, last.timestamp);
            }
            self.chats.insert(chat.id.clone(), chat);
        }
    }

    #[must_use]
    pub fn chat(&self, chat_id: &str) -> Option<&Chat> {
        self.chats.get(chat_id)
    }

    /// Chats ordered by most recent activity first.
    #[must_use]
    pub fn chats(&self) -> Vec<&Chat> {
        let mut chats = self.chats.values().collect::<Vec<_>>();
        chats.sort_by(|a, b| b.last_activity().cmp(&a.last_activity()).then_with(|| a.id.cmp(&b.id)));
        chats
    }

    // =========================================================================
    // MESSAGES
    // =========================================================================

    /// Merge one message from any channel.
    ///
    /// A known id only unions `readBy`; the first-seen timestamp and
    /// sequence stay, except that an unconfirmed local echo adopts the
    /// confirmed copy's timestamp. A new id is appended with a fresh
    /// sequence, the list is re-sorted, the chat's last-message pointer is
    /// advanced, and the unread count grows for other senders' messages when
    /// the chat is not open.
    pub fn add_or_update_message(&mut self, mut message: Message) -> MergeOutcome {
        let chat_id = message.chat_id.clone();
        let list = self.messages.entry(chat_id.clone()).or_default();

        if let Some(existing) = list.iter_mut().find(|m| m.id == message.id) {
            let mut changed = false;
            for reader in message.read_by {
                changed |= existing.read_by.insert(reader);
            }
            let confirms = existing.unconfirmed && !message.unconfirmed && message.origin != Some(Origin::Local);
            if confirms {
                existing.timestamp = message.timestamp;
                existing.unconfirmed = false;
                existing.origin = message.origin;
                let (id, timestamp) = (existing.id.clone(), existing.timestamp);
                sort_messages(list);
                if let Some(chat) = self.chats.get_mut(&chat_id) {
                    chat.record_message(&id, timestamp);
                }
                return MergeOutcome::Merged;
            }
            return if changed { MergeOutcome::Merged } else { MergeOutcome::Unchanged };
        }

        message.sequence = Some(self.next_sequence);
        self.next_sequence += 1;
        let from_other = message.sender_id != self.current_user;
        let (id, timestamp) = (message.id.clone(), message.timestamp);
        list.push(message);
        sort_messages(list);

        if let Some(chat) = self.chats.get_mut(&chat_id) {
            chat.record_message(&id, timestamp);
        }
        if from_other && !self.is_active(&chat_id) {
            *self.unread.entry(chat_id).or_default() += 1;
        }
        MergeOutcome::Inserted
    }

    /// Replace a chat's list with a fresh load from the message log.
    ///
    /// Unconfirmed local messages the log has not returned yet are kept.
    /// Messages already known keep their first-seen sequence. When the chat
    /// is not open its unread count is recomputed from `readBy`.
    pub fn replace_messages(&mut self, chat_id: &str, messages: Vec<Message>) {
        let previous = self.messages.remove(chat_id).unwrap_or_default();
        let mut known = previous
            .iter()
            .map(|m| (m.id.clone(), m))
            .collect::<HashMap<_, _>>();

        let mut list = Vec::with_capacity(messages.len());
        for mut message in messages.into_iter().filter(|m| m.chat_id == chat_id) {
            match known.remove(&message.id) {
                Some(prior) => {
                    message.sequence = prior.sequence;
                    message.read_by.extend(prior.read_by.iter().cloned());
                }
                None => {
                    message.sequence = Some(self.next_sequence);
                    self.next_sequence += 1;
                }
            }
            message.unconfirmed = false;
            list.push(message);
        }
        list.extend(
            previous
                .iter()
                .filter(|m| m.unconfirmed && known.contains_key(&m.id))
                .cloned(),
        );
        sort_messages(&mut list);

        if let (Some(chat), Some(last)) = (self.chats.get_mut(chat_id), list.last()) {
            chat.record_message(&last.id, last.timestamp);
        }
        if !self.is_active(chat_id) {
            let unread = list
                .iter()
                .filter(|m| m.sender_id != self.current_user && !m.is_read_by(&self.current_user))
                .count();
            self.unread.insert(chat_id.to_owned(), unread);
        }
        self.messages.insert(chat_id.to_owned(), list);
    }

    /// [`replace_messages`](Self::replace_messages) only if `chat_id` is
    /// still the active chat. Returns whether the load was applied.
    pub fn replace_messages_if_active(&mut self, chat_id: &str, messages: Vec<Message>) -> bool {
        if !self.is_active(chat_id) {
            return false;
        }
        self.replace_messages(chat_id, messages);
        true
    }

    #[must_use]
    pub fn messages(&self, chat_id: &str) -> &[Message] {
        self.messages.get(chat_id).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn message(&self, chat_id: &str, message_id: &str) -> Option<&Message> {
        self.messages(chat_id).iter().find(|m| m.id == message_id)
    }

    /// Confirmed messages the current user has not read.
    #[must_use]
    pub fn unread_ids(&self, chat_id: &str) -> Vec<String> {
        self.messages(chat_id)
            .iter()
            .filter(|m| !m.unconfirmed && !m.is_read_by(&self.current_user))
            .map(|m| m.id.clone())
            .collect()
    }

    /// Add the current user to `readBy` of the given messages.
    pub fn mark_read_locally(&mut self, chat_id: &str, message_ids: &[String]) -> usize {
        let Some(list) = self.messages.get_mut(chat_id) else {
            return 0;
        };
        list.iter_mut()
            .filter(|m| message_ids.contains(&m.id))
            .map(|m| m.read_by.insert(self.current_user.clone()))
            .filter(|inserted| *inserted)
            .count()
    }

    // =========================================================================
    // UNREAD
    // =========================================================================

    #[must_use]
    pub fn unread_count(&self, chat_id: &str) -> usize {
        self.unread.get(chat_id).copied().unwrap_or(0)
    }

    pub fn zero_unread(&mut self, chat_id: &str) {
        self.unread.insert(chat_id.to_owned(), 0);
    }

    // =========================================================================
    // TYPING MIRROR
    // =========================================================================

    /// Record a remote typing refresh. The current user is never mirrored.
    pub fn set_typing(&mut self, chat_id: &str, user_id: &str, now: Instant) -> bool {
        if user_id == self.current_user {
            return false;
        }
        self.typing
            .entry(chat_id.to_owned())
            .or_default()
            .insert(user_id.to_owned(), now + REMOTE_TYPING_TIMEOUT)
            .is_none()
    }

    pub fn clear_typing(&mut self, chat_id: &str, user_id: &str) -> bool {
        let Some(users) = self.typing.get_mut(chat_id) else {
            return false;
        };
        let removed = users.remove(user_id).is_some();
        if users.is_empty() {
            self.typing.remove(chat_id);
        }
        removed
    }

    /// Users typing in `chat_id` whose entry has not expired, sorted.
    #[must_use]
    pub fn typing_users(&self, chat_id: &str) -> Vec<String> {
        let now = Instant::now();
        let Some(users) = self.typing.get(chat_id) else {
            return Vec::new();
        };
        let mut out = users
            .iter()
            .filter(|(_, deadline)| **deadline > now)
            .map(|(user, _)| user.clone())
            .collect::<Vec<_>>();
        out.sort();
        out
    }

    /// Drop expired typing entries and return them.
    pub fn expire_typing(&mut self, now: Instant) -> Vec<TypingPayload> {
        let mut expired = Vec::new();
        self.typing.retain(|chat_id, users| {
            users.retain(|user_id, deadline| {
                let live = *deadline > now;
                if !live {
                    expired.push(TypingPayload { chat_id: chat_id.clone(), user_id: user_id.clone() });
                }
                live
            });
            !users.is_empty()
        });
        expired.sort_by(|a, b| (&a.chat_id, &a.user_id).cmp(&(&b.chat_id, &b.user_id)));
        expired
    }

    #[must_use]
    pub fn next_typing_deadline(&self) -> Option<Instant> {
        self.typing.values().flat_map(HashMap::values).min().copied()
    }

    // =========================================================================
    // PRESENCE
    // =========================================================================

    pub fn set_online(&mut self, user_id: &str, online: bool) {
        if online {
            self.online.insert(user_id.to_owned());
        } else {
            self.online.remove(user_id);
        }
    }

    #[must_use]
    pub fn is_online(&self, user_id: &str) -> bool {
        self.online.contains(user_id)
    }
}

fn sort_messages(list: &mut [Message]) {
    list.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.sequence.cmp(&b.sequence))
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
#[path = "store_test.rs"]
mod tests;
