//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor.
//! It holds the message store, the relay's in-memory connection and room
//! tables, and the change-feed hub. Relay state is ephemeral: rooms, online
//! users and typing entries are rebuilt from client events after a restart.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use events::{ServerEvent, TypingPayload};
use tokio::sync::{RwLock, mpsc};
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::services::changefeed::ChangeFeedHub;
use crate::services::message::MessageStore;
use crate::services::typing::TypingTracker;

// =============================================================================
// CONNECTION
// =============================================================================

/// One live relay websocket.
pub struct Connection {
    /// Outbound queue drained by the socket's writer.
    pub tx: mpsc::Sender<ServerEvent>,
    /// Bound by the first `user_online`.
    pub user_id: Option<String>,
    pub rooms: HashSet<String>,
}

// =============================================================================
// RELAY STATE
// =============================================================================

#[derive(Default)]
pub struct RelayState {
    pub connections: HashMap<Uuid, Connection>,
    /// Room (chat id) -> member connections.
    pub rooms: HashMap<String, HashSet<Uuid>>,
    /// User -> live connections bound to that user.
    pub online: HashMap<String, HashSet<Uuid>>,
    pub typing: TypingTracker,
    /// Expiry for each typing entry; refreshed by every `typing` event.
    pub typing_deadlines: HashMap<TypingPayload, Instant>,
}

impl RelayState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

// =============================================================================
// APP STATE
// =============================================================================

/// Clone is required by Axum; all inner fields are Arc-wrapped or Clone.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn MessageStore>,
    pub relay: Arc<RwLock<RelayState>>,
    pub feed: ChangeFeedHub,
    pub config: Arc<RelayConfig>,
}

impl AppState {
    #[must_use]
    pub fn new(store: Arc<dyn MessageStore>, config: RelayConfig) -> Self {
        Self {
            store,
            relay: Arc::new(RwLock::new(RelayState::new())),
            feed: ChangeFeedHub::new(),
            config: Arc::new(config),
        }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================

#[cfg(test)]
#[path = "state_helpers_test.rs"]
pub mod test_helpers;

#[cfg(test)]
#[path = "state_test.rs"]
mod tests;
