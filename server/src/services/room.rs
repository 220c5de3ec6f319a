//! Room membership and fan-out.
//!
//! DESIGN
//! ======
//! A room is named by its chat id and created implicitly on first join.
//! Membership is tracked both ways (room -> connections, connection -> rooms)
//! so disconnect cleanup never scans every room. Empty rooms are dropped.
//!
//! Fan-out is best-effort: each connection has a bounded outbound queue and
//! a full queue skips that connection rather than stalling the room.

use std::collections::HashSet;

use events::ServerEvent;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::state::{AppState, Connection, RelayState};

// =============================================================================
// CONNECTIONS
// =============================================================================

/// Register a freshly upgraded connection with its outbound queue.
pub async fn register_connection(state: &AppState, connection_id: Uuid, tx: mpsc::Sender<ServerEvent>) {
    let mut relay = state.relay.write().await;
    relay
        .connections
        .insert(connection_id, Connection { tx, user_id: None, rooms: HashSet::new() });
}

// =============================================================================
// JOIN / LEAVE
// =============================================================================

/// Add a connection to a room. Returns `false` if it was already a member or
/// the connection is unknown.
pub fn join(relay: &mut RelayState, connection_id: Uuid, chat_id: &str) -> bool {
    let Some(connection) = relay.connections.get_mut(&connection_id) else {
        return false;
    };
    if !connection.rooms.insert(chat_id.to_owned()) {
        return false;
    }
    relay
        .rooms
        .entry(chat_id.to_owned())
        .or_default()
        .insert(connection_id);
    true
}

/// Remove a connection from a room. Returns `false` if it was not a member.
pub fn leave(relay: &mut RelayState, connection_id: Uuid, chat_id: &str) -> bool {
    if let Some(connection) = relay.connections.get_mut(&connection_id) {
        connection.rooms.remove(chat_id);
    }
    let Some(members) = relay.rooms.get_mut(chat_id) else {
        return false;
    };
    let removed = members.remove(&connection_id);
    if members.is_empty() {
        relay.rooms.remove(chat_id);
    }
    removed
}

pub async fn join_room(state: &AppState, connection_id: Uuid, chat_id: &str) -> bool {
    let mut relay = state.relay.write().await;
    let joined = join(&mut relay, connection_id, chat_id);
    if joined {
        let members = relay.rooms.get(chat_id).map_or(0, HashSet::len);
        info!(%connection_id, %chat_id, members, "connection joined room");
    }
    joined
}

pub async fn leave_room(state: &AppState, connection_id: Uuid, chat_id: &str) -> bool {
    let mut relay = state.relay.write().await;
    let left = leave(&mut relay, connection_id, chat_id);
    if left {
        info!(%connection_id, %chat_id, "connection left room");
    }
    left
}

// =============================================================================
// BROADCAST
// =============================================================================

/// Queue `event` for every member of `chat_id`, optionally excluding one
/// connection. Returns the number of connections the event was queued for.
pub fn fanout(relay: &RelayState, chat_id: &str, event: &ServerEvent, exclude: Option<Uuid>) -> usize {
    let Some(members) = relay.rooms.get(chat_id) else {
        return 0;
    };

    let mut delivered = 0;
    for connection_id in members {
        if exclude == Some(*connection_id) {
            continue;
        }
        let Some(connection) = relay.connections.get(connection_id) else {
            continue;
        };
        if deliver(*connection_id, connection, event) {
            delivered += 1;
        }
    }
    delivered
}

/// Queue `event` for every live connection, regardless of rooms.
pub fn fanout_all(relay: &RelayState, event: &ServerEvent, exclude: Option<Uuid>) -> usize {
    relay
        .connections
        .iter()
        .filter(|(id, _)| exclude != Some(**id))
        .filter(|(id, connection)| deliver(**id, connection, event))
        .count()
}

/// Broadcast an event to a room, optionally excluding one connection.
pub async fn broadcast(state: &AppState, chat_id: &str, event: &ServerEvent, exclude: Option<Uuid>) -> usize {
    let relay = state.relay.read().await;
    fanout(&relay, chat_id, event, exclude)
}

fn deliver(connection_id: Uuid, connection: &Connection, event: &ServerEvent) -> bool {
    match connection.tx.try_send(event.clone()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(%connection_id, event = event.name(), "outbound queue full; dropping event");
            false
        }
        // Connection is shutting down; disconnect cleanup removes it.
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

#[cfg(test)]
#[path = "room_test.rs"]
mod tests;
