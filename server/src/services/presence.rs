//! Online presence and connection teardown.
//!
//! DESIGN
//! ======
//! A connection is bound to a user by its first `user_online` event. The
//! online set maps each user to their live connections, so a user with two
//! tabs stays online until both drop. Status changes go to every connection,
//! not just shared rooms, and only on the first connect and the last drop.

use events::{PresenceStatus, ServerEvent, StatusChange, TypingPayload};
use tracing::info;
use uuid::Uuid;

use crate::error::ErrorCode;
use crate::services::room;
use crate::state::AppState;

#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    #[error("connection already bound to user {bound}, refusing {requested}")]
    IdentityMismatch { bound: String, requested: String },
    #[error("unknown connection {0}")]
    UnknownConnection(Uuid),
}

impl ErrorCode for PresenceError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::IdentityMismatch { .. } => "E_USER_MISMATCH",
            Self::UnknownConnection(_) => "E_UNKNOWN_CONNECTION",
        }
    }
}

/// Bind `connection_id` to `user_id` and mark the user online. The status
/// change goes to all connections only when this is the user's first live
/// connection.
///
/// # Errors
///
/// Returns [`PresenceError::IdentityMismatch`] if the connection is already
/// bound to a different user.
pub async fn set_online(state: &AppState, connection_id: Uuid, user_id: &str) -> Result<(), PresenceError> {
    let mut relay = state.relay.write().await;
    let Some(connection) = relay.connections.get_mut(&connection_id) else {
        return Err(PresenceError::UnknownConnection(connection_id));
    };
    if connection.user_id.is_none() {
        connection.user_id = Some(user_id.to_owned());
    }
    if let Some(bound) = connection.user_id.as_deref().filter(|bound| *bound != user_id) {
        return Err(PresenceError::IdentityMismatch { bound: bound.to_owned(), requested: user_id.to_owned() });
    }

    let first_session = !relay.online.contains_key(user_id);
    let connections = relay.online.entry(user_id.to_owned()).or_default();
    connections.insert(connection_id);
    info!(%connection_id, %user_id, sessions = connections.len(), "user online");
    if !first_session {
        return Ok(());
    }

    let event = ServerEvent::UserStatusChange(StatusChange {
        user_id: user_id.to_owned(),
        status: PresenceStatus::Online,
    });
    room::fanout_all(&relay, &event, None);
    Ok(())
}

/// User bound to a connection, if any.
pub async fn connection_user(state: &AppState, connection_id: Uuid) -> Option<String> {
    let relay = state.relay.read().await;
    relay
        .connections
        .get(&connection_id)
        .and_then(|c| c.user_id.clone())
}

pub async fn is_online(state: &AppState, user_id: &str) -> bool {
    state.relay.read().await.online.contains_key(user_id)
}

/// Tear down a dropped connection: leave its rooms, and if it was the
/// user's last connection clear their typing entries and broadcast offline.
pub async fn disconnect(state: &AppState, connection_id: Uuid) {
    let mut relay = state.relay.write().await;
    let Some(connection) = relay.connections.remove(&connection_id) else {
        return;
    };

    for chat_id in &connection.rooms {
        if let Some(members) = relay.rooms.get_mut(chat_id) {
            members.remove(&connection_id);
            if members.is_empty() {
                relay.rooms.remove(chat_id);
            }
        }
    }

    let Some(user_id) = connection.user_id else {
        info!(%connection_id, "anonymous connection dropped");
        return;
    };

    let last_session = match relay.online.get_mut(&user_id) {
        Some(sessions) => {
            sessions.remove(&connection_id);
            sessions.is_empty()
        }
        None => true,
    };
    if !last_session {
        info!(%connection_id, %user_id, "connection dropped; user still online elsewhere");
        return;
    }
    relay.online.remove(&user_id);

    let stopped = relay.typing.remove_user(&user_id);
    relay.typing_deadlines.retain(|entry, _| entry.user_id != user_id);
    for chat_id in &stopped {
        let payload = TypingPayload { chat_id: chat_id.clone(), user_id: user_id.clone() };
        room::fanout(&relay, chat_id, &ServerEvent::UserStopTyping(payload), None);
    }

    let event = ServerEvent::UserStatusChange(StatusChange { user_id: user_id.clone(), status: PresenceStatus::Offline });
    room::fanout_all(&relay, &event, None);
    info!(%connection_id, %user_id, "user offline");
}

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;
