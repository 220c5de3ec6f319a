//! WebSocket handler: the room relay endpoint.
//!
//! DESIGN
//! ======
//! On upgrade, registers the connection with a bounded outbound queue and
//! enters a `select!` loop:
//! - Incoming client events → decode + dispatch by event name
//! - Queued server events from room peers → forward to client
//!
//! Handlers validate, call into services (which own fan-out to peers), and
//! return an `Outcome` describing what the sender itself gets back.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → register connection
//! 2. `user_online` binds the connection to a user
//! 3. Client events → dispatch → reply per `Outcome`
//! 4. Close → leave rooms, clear typing, broadcast offline if last session

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use events::{ClientEvent, ServerEvent, TypingPayload};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ErrorCode, error_event, send_failure};
use crate::services::presence::PresenceError;
use crate::services::{message, presence, room, typing};
use crate::state::AppState;

// =============================================================================
// OUTCOME
// =============================================================================

/// What the sending connection receives for one inbound event. Peers are
/// served by the services themselves.
enum Outcome {
    Reply(ServerEvent),
    Silent,
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_ws(socket, state))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4();
    let (client_tx, mut client_rx) = mpsc::channel::<ServerEvent>(state.config.client_channel_capacity.max(1));
    room::register_connection(&state, connection_id, client_tx).await;
    info!(%connection_id, "ws: client connected");

    'conn: loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        let replies = process_inbound_text(&state, connection_id, text.as_str()).await;
                        for event in replies {
                            if send_event(&mut socket, &event).await.is_err() {
                                break 'conn;
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(event) = client_rx.recv() => {
                if send_event(&mut socket, &event).await.is_err() {
                    break;
                }
            }
        }
    }

    presence::disconnect(&state, connection_id).await;
    info!(%connection_id, "ws: client disconnected");
}

// =============================================================================
// EVENT DISPATCH
// =============================================================================

/// Decode and process one inbound text frame and return the events for the
/// sender.
///
/// Kept separate from the socket so tests can drive dispatch directly.
async fn process_inbound_text(state: &AppState, connection_id: Uuid, text: &str) -> Vec<ServerEvent> {
    let event = match ClientEvent::decode(text) {
        Ok(event) => event,
        Err(e) => {
            warn!(%connection_id, error = %e, "ws: invalid inbound event");
            return vec![ServerEvent::error("E_MALFORMED", e.to_string())];
        }
    };
    debug!(%connection_id, event = event.name(), "ws: recv event");

    let result = match event {
        ClientEvent::JoinChat(chat) => {
            room::join_room(state, connection_id, &chat.chat_id).await;
            Ok(Outcome::Silent)
        }
        ClientEvent::LeaveChat(chat) => {
            room::leave_room(state, connection_id, &chat.chat_id).await;
            Ok(Outcome::Silent)
        }
        ClientEvent::SendMessage(msg) => handle_send(state, connection_id, msg).await,
        ClientEvent::Typing(payload) => handle_typing(state, connection_id, &payload, true).await,
        ClientEvent::StopTyping(payload) => handle_typing(state, connection_id, &payload, false).await,
        ClientEvent::UserOnline(user) => presence::set_online(state, connection_id, &user.user_id)
            .await
            .map(|()| Outcome::Silent),
    };

    match result {
        Ok(Outcome::Reply(event)) => vec![event],
        Ok(Outcome::Silent) => vec![],
        Err(e) => {
            warn!(%connection_id, code = e.error_code(), error = %e, "ws: event rejected");
            vec![error_event(&e)]
        }
    }
}

/// Every send gets exactly one reply: `message_ack` or `message_failed`.
async fn handle_send(
    state: &AppState,
    connection_id: Uuid,
    msg: events::Message,
) -> Result<Outcome, PresenceError> {
    let (id, chat_id) = (msg.id.clone(), msg.chat_id.clone());
    if let Err(e) = check_identity(state, connection_id, &msg.sender_id).await {
        warn!(%connection_id, code = e.error_code(), error = %e, "ws: send rejected");
        return Ok(Outcome::Reply(send_failure(id, chat_id, &e)));
    }

    match message::publish_message(state, connection_id, msg).await {
        Ok(persisted) => Ok(Outcome::Reply(ServerEvent::MessageAck(persisted))),
        Err(e) => Ok(Outcome::Reply(send_failure(id, chat_id, &e))),
    }
}

async fn handle_typing(
    state: &AppState,
    connection_id: Uuid,
    payload: &TypingPayload,
    started: bool,
) -> Result<Outcome, PresenceError> {
    check_identity(state, connection_id, &payload.user_id).await?;
    if started {
        typing::start_typing(state, connection_id, payload).await;
    } else {
        typing::stop_typing(state, connection_id, payload).await;
    }
    Ok(Outcome::Silent)
}

/// A connection bound by `user_online` may only act as that user.
async fn check_identity(state: &AppState, connection_id: Uuid, claimed: &str) -> Result<(), PresenceError> {
    match presence::connection_user(state, connection_id).await {
        Some(bound) if bound != claimed => Err(PresenceError::IdentityMismatch { bound, requested: claimed.to_owned() }),
        _ => Ok(()),
    }
}

// =============================================================================
// HELPERS
// =============================================================================

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), ()> {
    let json = match event.encode() {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, event = event.name(), "ws: failed to encode event");
            return Err(());
        }
    };
    if let ServerEvent::Error(err) = event {
        warn!(code = %err.code, message = %err.message, "ws: send error event");
    } else {
        debug!(event = event.name(), "ws: send event");
    }
    socket.send(Message::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
