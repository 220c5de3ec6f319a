use super::*;
use crate::state::test_helpers::{
    FailingStore, assert_no_event, recv_event, register, register_in_room, seed_chat, test_app_state,
    test_app_state_with_store,
};
use events::{ChangeEvent, ChatRef, PresenceStatus, StatusChange, UserRef};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::{Duration, timeout};
use tokio_tungstenite::tungstenite::Message as WsMessage;

fn encode(event: &ClientEvent) -> String {
    event.encode().expect("client event should encode")
}

fn join(chat_id: &str) -> String {
    encode(&ClientEvent::JoinChat(ChatRef { chat_id: chat_id.into() }))
}

fn online(user_id: &str) -> String {
    encode(&ClientEvent::UserOnline(UserRef { user_id: user_id.into() }))
}

fn typing_payload(chat_id: &str, user_id: &str) -> TypingPayload {
    TypingPayload { chat_id: chat_id.into(), user_id: user_id.into() }
}

// =============================================================================
// process_inbound_text
// =============================================================================

#[tokio::test]
async fn malformed_json_replies_with_error() {
    let state = test_app_state();
    let (conn, _rx) = register(&state).await;

    let replies = process_inbound_text(&state, conn, "{not json").await;

    assert_eq!(replies.len(), 1);
    let ServerEvent::Error(err) = &replies[0] else { panic!("expected error event") };
    assert_eq!(err.code, "E_MALFORMED");
}

#[tokio::test]
async fn unknown_event_name_replies_with_error() {
    let state = test_app_state();
    let (conn, _rx) = register(&state).await;

    let replies = process_inbound_text(&state, conn, r#"{"event":"launch_rockets","data":{}}"#).await;
    assert!(matches!(&replies[..], [ServerEvent::Error(_)]));
}

#[tokio::test]
async fn join_and_leave_are_silent() {
    let state = test_app_state();
    let (conn, _rx) = register(&state).await;

    assert!(process_inbound_text(&state, conn, &join("c1")).await.is_empty());
    assert!(state.relay.read().await.rooms["c1"].contains(&conn));

    let leave = encode(&ClientEvent::LeaveChat(ChatRef { chat_id: "c1".into() }));
    assert!(process_inbound_text(&state, conn, &leave).await.is_empty());
    assert!(!state.relay.read().await.rooms.contains_key("c1"));
}

#[tokio::test]
async fn send_message_acks_sender_and_broadcasts_room() {
    let state = test_app_state();
    let chat = seed_chat(&state, &["alice", "bob"]).await;
    let (alice, mut alice_rx) = register_in_room(&state, &chat.id).await;
    let (_bob, mut bob_rx) = register_in_room(&state, &chat.id).await;
    process_inbound_text(&state, alice, &online("alice")).await;
    while alice_rx.try_recv().is_ok() {}
    while bob_rx.try_recv().is_ok() {}

    let outgoing = events::Message::new(&chat.id, "alice", "hi bob");
    let replies = process_inbound_text(&state, alice, &encode(&ClientEvent::SendMessage(outgoing.clone()))).await;

    let [ServerEvent::MessageAck(ack)] = &replies[..] else { panic!("expected ack, got {replies:?}") };
    assert_eq!(ack.id, outgoing.id);
    let ServerEvent::NewMessage(delivered) = recv_event(&mut bob_rx).await else { panic!("expected new_message") };
    assert_eq!(delivered.id, outgoing.id);
    assert!(matches!(recv_event(&mut alice_rx).await, ServerEvent::NewMessage(_)));
}

#[tokio::test]
async fn failed_persist_replies_message_failed_and_skips_room() {
    let state = test_app_state_with_store(Arc::new(FailingStore));
    let (alice, _alice_rx) = register_in_room(&state, "c1").await;
    let (_bob, mut bob_rx) = register_in_room(&state, "c1").await;

    let outgoing = events::Message::new("c1", "alice", "lost");
    let replies = process_inbound_text(&state, alice, &encode(&ClientEvent::SendMessage(outgoing.clone()))).await;

    let [ServerEvent::MessageFailed(failure)] = &replies[..] else { panic!("expected failure, got {replies:?}") };
    assert_eq!(failure.id, outgoing.id);
    assert_eq!(failure.chat_id, "c1");
    assert!(failure.error.starts_with("E_DATABASE"));
    assert_no_event(&mut bob_rx).await;
}

#[tokio::test]
async fn bound_connection_cannot_speak_for_another_user() {
    let state = test_app_state();
    let chat = seed_chat(&state, &["alice", "bob"]).await;
    let (alice, _alice_rx) = register_in_room(&state, &chat.id).await;
    let (_bob, mut bob_rx) = register_in_room(&state, &chat.id).await;
    process_inbound_text(&state, alice, &online("alice")).await;
    while bob_rx.try_recv().is_ok() {}

    let forged = events::Message::new(&chat.id, "bob", "not really bob");
    let replies = process_inbound_text(&state, alice, &encode(&ClientEvent::SendMessage(forged.clone()))).await;
    let [ServerEvent::MessageFailed(failure)] = &replies[..] else { panic!("expected failure, got {replies:?}") };
    assert_eq!(failure.id, forged.id);
    assert_eq!(failure.chat_id, chat.id);
    assert!(failure.error.starts_with("E_USER_MISMATCH"));

    let typing = encode(&ClientEvent::Typing(typing_payload(&chat.id, "bob")));
    assert!(matches!(&process_inbound_text(&state, alice, &typing).await[..], [ServerEvent::Error(_)]));
    assert_no_event(&mut bob_rx).await;
}

#[tokio::test]
async fn typing_events_relay_to_peers() {
    let state = test_app_state();
    let (alice, _alice_rx) = register_in_room(&state, "c1").await;
    let (_bob, mut bob_rx) = register_in_room(&state, "c1").await;

    let start = encode(&ClientEvent::Typing(typing_payload("c1", "alice")));
    let stop = encode(&ClientEvent::StopTyping(typing_payload("c1", "alice")));
    assert!(process_inbound_text(&state, alice, &start).await.is_empty());
    assert!(process_inbound_text(&state, alice, &stop).await.is_empty());

    assert_eq!(recv_event(&mut bob_rx).await, ServerEvent::UserTyping(typing_payload("c1", "alice")));
    assert_eq!(recv_event(&mut bob_rx).await, ServerEvent::UserStopTyping(typing_payload("c1", "alice")));
}

#[tokio::test]
async fn user_online_with_new_identity_is_rejected() {
    let state = test_app_state();
    let (conn, _rx) = register(&state).await;
    process_inbound_text(&state, conn, &online("alice")).await;

    let replies = process_inbound_text(&state, conn, &online("mallory")).await;
    let [ServerEvent::Error(err)] = &replies[..] else { panic!("expected error") };
    assert_eq!(err.code, "E_USER_MISMATCH");
}

// =============================================================================
// OVER A REAL SOCKET
// =============================================================================

type Client = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn spawn_server(state: AppState) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, crate::routes::app(state)).await.unwrap();
    });
    addr
}

async fn connect(addr: SocketAddr, path: &str) -> Client {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}{path}"))
        .await
        .expect("websocket should connect");
    ws
}

async fn send_text(ws: &mut Client, text: String) {
    ws.send(WsMessage::text(text)).await.expect("send should succeed");
}

async fn next_text(ws: &mut Client) -> String {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("socket receive timed out")
            .expect("socket closed")
            .expect("socket error");
        if let WsMessage::Text(text) = msg {
            return text.as_str().to_owned();
        }
    }
}

async fn next_event(ws: &mut Client) -> ServerEvent {
    ServerEvent::decode(&next_text(ws).await).expect("server event should decode")
}

/// Join a room and announce presence; returns once the relay echoed our own
/// online status, so both events are processed.
async fn join_as(ws: &mut Client, chat_id: &str, user_id: &str) {
    send_text(ws, join(chat_id)).await;
    send_text(ws, online(user_id)).await;
    loop {
        if let ServerEvent::UserStatusChange(change) = next_event(ws).await {
            if change.user_id == user_id {
                return;
            }
        }
    }
}

#[tokio::test]
async fn socket_message_reaches_room_and_change_feed() {
    let state = test_app_state();
    let chat = seed_chat(&state, &["alice", "bob"]).await;
    let addr = spawn_server(state.clone()).await;

    let mut feed = connect(addr, &format!("/api/feed?chat_id={}", chat.id)).await;
    for _ in 0..50 {
        if state.feed.subscriber_count().await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let mut alice = connect(addr, "/api/ws").await;
    let mut bob = connect(addr, "/api/ws").await;
    join_as(&mut alice, &chat.id, "alice").await;
    join_as(&mut bob, &chat.id, "bob").await;

    let outgoing = events::Message::new(&chat.id, "alice", "over the wire");
    send_text(&mut alice, encode(&ClientEvent::SendMessage(outgoing.clone()))).await;

    let mut acked = false;
    let mut echoed = false;
    while !(acked && echoed) {
        match next_event(&mut alice).await {
            ServerEvent::MessageAck(m) if m.id == outgoing.id => acked = true,
            ServerEvent::NewMessage(m) if m.id == outgoing.id => echoed = true,
            _ => {}
        }
    }

    loop {
        if let ServerEvent::NewMessage(m) = next_event(&mut bob).await {
            assert_eq!(m.id, outgoing.id);
            assert_eq!(m.content, "over the wire");
            break;
        }
    }

    let change = ChangeEvent::decode(&next_text(&mut feed).await).unwrap();
    assert_eq!(change.record.id, outgoing.id);
    assert_eq!(change.record.chat_id, chat.id);
}

#[tokio::test]
async fn socket_close_broadcasts_offline() {
    let state = test_app_state();
    let addr = spawn_server(state.clone()).await;

    let mut alice = connect(addr, "/api/ws").await;
    let mut bob = connect(addr, "/api/ws").await;
    join_as(&mut alice, "c1", "alice").await;
    join_as(&mut bob, "c1", "bob").await;
    send_text(&mut bob, encode(&ClientEvent::Typing(typing_payload("c1", "bob")))).await;

    bob.close(None).await.unwrap();
    drop(bob);

    let mut saw_stop = false;
    loop {
        match next_event(&mut alice).await {
            ServerEvent::UserStopTyping(p) if p.user_id == "bob" => saw_stop = true,
            ServerEvent::UserStatusChange(StatusChange { user_id, status: PresenceStatus::Offline }) => {
                assert_eq!(user_id, "bob");
                break;
            }
            _ => {}
        }
    }
    assert!(saw_stop);
    assert!(!crate::services::presence::is_online(&state, "bob").await);
}
