use super::*;
use crate::state::test_helpers::{assert_no_event, recv_event, register, register_in_room, test_app_state};
use events::TypingPayload;

fn typing_event(chat_id: &str) -> ServerEvent {
    ServerEvent::UserTyping(TypingPayload { chat_id: chat_id.into(), user_id: "alice".into() })
}

#[tokio::test]
async fn join_tracks_membership_both_ways() {
    let state = test_app_state();
    let (conn, _rx) = register(&state).await;

    assert!(join_room(&state, conn, "c1").await);
    assert!(!join_room(&state, conn, "c1").await);

    let relay = state.relay.read().await;
    assert!(relay.rooms["c1"].contains(&conn));
    assert!(relay.connections[&conn].rooms.contains("c1"));
}

#[tokio::test]
async fn join_unknown_connection_is_rejected() {
    let state = test_app_state();
    assert!(!join_room(&state, Uuid::new_v4(), "c1").await);
    assert!(!state.relay.read().await.rooms.contains_key("c1"));
}

#[tokio::test]
async fn leave_drops_empty_room() {
    let state = test_app_state();
    let (conn, _rx) = register_in_room(&state, "c1").await;

    assert!(leave_room(&state, conn, "c1").await);
    assert!(!leave_room(&state, conn, "c1").await);
    assert!(!state.relay.read().await.rooms.contains_key("c1"));
}

#[tokio::test]
async fn broadcast_reaches_only_room_members() {
    let state = test_app_state();
    let (_a, mut a_rx) = register_in_room(&state, "c1").await;
    let (_b, mut b_rx) = register_in_room(&state, "c1").await;
    let (_c, mut c_rx) = register_in_room(&state, "c2").await;

    let delivered = broadcast(&state, "c1", &typing_event("c1"), None).await;

    assert_eq!(delivered, 2);
    assert_eq!(recv_event(&mut a_rx).await, typing_event("c1"));
    assert_eq!(recv_event(&mut b_rx).await, typing_event("c1"));
    assert_no_event(&mut c_rx).await;
}

#[tokio::test]
async fn broadcast_excludes_sender() {
    let state = test_app_state();
    let (a, mut a_rx) = register_in_room(&state, "c1").await;
    let (_b, mut b_rx) = register_in_room(&state, "c1").await;

    assert_eq!(broadcast(&state, "c1", &typing_event("c1"), Some(a)).await, 1);
    assert_eq!(recv_event(&mut b_rx).await, typing_event("c1"));
    assert_no_event(&mut a_rx).await;
}

#[tokio::test]
async fn broadcast_to_empty_room_is_noop() {
    let state = test_app_state();
    assert_eq!(broadcast(&state, "nobody", &typing_event("nobody"), None).await, 0);
}

#[tokio::test]
async fn full_queue_skips_connection_without_blocking_room() {
    let state = test_app_state();
    let (slow_tx, _slow_rx) = mpsc::channel(1);
    let slow = Uuid::new_v4();
    register_connection(&state, slow, slow_tx).await;
    join_room(&state, slow, "c1").await;
    let (_fast, mut fast_rx) = register_in_room(&state, "c1").await;

    assert_eq!(broadcast(&state, "c1", &typing_event("c1"), None).await, 2);
    assert_eq!(broadcast(&state, "c1", &typing_event("c1"), None).await, 1);

    assert_eq!(recv_event(&mut fast_rx).await, typing_event("c1"));
    assert_eq!(recv_event(&mut fast_rx).await, typing_event("c1"));
}

#[tokio::test]
async fn fanout_all_ignores_rooms() {
    let state = test_app_state();
    let (_a, mut a_rx) = register(&state).await;
    let (_b, mut b_rx) = register_in_room(&state, "c9").await;

    let relay = state.relay.read().await;
    assert_eq!(fanout_all(&relay, &typing_event("c1"), None), 2);
    drop(relay);

    assert_eq!(recv_event(&mut a_rx).await, typing_event("c1"));
    assert_eq!(recv_event(&mut b_rx).await, typing_event("c1"));
}
