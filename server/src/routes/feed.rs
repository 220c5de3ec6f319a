//! Change-feed websocket: streams committed message inserts for one chat.
//!
//! Each frame is a JSON `ChangeEvent` (`{"type":"INSERT","table":"messages","record":{..}}`).
//! The feed is read-only; inbound text is ignored.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::{info, warn};

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct FeedParams {
    pub chat_id: String,
}

pub async fn handle_feed(
    State(state): State<AppState>,
    Query(params): Query<FeedParams>,
    ws: WebSocketUpgrade,
) -> Response {
    if params.chat_id.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "chat_id required").into_response();
    }
    ws.on_upgrade(move |socket| run_feed(socket, state, params.chat_id))
}

async fn run_feed(mut socket: WebSocket, state: AppState, chat_id: String) {
    let capacity = state.config.client_channel_capacity;
    let (subscription_id, mut rx) = state.feed.subscribe(&chat_id, capacity).await;
    info!(%subscription_id, %chat_id, "feed: subscriber connected");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
            Some(event) = rx.recv() => {
                let json = match event.encode() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(%subscription_id, error = %e, "feed: failed to encode change");
                        continue;
                    }
                };
                if socket.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.feed.unsubscribe(subscription_id).await;
    info!(%subscription_id, %chat_id, "feed: subscriber disconnected");
}
