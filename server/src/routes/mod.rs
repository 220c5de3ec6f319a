//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! This module binds the REST API, the relay websocket (`/api/ws`) and the
//! change-feed websocket (`/api/feed`) under a single Axum router.

pub mod chats;
pub mod feed;
pub mod ws;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Full application router.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/users/{user_id}/chats", get(chats::list_chats))
        .route("/api/chats", post(chats::create_chat))
        .route("/api/chats/{id}/participants", post(chats::add_participant))
        .route("/api/chats/{id}/participants/{user_id}", delete(chats::remove_participant))
        .route("/api/chats/{id}/messages", get(chats::list_messages))
        .route("/api/messages/{id}/read", post(chats::mark_read))
        .route("/api/ws", get(ws::handle_ws))
        .route("/api/feed", get(feed::handle_feed))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}
