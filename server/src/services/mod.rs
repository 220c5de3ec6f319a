//! Domain services used by websocket and HTTP routes.
//!
//! ARCHITECTURE
//! ============
//! Service modules own relay state changes, fan-out and persistence so route
//! handlers can stay focused on protocol translation.

pub mod changefeed;
pub mod chat;
pub mod message;
pub mod presence;
pub mod room;
pub mod typing;
