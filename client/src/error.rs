//! Client error type.
//!
//! ERROR HANDLING
//! ==============
//! Transport failures surface as `ClientError` from the network adapters.
//! The session controller never propagates them to the caller of a
//! chat operation: a failed send keeps the local copy flagged unconfirmed,
//! and a failed subscribe or join is logged and retried on the next open.

use events::EventError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(String),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("http {status}: {body}")]
    Status { status: u16, body: String },
    #[error("websocket error: {0}")]
    Ws(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("event codec: {0}")]
    Event(#[from] EventError),
    #[error("connection closed")]
    Closed,
    #[error("timed out waiting for acknowledgement")]
    Timeout,
    #[error("rejected by relay: {0}")]
    Rejected(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Ws(Box::new(error))
    }
}

impl ClientError {
    /// Whether retrying the same request later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) | Self::Ws(_) | Self::Closed | Self::Timeout => true,
            Self::Status { status, .. } => *status >= 500,
            Self::InvalidBaseUrl(_) | Self::Event(_) | Self::Rejected(_) => false,
        }
    }
}

#[cfg(test)]
#[path = "error_test.rs"]
mod tests;
