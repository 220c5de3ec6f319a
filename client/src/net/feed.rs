//! Change-feed adapter.
//!
//! Each subscription opens its own `/api/feed?chat_id=..` socket and runs a
//! small reader task that decodes change rows into the subscription channel.
//! Dropping the [`Subscription`] closes the channel; the reader notices and
//! closes the socket.

use async_trait::async_trait;
use events::{ChangeEvent, ChangeKind, MessageRow};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

use super::{ChangeFeed, ws_url};
use crate::error::ClientError;
use crate::subscription::Subscription;

#[derive(Debug, Clone)]
pub struct WsChangeFeed {
    base_url: String,
}

impl WsChangeFeed {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into() }
    }
}

#[async_trait]
impl ChangeFeed for WsChangeFeed {
    async fn subscribe_inserts(&self, chat_id: &str) -> Result<Subscription<MessageRow>, ClientError> {
        let url = feed_url(&self.base_url, chat_id)?;
        let (stream, _) = connect_async(url.as_str()).await?;
        let (mut write, mut read) = stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let chat_id = chat_id.to_owned();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tx.closed() => break,
                    frame = read.next() => {
                        let text = match frame {
                            Some(Ok(WsMessage::Text(text))) => text,
                            Some(Ok(WsMessage::Close(_)) | Err(_)) | None => break,
                            Some(Ok(_)) => continue,
                        };
                        match decode_insert(text.as_str(), &chat_id) {
                            Some(row) => {
                                if tx.send(row).is_err() {
                                    break;
                                }
                            }
                            None => debug!(%chat_id, "feed: ignored frame"),
                        }
                    }
                }
            }
            let _ = write.close().await;
            debug!(%chat_id, "feed: reader stopped");
        });

        Ok(Subscription::from_channel(rx))
    }
}

/// Feed socket URL with `chat_id` form-encoded into the query.
fn feed_url(base_url: &str, chat_id: &str) -> Result<reqwest::Url, ClientError> {
    let url = ws_url(base_url, "/api/feed")?;
    let mut url = reqwest::Url::parse(&url).map_err(|_| ClientError::InvalidBaseUrl(base_url.to_owned()))?;
    url.query_pairs_mut().append_pair("chat_id", chat_id);
    Ok(url)
}

/// Decode one feed frame, keeping only message inserts for `chat_id`.
fn decode_insert(text: &str, chat_id: &str) -> Option<MessageRow> {
    let change = match ChangeEvent::decode(text) {
        Ok(change) => change,
        Err(error) => {
            warn!(%error, "feed: malformed change row");
            return None;
        }
    };
    let wanted = change.kind == ChangeKind::Insert && change.table == "messages" && change.record.chat_id == chat_id;
    wanted.then_some(change.record)
}

#[cfg(test)]
#[path = "feed_test.rs"]
mod tests;
