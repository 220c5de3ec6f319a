//! Change feed: per-chat stream of committed message inserts.
//!
//! DESIGN
//! ======
//! An `AFTER INSERT` trigger on `messages` issues `NOTIFY message_inserted`
//! with the new row's id. NOTIFY payloads are size-capped, so the listener
//! reads the committed row back through the store and publishes it as an
//! `INSERT` change event. Subscribers register with a chat filter and only
//! receive inserts for that chat.
//!
//! The feed is independent of the relay: a message written by any path
//! (relay, REST, another process) reaches feed subscribers once committed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use events::{ChangeEvent, MessageRow};
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::services::message::MessageError;
use crate::state::AppState;

pub const MESSAGE_INSERTED_CHANNEL: &str = "message_inserted";

const LISTENER_RETRY_DELAY: Duration = Duration::from_secs(1);

// =============================================================================
// HUB
// =============================================================================

struct FeedSubscriber {
    chat_id: String,
    tx: mpsc::Sender<ChangeEvent>,
}

/// Registry of change-feed subscribers keyed by subscription id.
#[derive(Clone, Default)]
pub struct ChangeFeedHub {
    subscribers: Arc<RwLock<HashMap<Uuid, FeedSubscriber>>>,
}

impl ChangeFeedHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to inserts for `chat_id`.
    pub async fn subscribe(&self, chat_id: &str, capacity: usize) -> (Uuid, mpsc::Receiver<ChangeEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = Uuid::new_v4();
        self.subscribers
            .write()
            .await
            .insert(id, FeedSubscriber { chat_id: chat_id.to_owned(), tx });
        debug!(subscription_id = %id, %chat_id, "change feed subscribed");
        (id, rx)
    }

    pub async fn unsubscribe(&self, subscription_id: Uuid) -> bool {
        self.subscribers.write().await.remove(&subscription_id).is_some()
    }

    /// Deliver `event` to every subscriber of its chat. Returns the number
    /// of subscribers it was queued for.
    pub async fn publish(&self, event: &ChangeEvent) -> usize {
        let subscribers = self.subscribers.read().await;
        let mut delivered = 0;
        for (id, subscriber) in subscribers.iter() {
            if subscriber.chat_id != event.record.chat_id {
                continue;
            }
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subscription_id = %id, id = %event.record.id, "change feed queue full; dropping insert");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    #[cfg(test)]
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

// =============================================================================
// LISTENER
// =============================================================================

/// Load a freshly inserted message and publish it to the feed.
///
/// Returns the number of subscribers reached, or zero when the row has
/// vanished.
///
/// # Errors
///
/// Returns the store error if the row could not be read.
pub async fn publish_inserted(state: &AppState, message_id: &str) -> Result<usize, MessageError> {
    let Some(message) = state.store.get_message(message_id).await? else {
        warn!(id = %message_id, "notified message not found");
        return Ok(0);
    };
    let event = ChangeEvent::insert(MessageRow::from(&message));
    let delivered = state.feed.publish(&event).await;
    debug!(id = %message_id, chat_id = %event.record.chat_id, delivered, "change feed insert published");
    Ok(delivered)
}

/// Spawn the Postgres `LISTEN` loop feeding the change-feed hub.
///
/// # Errors
///
/// Returns an error if the listener cannot connect or subscribe.
pub async fn spawn_listener(state: AppState, pool: &PgPool) -> Result<JoinHandle<()>, sqlx::Error> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(MESSAGE_INSERTED_CHANNEL).await?;
    info!(channel = MESSAGE_INSERTED_CHANNEL, "change feed listener started");

    Ok(tokio::spawn(async move {
        loop {
            match listener.recv().await {
                Ok(notification) => {
                    if let Err(e) = publish_inserted(&state, notification.payload()).await {
                        warn!(error = %e, id = %notification.payload(), "change feed publish failed");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "change feed listener error; retrying");
                    tokio::time::sleep(LISTENER_RETRY_DELAY).await;
                }
            }
        }
    }))
}

#[cfg(test)]
#[path = "changefeed_test.rs"]
mod tests;
