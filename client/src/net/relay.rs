//! Relay websocket link.
//!
//! `WsRelayLink` owns one background task that keeps a `/api/ws` connection
//! alive. The task reconnects with exponential backoff and, after every
//! reconnect, replays the presence announcement and room joins issued so far,
//! so callers never re-join by hand.
//!
//! Publishing is request/response on top of push: the task keeps a pending
//! map keyed by message id that `message_ack` / `message_failed` resolve.
//! Every pushed event is also fanned out to [`Subscription`]s.
//!
//! ERROR HANDLING
//! ==============
//! Publishes issued while disconnected fail fast with
//! [`ClientError::Closed`]; pending publishes fail with the same error when
//! the socket drops. Fire-and-forget events issued while disconnected are
//! dropped, except joins, leaves and presence which are folded into the
//! replay set.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use events::{ChatRef, ClientEvent, Message, ServerEvent, UserRef};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use super::{RelayLink, ws_url};
use crate::error::ClientError;
use crate::subscription::{Subscribers, Subscription};

type AckSender = oneshot::Sender<Result<Message, ClientError>>;

/// Timing knobs for the relay link.
#[derive(Debug, Clone, Copy)]
pub struct RelayOptions {
    pub ack_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_millis(10_000),
        }
    }
}

enum Command {
    Emit(ClientEvent),
    Publish { message: Message, reply: AckSender },
}

enum ConnectionEnd {
    Shutdown,
    Disconnected,
}

/// Joins and presence to re-send after a reconnect.
#[derive(Debug, Default)]
struct Replay {
    user_id: Option<String>,
    rooms: BTreeSet<String>,
}

impl Replay {
    fn track(&mut self, event: &ClientEvent) {
        match event {
            ClientEvent::UserOnline(user) => self.user_id = Some(user.user_id.clone()),
            ClientEvent::JoinChat(chat) => {
                self.rooms.insert(chat.chat_id.clone());
            }
            ClientEvent::LeaveChat(chat) => {
                self.rooms.remove(&chat.chat_id);
            }
            _ => {}
        }
    }

    fn events(&self) -> Vec<ClientEvent> {
        let presence = self
            .user_id
            .iter()
            .map(|user_id| ClientEvent::UserOnline(UserRef { user_id: user_id.clone() }));
        let joins = self
            .rooms
            .iter()
            .map(|chat_id| ClientEvent::JoinChat(ChatRef { chat_id: chat_id.clone() }));
        presence.chain(joins).collect()
    }
}

pub struct WsRelayLink {
    commands: mpsc::UnboundedSender<Command>,
    events: Subscribers<ServerEvent>,
    ack_timeout: Duration,
    task: JoinHandle<()>,
}

impl WsRelayLink {
    /// Start the connection task for `base_url` (`http(s)://host`).
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidBaseUrl`] for a non-http scheme. Network
    /// failures are retried in the background, not reported here.
    pub fn connect(base_url: &str) -> Result<Self, ClientError> {
        Self::connect_with(base_url, RelayOptions::default())
    }

    /// # Errors
    ///
    /// See [`WsRelayLink::connect`].
    pub fn connect_with(base_url: &str, options: RelayOptions) -> Result<Self, ClientError> {
        let url = ws_url(base_url, "/api/ws")?;
        let (commands, rx) = mpsc::unbounded_channel();
        let events = Subscribers::new();
        let task = tokio::spawn(run_link(url, rx, events.clone(), options));
        Ok(Self { commands, events, ack_timeout: options.ack_timeout, task })
    }
}

impl Drop for WsRelayLink {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl RelayLink for WsRelayLink {
    async fn emit(&self, event: ClientEvent) -> Result<(), ClientError> {
        event.validate()?;
        self.commands
            .send(Command::Emit(event))
            .map_err(|_| ClientError::Closed)
    }

    async fn publish(&self, message: Message) -> Result<Message, ClientError> {
        message.validate()?;
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Publish { message, reply })
            .map_err(|_| ClientError::Closed)?;
        match tokio::time::timeout(self.ack_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    fn subscribe(&self) -> Subscription<ServerEvent> {
        self.events.subscribe_all()
    }
}

// =============================================================================
// CONNECTION TASK
// =============================================================================

async fn run_link(
    url: String,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: Subscribers<ServerEvent>,
    options: RelayOptions,
) {
    let mut replay = Replay::default();
    let mut backoff = options.initial_backoff;

    loop {
        match connect_async(url.as_str()).await {
            Ok((stream, _)) => {
                info!(%url, "relay: connected");
                backoff = options.initial_backoff;
                match run_connection(stream, &mut commands, &events, &mut replay).await {
                    Ok(ConnectionEnd::Shutdown) => return,
                    Ok(ConnectionEnd::Disconnected) => info!("relay: disconnected"),
                    Err(error) => warn!(%error, "relay: connection failed"),
                }
            }
            Err(error) => warn!(%error, %url, "relay: connect failed"),
        }

        let sleep = tokio::time::sleep(backoff);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => break,
                command = commands.recv() => match command {
                    Some(command) => reject_offline(command, &mut replay),
                    None => return,
                },
            }
        }
        backoff = (backoff * 2).min(options.max_backoff);
    }
}

fn reject_offline(command: Command, replay: &mut Replay) {
    match command {
        Command::Emit(event) => {
            debug!(event = event.name(), "relay: offline, event not sent");
            replay.track(&event);
        }
        Command::Publish { reply, .. } => {
            let _ = reply.send(Err(ClientError::Closed));
        }
    }
}

async fn run_connection<S>(
    stream: tokio_tungstenite::WebSocketStream<S>,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    events: &Subscribers<ServerEvent>,
    replay: &mut Replay,
) -> Result<ConnectionEnd, ClientError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut write, mut read) = stream.split();
    let mut pending: HashMap<String, AckSender> = HashMap::new();

    for event in replay.events() {
        write.send(WsMessage::text(event.encode()?)).await?;
    }

    let end = loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    let _ = write.close().await;
                    break Ok(ConnectionEnd::Shutdown);
                };
                let text = match command {
                    Command::Emit(event) => {
                        replay.track(&event);
                        event.encode()
                    }
                    Command::Publish { message, reply } => {
                        pending.retain(|_, waiting| !waiting.is_closed());
                        let text = ClientEvent::SendMessage(message.clone()).encode();
                        pending.insert(message.id, reply);
                        text
                    }
                };
                if let Err(error) = send_text(&mut write, text).await {
                    break Err(error);
                }
            }
            frame = read.next() => {
                let text = match frame {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Close(_))) | None => break Ok(ConnectionEnd::Disconnected),
                    Some(Err(error)) => break Err(error.into()),
                    Some(Ok(_)) => continue,
                };
                match ServerEvent::decode(text.as_str()) {
                    Ok(event) => dispatch(event, &mut pending, events),
                    Err(error) => warn!(%error, "relay: malformed event"),
                }
            }
        }
    };

    for (_, waiting) in pending.drain() {
        let _ = waiting.send(Err(ClientError::Closed));
    }
    end
}

async fn send_text<W>(write: &mut W, text: Result<String, events::EventError>) -> Result<(), ClientError>
where
    W: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    write.send(WsMessage::text(text?)).await?;
    Ok(())
}

/// Resolve pending publishes, then fan the event out to subscribers.
fn dispatch(event: ServerEvent, pending: &mut HashMap<String, AckSender>, events: &Subscribers<ServerEvent>) {
    match &event {
        ServerEvent::MessageAck(message) => {
            if let Some(waiting) = pending.remove(&message.id) {
                let _ = waiting.send(Ok(message.clone()));
            }
        }
        ServerEvent::MessageFailed(failure) => {
            if let Some(waiting) = pending.remove(&failure.id) {
                let _ = waiting.send(Err(ClientError::Rejected(failure.error.clone())));
            }
        }
        ServerEvent::Error(payload) => warn!(code = %payload.code, message = %payload.message, "relay: error event"),
        _ => {}
    }
    events.publish(&event);
}

#[cfg(test)]
#[path = "relay_test.rs"]
mod tests;
