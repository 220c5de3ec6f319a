//! Chat client: reconciliation store, session controller and network adapters.
//!
//! A [`ChatSession`] owns a [`ChatStore`] and talks to the server over three
//! channels (the REST message log, the relay websocket and the change-feed
//! websocket). Messages may arrive on both push channels in any order; the
//! store deduplicates them by id.

pub mod error;
pub mod net;
pub mod session;
pub mod store;
pub mod subscription;
pub mod typing;

pub use error::ClientError;
pub use net::api::HttpMessageLog;
pub use net::feed::WsChangeFeed;
pub use net::relay::{RelayOptions, WsRelayLink};
pub use net::{ChangeFeed, MessageLog, NewChat, RelayLink};
pub use session::{Applied, Channel, ChatSession, SendOutcome, SessionState};
pub use store::{ChatStore, MergeOutcome};
pub use subscription::{Subscribers, Subscription};
