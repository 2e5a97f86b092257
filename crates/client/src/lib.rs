//! Client engine for the skein publish/subscribe protocol.
//!
//! A [`Connection`] owns one ordered byte stream to a broker. A single engine
//! task reads inbound frames, dispatches messages to subscriptions in arrival
//! order, and serializes every outbound write. Handles only enqueue commands,
//! so publish and subscribe never suspend.
//!
//! ```no_run
//! use skein_client::{ConnectOptions, Connection, SubscribeOptions};
//!
//! # async fn demo() -> skein_client::Result<()> {
//! let conn = Connection::connect("127.0.0.1:4222", ConnectOptions::default()).await?;
//!
//! let sub = conn.subscribe_with("orders.created", SubscribeOptions::default(), |msg| {
//!     println!("{} bytes on {}", msg.payload.len(), msg.subject);
//! })?;
//!
//! conn.publish("orders.created", &b"\x00\x01binary"[..])?;
//! conn.flush().await?;
//!
//! sub.drain().await?;
//! conn.drain().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Publishing has no flow control: callers that need to bound how far ahead
//! of the broker they run should `flush()` periodically.

mod completion;
mod connection;
mod drain;
mod engine;
mod error;
mod flush;
mod message;
mod options;
mod registry;
mod state;
mod stats;
mod subscription;

pub use completion::Completion;
pub use connection::Connection;
pub use error::{ClientError, ErrorKind, Result};
pub use message::Message;
pub use options::{ConnectOptions, SubscribeOptions};
pub use state::{CloseReason, ConnectionStatus, SubscriptionStatus};
pub use stats::Stats;
pub use subscription::{Subscriber, Subscription};

pub use skein_protocol::v1::{Headers, Info};
