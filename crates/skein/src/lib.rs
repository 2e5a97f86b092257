//! skein: a publish/subscribe client with ordered dispatch, flush and
//! graceful drain, plus a loopback broker for tests and local use.
//!
//! Most users only need [`Connection`]; [`broker`] is here so tests and demos
//! can run without an external server.

pub use skein_client::{
    ClientError, CloseReason, Completion, ConnectOptions, Connection, ConnectionStatus, ErrorKind,
    Headers, Info, Message, Result, Stats, SubscribeOptions, Subscriber, Subscription,
    SubscriptionStatus,
};
pub use skein_util::{init_tracing, new_inbox};

pub mod broker {
    pub use skein_broker::{
        Broker, BrokerConfig, BrokerError, BrokerStats, ClientId,
        server::{ServerHandle, handle_connection, run_server, serve},
        subject_matches,
    };
}

pub mod protocol {
    pub use skein_protocol::v1::*;
}
