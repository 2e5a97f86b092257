#![allow(dead_code)]

use std::{future::Future, time::Duration};

use skein::{
    ConnectOptions, Connection,
    broker::{BrokerConfig, ServerHandle},
};

pub const WAIT: Duration = Duration::from_secs(10);

pub async fn start_broker() -> anyhow::Result<ServerHandle> {
    skein::init_tracing();
    ServerHandle::start("127.0.0.1:0", BrokerConfig::default()).await
}

pub async fn connect(server: &ServerHandle) -> anyhow::Result<Connection> {
    connect_with(server, ConnectOptions::default()).await
}

pub async fn connect_with(
    server: &ServerHandle,
    opts: ConnectOptions,
) -> anyhow::Result<Connection> {
    Ok(Connection::connect(server.addr(), opts).await?)
}

/// Random subject so tests sharing a broker never see each other's traffic.
pub fn subject() -> String {
    format!("test.{}", fastrand::u64(..))
}

/// Fails the test instead of hanging it.
pub async fn within<F: Future>(fut: F) -> anyhow::Result<F::Output> {
    tokio::time::timeout(WAIT, fut)
        .await
        .map_err(|_| anyhow::anyhow!("timed out after {WAIT:?}"))
}
