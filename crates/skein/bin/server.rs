use std::{sync::Arc, time::Duration};

use clap::Parser;
use skein::broker::{Broker, BrokerConfig, run_server};
use skein_util::init_tracing;

/// Loopback skein broker.
#[derive(Parser, Debug)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:4222")]
    listen: String,

    #[arg(long, default_value = "skein")]
    server_name: String,

    /// Largest accepted payload in bytes (headers included)
    #[arg(long, default_value = "1048576")]
    max_payload: usize,

    /// Seconds between server PINGs; 0 disables them
    #[arg(long, default_value = "0")]
    ping_interval_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = BrokerConfig::default()
        .with_server_name(args.server_name)
        .with_max_payload(args.max_payload);
    if args.ping_interval_secs > 0 {
        config = config.with_ping_interval(Duration::from_secs(args.ping_interval_secs));
    }

    let broker = Arc::new(Broker::new(config));
    let shutdown = broker.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutting down");
            shutdown.shutdown();
        }
    });

    run_server(&args.listen, broker).await
}
