use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use clap::Parser;
use skein::{
    ConnectOptions, Connection, SubscribeOptions,
    broker::{BrokerConfig, ServerHandle},
};
use skein_util::init_tracing;
use tokio::time::Instant;

/// Publish throughput through a broker. There is no flow control, so the
/// publisher flushes every `flush_every` messages to bound buffering.
#[derive(Parser, Debug)]
struct Args {
    /// Broker to use; starts a loopback broker when omitted
    #[arg(long)]
    server: Option<String>,

    /// Number of messages to publish
    #[arg(long, default_value = "1000000")]
    messages: u64,

    /// Maximum payload size (randomized 0..max)
    #[arg(long, default_value = "256")]
    max_payload: usize,

    /// Flush after this many publishes
    #[arg(long, default_value = "1000")]
    flush_every: u64,

    /// Also subscribe and count deliveries
    #[arg(long, default_value = "false")]
    subscribe: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let local = match &args.server {
        Some(_) => None,
        None => Some(ServerHandle::start("127.0.0.1:0", BrokerConfig::default()).await?),
    };
    let addr = match (&args.server, &local) {
        (Some(addr), _) => addr.clone(),
        (None, Some(server)) => server.addr().to_string(),
        (None, None) => anyhow::bail!("no broker"),
    };

    let subject = format!("bench.{}", skein_util::unique_token());
    let received = Arc::new(AtomicU64::new(0));
    let consumer = if args.subscribe {
        let nc = Connection::connect(addr.as_str(), ConnectOptions::default()).await?;
        let counter = received.clone();
        nc.subscribe_with(&subject, SubscribeOptions::default(), move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        })?;
        nc.flush().await?;
        Some(nc)
    } else {
        None
    };

    let publisher = Connection::connect(addr.as_str(), ConnectOptions::default()).await?;
    tracing::info!(
        messages = args.messages,
        max_payload = args.max_payload,
        flush_every = args.flush_every,
        "publishing"
    );

    let start = Instant::now();
    for i in 1..=args.messages {
        let mut buf = vec![0u8; fastrand::usize(0..=args.max_payload)];
        fastrand::fill(&mut buf);
        publisher.publish(&subject, buf)?;
        if args.flush_every > 0 && i % args.flush_every == 0 {
            publisher.flush().await?;
        }
    }
    publisher.flush().await?;
    let elapsed = start.elapsed().as_secs_f64();

    let stats = publisher.stats();
    tracing::info!("Total time: {:.2} s", elapsed);
    tracing::info!(
        "Throughput: {:.2} messages/sec, {:.2} MiB/sec",
        stats.out_msgs as f64 / elapsed,
        stats.out_bytes as f64 / elapsed / (1024.0 * 1024.0)
    );

    if let Some(nc) = consumer {
        nc.drain().await?;
        tracing::info!(
            received = received.load(Ordering::Relaxed),
            "subscriber drained"
        );
    }
    publisher.drain().await?;
    if let Some(server) = local {
        server.shutdown().await?;
    }
    Ok(())
}
