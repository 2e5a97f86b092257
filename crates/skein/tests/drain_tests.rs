mod common;

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use common::*;
use skein::{CloseReason, Completion, ErrorKind, SubscribeOptions};
use tokio::sync::oneshot;

const COUNT: u64 = 10_000;

/// Hands a completion started inside a callback to the test body.
fn relay(done: Completion, tx: oneshot::Sender<skein::Result<()>>) {
    tokio::spawn(async move {
        let _ = tx.send(done.await);
    });
}

#[tokio::test]
async fn connection_drains_when_no_subs() -> anyhow::Result<()> {
    let server = start_broker().await?;
    let nc = connect(&server).await?;
    within(nc.drain()).await??;
    assert!(nc.is_closed());
    nc.close().await;
    assert_eq!(nc.closed().await, CloseReason::Drained);
    server.shutdown().await
}

#[tokio::test]
async fn connection_drain_conserves_deliveries() -> anyhow::Result<()> {
    let server = start_broker().await?;
    let subj = subject();
    let queue = SubscribeOptions::default().with_queue_group("q1");

    let nc1 = connect(&server).await?;
    let c1 = Arc::new(AtomicU64::new(0));
    let (drained_tx, drained_rx) = oneshot::channel();
    {
        let nc1_inner = nc1.clone();
        let c1 = c1.clone();
        let mut drained_tx = Some(drained_tx);
        nc1.subscribe_with(&subj, queue.clone(), move |_| {
            if c1.fetch_add(1, Ordering::SeqCst) == 0
                && let Some(tx) = drained_tx.take()
            {
                relay(nc1_inner.drain(), tx);
            }
        })?;
    }

    let nc2 = connect(&server).await?;
    let c2 = Arc::new(AtomicU64::new(0));
    {
        let c2 = c2.clone();
        nc2.subscribe_with(&subj, queue, move |_| {
            c2.fetch_add(1, Ordering::SeqCst);
        })?;
    }

    nc1.flush().await?;
    nc2.flush().await?;

    for i in 0..COUNT {
        nc2.publish(&subj, "")?;
        if i % 1000 == 0 {
            nc2.flush().await?;
        }
    }
    nc2.flush().await?;
    within(drained_rx).await???;

    assert!(nc1.is_closed());
    assert_eq!(c1.load(Ordering::SeqCst) + c2.load(Ordering::SeqCst), COUNT);
    assert!(c1.load(Ordering::SeqCst) >= 1, "s1 got no message");
    assert!(c2.load(Ordering::SeqCst) >= 1, "s2 got no message");
    nc2.close().await;
    server.shutdown().await
}

#[tokio::test]
async fn subscription_drain_conserves_deliveries() -> anyhow::Result<()> {
    let server = start_broker().await?;
    let nc = connect(&server).await?;
    let subj = subject();
    let queue = SubscribeOptions::default().with_queue_group("q1");

    // Handle for the callback, which only exists once subscribe returns.
    let (handle_tx, handle_rx) = std::sync::mpsc::channel::<skein::Subscription>();
    let (drained_tx, drained_rx) = oneshot::channel();
    let c1 = Arc::new(AtomicU64::new(0));
    let s1 = {
        let c1 = c1.clone();
        let mut drained_tx = Some(drained_tx);
        let mut me: Option<skein::Subscription> = None;
        nc.subscribe_with(&subj, queue.clone(), move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
            if me.is_none() {
                me = handle_rx.try_recv().ok();
            }
            if let Some(sub) = me.as_ref().filter(|s| !s.is_draining() && !s.is_closed())
                && let Some(tx) = drained_tx.take()
            {
                relay(sub.drain(), tx);
            }
        })?
    };
    handle_tx.send(s1.clone())?;

    let c2 = Arc::new(AtomicU64::new(0));
    {
        let c2 = c2.clone();
        nc.subscribe_with(&subj, queue, move |_| {
            c2.fetch_add(1, Ordering::SeqCst);
        })?;
    }

    for i in 0..COUNT {
        nc.publish(&subj, "")?;
        if i % 1000 == 0 {
            nc.flush().await?;
        }
    }
    nc.flush().await?;
    within(drained_rx).await???;

    assert_eq!(c1.load(Ordering::SeqCst) + c2.load(Ordering::SeqCst), COUNT);
    assert!(c1.load(Ordering::SeqCst) >= 1, "s1 got no message");
    assert!(c2.load(Ordering::SeqCst) >= 1, "s2 got no message");
    assert!(s1.is_closed());
    nc.close().await;
    server.shutdown().await
}

#[tokio::test]
async fn publisher_drain_flushes_pending_publishes() -> anyhow::Result<()> {
    let server = start_broker().await?;
    let subj = subject();
    let queue = SubscribeOptions::default().with_queue_group("q1");

    let nc1 = connect(&server).await?;
    let c1 = Arc::new(AtomicU64::new(0));
    let (drained_tx, drained_rx) = oneshot::channel();
    {
        let nc1_inner = nc1.clone();
        let c1 = c1.clone();
        let target = subj.clone();
        let mut drained_tx = Some(drained_tx);
        nc1.subscribe_with(&subj, queue.clone(), move |_| {
            if c1.fetch_add(1, Ordering::SeqCst) == 0
                && let Some(tx) = drained_tx.take()
            {
                let done = nc1_inner.drain();
                for _ in 0..100 {
                    // still allowed while draining
                    let _ = nc1_inner.publish(&target, "");
                }
                relay(done, tx);
            }
        })?;
    }

    let nc2 = connect(&server).await?;
    let c2 = Arc::new(AtomicU64::new(0));
    {
        let c2 = c2.clone();
        nc2.subscribe_with(&subj, queue, move |_| {
            c2.fetch_add(1, Ordering::SeqCst);
        })?;
    }
    nc1.flush().await?;
    nc2.flush().await?;

    for i in 0..COUNT {
        nc2.publish(&subj, "")?;
        if i % 1000 == 0 {
            nc2.flush().await?;
        }
    }
    nc2.flush().await?;
    within(drained_rx).await???;
    // nc1's publishes were routed before its drain finished
    nc2.flush().await?;

    assert_eq!(
        c1.load(Ordering::SeqCst) + c2.load(Ordering::SeqCst),
        COUNT + 100
    );
    assert!(c1.load(Ordering::SeqCst) >= 1, "s1 got no message");
    assert!(c2.load(Ordering::SeqCst) >= 1, "s2 got no message");
    nc2.close().await;
    server.shutdown().await
}

#[tokio::test]
async fn publish_after_drain_fails() -> anyhow::Result<()> {
    let server = start_broker().await?;
    let nc = connect(&server).await?;
    let subj = subject();
    nc.subscribe_with(&subj, SubscribeOptions::default(), |_| {})?;
    within(nc.drain()).await??;

    let err = nc.publish(&subj, "").expect_err("drained");
    assert!(
        matches!(err.kind(), ErrorKind::ConnectionClosed | ErrorKind::ConnectionDraining),
        "unexpected {err:?}"
    );
    server.shutdown().await
}

#[tokio::test]
async fn request_rejected_during_connection_drain() -> anyhow::Result<()> {
    let server = start_broker().await?;
    let subj = subject();

    let nc1 = connect(&server).await?;
    nc1.subscribe_with(&subj, SubscribeOptions::default(), |msg| {
        if msg.reply.is_some() {
            let _ = msg.respond("ok");
        }
    })?;
    nc1.flush().await?;

    let nc2 = connect(&server).await?;
    let (request_tx, request_rx) = oneshot::channel();
    let (drained_tx, drained_rx) = oneshot::channel();
    {
        let nc2_inner = nc2.clone();
        let target = format!("{subj}a");
        let mut pending = Some((request_tx, drained_tx));
        nc2.subscribe_with(&subj, SubscribeOptions::default(), move |_| {
            let Some((request_tx, drained_tx)) = pending.take() else {
                return;
            };
            relay(nc2_inner.drain(), drained_tx);
            let nc = nc2_inner.clone();
            let target = target.clone();
            tokio::spawn(async move {
                let _ = request_tx.send(nc.request(&target, "1").await);
            });
        })?;
    }

    nc2.publish(&subj, "here")?;
    nc2.flush().await?;

    let err = within(request_rx).await??.expect_err("request while draining");
    assert_eq!(err.kind(), ErrorKind::ConnectionDraining);
    within(drained_rx).await???;
    nc1.close().await;
    server.shutdown().await
}

#[tokio::test]
async fn reject_drain_on_closed() -> anyhow::Result<()> {
    let server = start_broker().await?;
    let nc = connect(&server).await?;
    nc.close().await;
    let err = nc.drain().await.expect_err("closed");
    assert_eq!(err.kind(), ErrorKind::ConnectionClosed);
    server.shutdown().await
}

#[tokio::test]
async fn reject_drain_on_draining() -> anyhow::Result<()> {
    let server = start_broker().await?;
    let nc = connect(&server).await?;
    let done = nc.drain();
    let err = nc.drain().await.expect_err("draining");
    within(done).await??;
    assert_eq!(err.kind(), ErrorKind::ConnectionDraining);
    server.shutdown().await
}

#[tokio::test]
async fn reject_subscribe_on_draining() -> anyhow::Result<()> {
    let server = start_broker().await?;
    let nc = connect(&server).await?;
    let done = nc.drain();
    let err = nc
        .subscribe_with("foo", SubscribeOptions::default(), |_| {})
        .expect_err("draining");
    assert_eq!(err.kind(), ErrorKind::ConnectionDraining);
    within(done).await??;
    server.shutdown().await
}

#[tokio::test]
async fn reject_subscription_drain_on_closed_sub() -> anyhow::Result<()> {
    let server = start_broker().await?;
    let nc = connect(&server).await?;
    let sub = nc.subscribe_with("foo", SubscribeOptions::default(), |_| {})?;
    within(sub.drain()).await??;
    let err = sub.drain().await.expect_err("closed sub");
    nc.close().await;
    assert_eq!(err.kind(), ErrorKind::SubClosed);
    server.shutdown().await
}

#[tokio::test]
async fn connection_is_closed_after_drain() -> anyhow::Result<()> {
    let server = start_broker().await?;
    let nc = connect(&server).await?;
    let sub = nc.subscribe_with("foo", SubscribeOptions::default(), |_| {})?;
    within(nc.drain()).await??;
    assert!(nc.is_closed());
    assert!(sub.is_closed());
    server.shutdown().await
}

#[tokio::test]
async fn reject_subscription_drain_on_closed_connection() -> anyhow::Result<()> {
    let server = start_broker().await?;
    let nc = connect(&server).await?;
    let sub = nc.subscribe_with("foo", SubscribeOptions::default(), |_| {})?;
    nc.close().await;
    let err = sub.drain().await.expect_err("connection closed");
    assert_eq!(err.kind(), ErrorKind::ConnectionClosed);
    server.shutdown().await
}

#[tokio::test]
async fn reject_subscription_drain_on_draining_sub() -> anyhow::Result<()> {
    let server = start_broker().await?;
    let nc = connect(&server).await?;
    let subj = subject();
    let mut sub = nc.subscribe(&subj, SubscribeOptions::default())?;
    nc.publish(&subj, "")?;
    nc.flush().await?;

    within(sub.next()).await?.ok_or_else(|| anyhow::anyhow!("no message"))?;
    let first = sub.drain();
    let err = sub.drain().await.expect_err("draining sub");
    assert_eq!(err.kind(), ErrorKind::SubDraining);
    within(first).await??;
    assert!(sub.is_closed());
    nc.close().await;
    server.shutdown().await
}

#[tokio::test]
async fn close_fails_an_in_flight_drain() -> anyhow::Result<()> {
    let server = start_broker().await?;
    let nc = connect(&server).await?;
    let subj = subject();
    let _sub = nc.subscribe(&subj, SubscribeOptions::default())?;
    nc.flush().await?;

    let done = nc.drain();
    nc.close().await;
    match within(done).await? {
        // the drain may win the race on a fast loopback
        Ok(()) => assert_eq!(nc.closed().await, CloseReason::Drained),
        Err(err) => assert_eq!(err.kind(), ErrorKind::ConnectionClosed),
    }
    assert!(nc.is_closed());
    server.shutdown().await
}
