use std::{
    any::Any,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use skein_protocol::v1::{ClientOp, Headers, ServerOp, frame::ClientCodec};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, oneshot},
};
use tokio_util::codec::Framed;

use crate::{
    connection::{Shared, WeakEngineHandle},
    drain::DrainCoordinator,
    error::{ClientError, Result},
    flush::{FlushQueue, FlushWaiter},
    message::Message,
    registry::{Delivery, Registry, SubShared, SubState},
    state::{CloseReason, ConnectionStatus, SubscriptionStatus},
};

/// Commands queued by handles before the engine writes the next flush.
const WRITE_BATCH: usize = 256;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Everything a handle can ask of the engine. The channel is the single
/// ordered outbound queue: frames hit the wire in the order commands were
/// sent.
pub(crate) enum Command {
    Publish {
        subject: String,
        reply: Option<String>,
        headers: Option<Headers>,
        payload: Bytes,
    },
    Subscribe {
        shared: Arc<SubShared>,
        max: Option<u64>,
        delivery: Delivery,
    },
    Unsubscribe {
        sid: u64,
        max: Option<u64>,
    },
    Flush {
        reply: oneshot::Sender<Result<()>>,
    },
    DrainSubscription {
        sid: u64,
        reply: oneshot::Sender<Result<()>>,
    },
    Drain {
        reply: oneshot::Sender<Result<()>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// The connection's single task: owns the stream, the registry, the flush
/// queue and the drain bookkeeping. Nothing here is shared, so nothing is
/// locked.
pub(crate) struct Engine<T> {
    framed: Framed<T, ClientCodec>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    responder: WeakEngineHandle,
    shared: Arc<Shared>,
    registry: Registry,
    flushes: FlushQueue,
    drains: DrainCoordinator,
    close_waiters: Vec<oneshot::Sender<()>>,
    dirty: bool,
}

impl<T> Engine<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub(crate) fn new(
        framed: Framed<T, ClientCodec>,
        cmd_rx: mpsc::UnboundedReceiver<Command>,
        responder: WeakEngineHandle,
        shared: Arc<Shared>,
    ) -> Self {
        Engine {
            framed,
            cmd_rx,
            responder,
            shared,
            registry: Registry::default(),
            flushes: FlushQueue::default(),
            drains: DrainCoordinator::default(),
            close_waiters: Vec::new(),
            dirty: false,
        }
    }

    pub(crate) async fn run(mut self) {
        let reason = loop {
            let step = tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.on_command_batch(cmd).await,
                    // every handle is gone
                    None => Err(CloseReason::Closed),
                },
                frame = self.framed.next() => match frame {
                    Some(Ok(op)) => self.on_frame(op).await,
                    Some(Err(err)) => {
                        tracing::error!(error = %err, "protocol error, closing connection");
                        Err(CloseReason::Error(err.to_string()))
                    }
                    None => Err(CloseReason::Error("connection closed by server".into())),
                },
            };

            let step = match step {
                Ok(()) => self.flush_writes().await,
                Err(reason) => Err(reason),
            };
            if let Err(reason) = step {
                break reason;
            }
        };

        self.shutdown(reason).await;
    }

    async fn on_command_batch(&mut self, first: Command) -> Result<(), CloseReason> {
        self.on_command(first).await?;
        for _ in 0..WRITE_BATCH {
            match self.cmd_rx.try_recv() {
                Ok(cmd) => self.on_command(cmd).await?,
                Err(_) => break,
            }
        }
        Ok(())
    }

    async fn on_command(&mut self, cmd: Command) -> Result<(), CloseReason> {
        match cmd {
            Command::Publish {
                subject,
                reply,
                headers,
                payload,
            } => {
                let size = payload.len() + headers.as_ref().map_or(0, Headers::encoded_len);
                self.write(ClientOp::Publish {
                    subject,
                    reply,
                    headers,
                    payload,
                })
                .await?;
                self.shared.stats.record_out(size);
            }

            Command::Subscribe {
                shared,
                max,
                delivery,
            } => {
                // Accepted by the handle, but a drain or close got queued first.
                if self.shared.status.load() != ConnectionStatus::Connected {
                    tracing::debug!(sid = shared.sid, "subscribe raced with drain, rejecting");
                    shared.status.store(SubscriptionStatus::Closed);
                    return Ok(());
                }
                tracing::debug!(
                    sid = shared.sid,
                    subject = %shared.subject,
                    queue = ?shared.queue_group,
                    "subscription registered"
                );
                let ops = self.registry.register(SubState::new(shared, max, delivery));
                for op in ops {
                    self.write(op).await?;
                }
            }

            Command::Unsubscribe { sid, max } => self.unsubscribe(sid, max).await?,

            Command::Flush { reply } => {
                self.flushes.push(FlushWaiter::Caller(reply));
                self.write(ClientOp::Ping).await?;
            }

            Command::DrainSubscription { sid, reply } => {
                let Some(state) = self.registry.lookup(sid) else {
                    // closed by its limit or an unsubscribe queued before the drain
                    let _ = reply.send(Ok(()));
                    return Ok(());
                };
                state.shared.status.store(SubscriptionStatus::Draining);
                let needs_unsub = !std::mem::replace(&mut state.unsub_sent, true);
                self.drains.watch_subscription(sid, reply);

                // Already covered by a connection drain's UNSUB + PING otherwise.
                if needs_unsub {
                    tracing::debug!(sid, "draining subscription");
                    self.write(ClientOp::Unsubscribe { sid, max: None }).await?;
                    self.flushes.push(FlushWaiter::CloseSubscriptions(vec![sid]));
                    self.write(ClientOp::Ping).await?;
                }
            }

            Command::Drain { reply } => {
                tracing::info!(subscriptions = self.registry.len(), "draining connection");
                let mut waiting = Vec::with_capacity(self.registry.len());
                let mut to_unsub = Vec::new();
                for state in self.registry.iter_mut() {
                    let _ = state
                        .shared
                        .status
                        .transition(SubscriptionStatus::Open, SubscriptionStatus::Draining);
                    waiting.push(state.sid());
                    if !std::mem::replace(&mut state.unsub_sent, true) {
                        to_unsub.push(state.sid());
                    }
                }
                self.drains.begin_connection(waiting, reply);

                if !to_unsub.is_empty() {
                    for &sid in &to_unsub {
                        self.write(ClientOp::Unsubscribe { sid, max: None }).await?;
                    }
                    self.flushes.push(FlushWaiter::CloseSubscriptions(to_unsub));
                    self.write(ClientOp::Ping).await?;
                }
                self.maybe_final_flush().await?;
            }

            Command::Close { reply } => {
                self.close_waiters.push(reply);
                return Err(CloseReason::Closed);
            }
        }
        Ok(())
    }

    async fn unsubscribe(&mut self, sid: u64, max: Option<u64>) -> Result<(), CloseReason> {
        let limit_reached = match (self.registry.lookup(sid), max) {
            (None, _) => return Ok(()),
            (Some(state), Some(max)) => {
                state.max = Some(max);
                let reached = state.limit_reached();
                if state.unsub_sent && !reached {
                    // the drain's UNSUB already stopped routing
                    return Ok(());
                }
                reached
            }
            (Some(_), None) => true,
        };

        if limit_reached {
            if let Some((state, op)) = self.registry.unregister(sid) {
                let already_unsubscribed = state.unsub_sent;
                state.close();
                if !already_unsubscribed {
                    self.write(op).await?;
                }
            }
            self.drains.subscription_closed(sid);
            self.maybe_final_flush().await?;
        } else {
            self.write(ClientOp::Unsubscribe { sid, max }).await?;
        }
        Ok(())
    }

    async fn on_frame(&mut self, op: ServerOp) -> Result<(), CloseReason> {
        match op {
            ServerOp::Message {
                subject,
                sid,
                reply,
                headers,
                payload,
            } => {
                let size = payload.len() + headers.as_ref().map_or(0, Headers::encoded_len);
                self.shared.stats.record_in(size);
                let msg = Message {
                    subject,
                    reply,
                    headers,
                    payload,
                    responder: Some(self.responder.clone()),
                };
                self.dispatch(sid, msg).await?;
            }

            ServerOp::Ping => self.write(ClientOp::Pong).await?,

            ServerOp::Pong => match self.flushes.pop_oldest() {
                Some(pending) => {
                    tracing::trace!(token = pending.token, "flush acknowledged");
                    match pending.waiter {
                        FlushWaiter::Caller(reply) => {
                            let _ = reply.send(Ok(()));
                        }
                        FlushWaiter::CloseSubscriptions(sids) => {
                            for sid in sids {
                                self.close_subscription(sid);
                            }
                            self.maybe_final_flush().await?;
                        }
                        FlushWaiter::FinalDrain => return Err(CloseReason::Drained),
                    }
                }
                None => tracing::warn!("PONG without a pending PING"),
            },

            ServerOp::Info(info) => {
                tracing::debug!(server_id = %info.server_id, "server info updated");
                self.shared.info.send_replace(*info);
            }

            ServerOp::Ok => tracing::trace!("+OK"),

            ServerOp::Err(text) => {
                tracing::error!(error = %text, "server reported an error");
                return Err(CloseReason::Error(format!("server error: {text}")));
            }
        }
        Ok(())
    }

    /// Hands one message to its subscription, in arrival order.
    async fn dispatch(&mut self, sid: u64, msg: Message) -> Result<(), CloseReason> {
        let Some(state) = self.registry.lookup(sid) else {
            // in flight while we unsubscribed
            tracing::trace!(sid, subject = %msg.subject, "dropping message for unknown subscription");
            return Ok(());
        };
        if state.status() == SubscriptionStatus::Closed {
            tracing::trace!(sid, "dropping message for closed subscription");
            return Ok(());
        }

        let delivery = &mut state.delivery;
        let consumer_alive = match catch_unwind(AssertUnwindSafe(|| delivery.deliver(msg))) {
            Ok(alive) => alive,
            Err(panic) => {
                let text = panic_text(panic.as_ref());
                tracing::error!(sid, panic = %text, "subscription callback panicked");
                return Err(CloseReason::Error(format!(
                    "callback for subscription {sid} panicked: {text}"
                )));
            }
        };
        state.record_delivery();
        let limit_reached = state.limit_reached();

        if !consumer_alive {
            tracing::debug!(sid, "subscriber dropped, unsubscribing");
            if let Some((state, op)) = self.registry.unregister(sid) {
                let already_unsubscribed = state.unsub_sent;
                state.close();
                if !already_unsubscribed {
                    self.write(op).await?;
                }
            }
            self.drains.subscription_closed(sid);
            self.maybe_final_flush().await?;
        } else if limit_reached {
            // The broker stopped routing on its own after UNSUB <sid> <max>.
            tracing::debug!(sid, "subscription reached its delivery limit");
            self.close_subscription(sid);
            self.maybe_final_flush().await?;
        }
        Ok(())
    }

    fn close_subscription(&mut self, sid: u64) {
        if let Some(state) = self.registry.remove(sid) {
            tracing::debug!(sid, delivered = state.delivered, "subscription closed");
            state.close();
        }
        self.drains.subscription_closed(sid);
    }

    async fn maybe_final_flush(&mut self) -> Result<(), CloseReason> {
        if self.drains.take_final_flush() {
            tracing::debug!("all subscriptions drained, flushing");
            self.flushes.push(FlushWaiter::FinalDrain);
            self.write(ClientOp::Ping).await?;
        }
        Ok(())
    }

    async fn write(&mut self, op: ClientOp) -> Result<(), CloseReason> {
        tracing::trace!(op = %op.op(), "write");
        self.framed.feed(op).await.map_err(|err| {
            tracing::error!(error = %err, "write failed");
            CloseReason::Error(err.to_string())
        })?;
        self.dirty = true;
        Ok(())
    }

    async fn flush_writes(&mut self) -> Result<(), CloseReason> {
        if !std::mem::take(&mut self.dirty) {
            return Ok(());
        }
        self.framed.flush().await.map_err(|err| {
            tracing::error!(error = %err, "flush failed");
            CloseReason::Error(err.to_string())
        })
    }

    async fn shutdown(mut self, reason: CloseReason) {
        self.shared.status.store(ConnectionStatus::Closed);

        if reason != CloseReason::Drained {
            tracing::debug!(pending_flushes = self.flushes.len(), "failing outstanding requests");
            self.flushes.fail_all();
            self.drains.fail_all();
        }
        for state in self.registry.take_all() {
            state.close();
        }

        // Stop intake, then answer whatever was queued before the gate closed.
        self.cmd_rx.close();
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            reject(cmd, &mut self.close_waiters);
        }

        let transport = async {
            let _ = self.framed.flush().await;
            let _ = self.framed.get_mut().shutdown().await;
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, transport).await.is_err() {
            tracing::warn!("transport did not shut down in time");
        }

        if reason == CloseReason::Drained {
            self.drains.complete_connection();
            self.flushes.fail_all();
            self.drains.fail_all();
        }

        match &reason {
            CloseReason::Error(err) => tracing::warn!(error = %err, "connection closed"),
            other => tracing::info!(reason = ?other, "connection closed"),
        }
        self.shared.closed.send_replace(Some(reason));

        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}

fn panic_text(panic: &(dyn Any + Send)) -> &str {
    if let Some(text) = panic.downcast_ref::<&str>() {
        text
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text
    } else {
        "non-string panic payload"
    }
}

fn reject(cmd: Command, close_waiters: &mut Vec<oneshot::Sender<()>>) {
    match cmd {
        Command::Flush { reply } | Command::DrainSubscription { reply, .. } | Command::Drain { reply } => {
            let _ = reply.send(Err(ClientError::ConnectionClosed));
        }
        Command::Subscribe { shared, .. } => shared.status.store(SubscriptionStatus::Closed),
        Command::Close { reply } => close_waiters.push(reply),
        Command::Publish { .. } | Command::Unsubscribe { .. } => {}
    }
}
