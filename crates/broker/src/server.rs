use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use skein_protocol::v1::{ClientOp, ProtocolError, ServerOp, frame::ServerCodec};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, Interval},
};
use tokio_util::codec::Framed;

use crate::{Broker, BrokerConfig, BrokerError, ClientId};

pub async fn run_server(addr: &str, broker: Arc<Broker>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(addr = %listener.local_addr()?, "listening");
    serve(listener, broker).await
}

/// Accepts until the broker is shut down.
pub async fn serve(listener: TcpListener, broker: Arc<Broker>) -> anyhow::Result<()> {
    let shutdown = broker.shutdown_token();
    loop {
        let (socket, peer) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted?,
        };
        if let Err(e) = socket.set_nodelay(true) {
            tracing::debug!(%peer, error = %e, "set_nodelay failed");
        }
        let broker = broker.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, broker).await {
                tracing::warn!(%peer, error = ?e, "connection error");
            }
        });
    }
}

/// A broker listening on its own task.
#[derive(Debug)]
pub struct ServerHandle {
    addr: SocketAddr,
    broker: Arc<Broker>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl ServerHandle {
    /// Binds `addr` (port 0 picks a free one) and starts accepting.
    pub async fn start(addr: &str, config: BrokerConfig) -> anyhow::Result<ServerHandle> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding {addr}"))?;
        let addr = listener.local_addr()?;
        let broker = Arc::new(Broker::new(config));
        let task = tokio::spawn(serve(listener, broker.clone()));
        tracing::debug!(%addr, "broker started");
        Ok(ServerHandle { addr, broker, task })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.broker.shutdown();
        self.task.await?
    }
}

pub async fn handle_connection<T>(socket: T, broker: Arc<Broker>) -> anyhow::Result<()>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    // ---- Framed socket -----------------------------------------------------
    let framed = Framed::new(socket, ServerCodec::new(broker.config().max_payload));
    let (mut writer, mut reader) = framed.split();

    // ---- Write fan-in channel ---------------------------------------------
    // Unbounded: routing happens on other connections' reader tasks and must
    // never wait on this socket.
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerOp>();

    // ---- Writer task -------------------------------------------------------
    let writer_task = tokio::spawn(async move {
        'outer: while let Some(op) = rx.recv().await {
            if writer.feed(op).await.is_err() {
                break;
            }
            while let Ok(op) = rx.try_recv() {
                if writer.feed(op).await.is_err() {
                    break 'outer;
                }
            }
            if writer.flush().await.is_err() {
                break;
            }
        }
        let _ = writer.close().await;
    });

    // ---- INFO / CONNECT ----------------------------------------------------
    let id = broker.allocate_client_id();
    let _ = tx.send(ServerOp::Info(Box::new(broker.info_for(id))));

    let connect = match reader.next().await {
        Some(Ok(ClientOp::Connect(connect))) => connect,
        Some(Ok(other)) => {
            tracing::debug!(client = id, op = %other.op(), "expected CONNECT");
            let _ = tx.send(ServerOp::Err("expected CONNECT".into()));
            return finish(tx, writer_task).await;
        }
        Some(Err(err)) => {
            let _ = tx.send(ServerOp::Err(err_text(&err)));
            finish(tx, writer_task).await?;
            return Err(err).context("reading CONNECT");
        }
        None => return finish(tx, writer_task).await,
    };

    broker.register_client(id, tx.clone(), connect.echo);
    tracing::info!(client = id, name = ?connect.name, "client connected");

    // ---- Main reader loop --------------------------------------------------
    let mut conn = ConnState {
        id,
        verbose: connect.verbose,
        pings_outstanding: 0,
        tx: tx.clone(),
    };
    let shutdown = broker.shutdown_token();
    let mut ticker = broker.config().ping_interval.map(ping_ticker);
    let max_pings = broker.config().max_pings_outstanding;

    let result = loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            _ = tick(&mut ticker) => {
                if conn.pings_outstanding >= max_pings {
                    tracing::info!(client = id, "stale connection");
                    conn.send(ServerOp::Err("Stale Connection".into()));
                    break Ok(());
                }
                conn.pings_outstanding += 1;
                conn.send(ServerOp::Ping);
                continue;
            }
            next = reader.next() => next,
        };

        match next {
            None => break Ok(()),
            Some(Err(err)) => {
                tracing::warn!(client = id, error = %err, "protocol violation");
                conn.send(ServerOp::Err(err_text(&err)));
                break Err(anyhow::Error::from(err));
            }
            Some(Ok(op)) => conn.on_op(&broker, op),
        }
    };

    // ---- Connection closing ------------------------------------------------
    broker.disconnect(id);
    drop(conn);
    finish(tx, writer_task).await?;
    tracing::info!(client = id, "client disconnected");
    result
}

struct ConnState {
    id: ClientId,
    verbose: bool,
    pings_outstanding: u32,
    tx: mpsc::UnboundedSender<ServerOp>,
}

impl ConnState {
    fn send(&self, op: ServerOp) {
        let _ = self.tx.send(op);
    }

    fn on_op(&mut self, broker: &Broker, op: ClientOp) {
        let outcome = match op {
            ClientOp::Publish {
                subject,
                reply,
                headers,
                payload,
            } => broker
                .publish(self.id, &subject, reply.as_deref(), headers.as_ref(), &payload)
                .map(|_| ()),
            ClientOp::Subscribe {
                subject,
                queue_group,
                sid,
            } => broker.subscribe(self.id, sid, &subject, queue_group.as_deref()),
            ClientOp::Unsubscribe { sid, max } => {
                broker.unsubscribe(self.id, sid, max);
                Ok(())
            }
            ClientOp::Ping => {
                self.send(ServerOp::Pong);
                return;
            }
            ClientOp::Pong => {
                self.pings_outstanding = 0;
                return;
            }
            ClientOp::Connect(_) => {
                tracing::debug!(client = self.id, "ignoring repeated CONNECT");
                Ok(())
            }
        };

        match outcome {
            Ok(()) if self.verbose => self.send(ServerOp::Ok),
            Ok(()) => {}
            Err(err) => {
                tracing::debug!(client = self.id, error = %err, "rejected");
                self.send(ServerOp::Err(rejection_text(&err)));
            }
        }
    }
}

async fn finish(
    tx: mpsc::UnboundedSender<ServerOp>,
    writer_task: JoinHandle<()>,
) -> anyhow::Result<()> {
    drop(tx);
    writer_task.await.context("writer task")
}

fn ping_ticker(period: Duration) -> Interval {
    tokio::time::interval_at(Instant::now() + period, period)
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn err_text(err: &ProtocolError) -> String {
    match err {
        ProtocolError::PayloadTooLarge { .. } => "Maximum Payload Violation".into(),
        ProtocolError::UnknownOperation(_) => "Unknown Protocol Operation".into(),
        other => format!("Protocol Error: {other}"),
    }
}

fn rejection_text(err: &BrokerError) -> String {
    match err {
        BrokerError::InvalidSubject(_) => "Invalid Subject".into(),
        BrokerError::InvalidPublishSubject(_) => "Invalid Publish Subject".into(),
        other => other.to_string(),
    }
}
