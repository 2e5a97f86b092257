use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use skein_protocol::v1::{
    ClientOp, Headers, Info, ServerOp, frame::ClientCodec, is_valid_queue_group, is_valid_subject,
};
use skein_util::new_inbox;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpStream, ToSocketAddrs},
    sync::{mpsc, oneshot, watch},
};
use tokio_util::codec::Framed;

use crate::{
    completion::Completion,
    engine::{Command, Engine},
    error::{ClientError, Result},
    message::Message,
    options::{ConnectOptions, SubscribeOptions},
    registry::{Callback, Delivery, SubShared},
    state::{CloseReason, ConnectionStatus, StatusCell},
    stats::{Statistics, Stats},
    subscription::{Subscriber, Subscription},
};

/// State readable from any handle without a round trip to the engine.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) status: StatusCell<ConnectionStatus>,
    next_sid: AtomicU64,
    pub(crate) stats: Statistics,
    pub(crate) info: watch::Sender<Info>,
    pub(crate) closed: watch::Sender<Option<CloseReason>>,
    pub(crate) options: ConnectOptions,
}

impl Shared {
    fn new(info: Info, options: ConnectOptions) -> Self {
        Shared {
            status: StatusCell::new(ConnectionStatus::Connected),
            next_sid: AtomicU64::new(1),
            stats: Statistics::default(),
            info: watch::Sender::new(info),
            closed: watch::Sender::new(None),
            options,
        }
    }

    fn allocate_sid(&self) -> u64 {
        self.next_sid.fetch_add(1, Ordering::Relaxed)
    }
}

/// Sending side of the engine's command queue.
#[derive(Clone, Debug)]
pub(crate) struct EngineHandle {
    tx: mpsc::UnboundedSender<Command>,
    pub(crate) shared: Arc<Shared>,
}

impl EngineHandle {
    pub(crate) fn send(&self, cmd: Command) -> Result<()> {
        self.tx.send(cmd).map_err(|_| ClientError::ConnectionClosed)
    }

    pub(crate) fn downgrade(&self) -> WeakEngineHandle {
        WeakEngineHandle {
            tx: self.tx.downgrade(),
            shared: self.shared.clone(),
        }
    }

    pub(crate) fn publish(
        &self,
        subject: &str,
        reply: Option<&str>,
        headers: Option<Headers>,
        payload: Bytes,
    ) -> Result<()> {
        self.shared.status.ensure_open()?;
        if !is_valid_subject(subject) {
            return Err(ClientError::BadSubject(subject.to_string()));
        }
        if let Some(reply) = reply.filter(|r| !is_valid_subject(r)) {
            return Err(ClientError::BadSubject(reply.to_string()));
        }
        if let Some(headers) = &headers {
            headers
                .validate()
                .map_err(|e| ClientError::BadHeaders(e.to_string()))?;
        }

        let size = payload.len() + headers.as_ref().map_or(0, Headers::encoded_len);
        let max = self.shared.info.borrow().max_payload;
        if size > max {
            return Err(ClientError::MaxPayloadExceeded { size, max });
        }

        self.send(Command::Publish {
            subject: subject.to_string(),
            reply: reply.map(str::to_string),
            headers,
            payload,
        })
    }

    /// Sends a request that the engine answers through a oneshot.
    pub(crate) fn completion(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<()>>) -> Command,
    ) -> Completion {
        let (tx, rx) = oneshot::channel();
        match self.send(make(tx)) {
            Ok(()) => Completion::waiting(rx),
            Err(err) => Completion::failed(err),
        }
    }
}

/// Held by delivered messages so that `respond` works without keeping the
/// engine alive.
#[derive(Clone, Debug)]
pub(crate) struct WeakEngineHandle {
    tx: mpsc::WeakUnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl WeakEngineHandle {
    pub(crate) fn upgrade(&self) -> Option<EngineHandle> {
        self.tx.upgrade().map(|tx| EngineHandle {
            tx,
            shared: self.shared.clone(),
        })
    }
}

/// A client connection. Cheap to clone; every clone drives the same engine.
/// The engine stops once `close()` or `drain()` completes, or when the last
/// clone and every subscription handle are dropped.
#[derive(Clone, Debug)]
pub struct Connection {
    engine: EngineHandle,
}

impl Connection {
    pub async fn connect(addr: impl ToSocketAddrs, opts: ConnectOptions) -> Result<Connection> {
        let stream = tokio::time::timeout(opts.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::Timeout)??;
        stream.set_nodelay(true)?;
        Self::from_stream(stream, opts).await
    }

    /// Runs the handshake over an already established stream and starts the
    /// engine on it.
    pub async fn from_stream<T>(stream: T, opts: ConnectOptions) -> Result<Connection>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut framed = Framed::new(stream, ClientCodec::new());
        let info = tokio::time::timeout(opts.connect_timeout, handshake(&mut framed, &opts))
            .await
            .map_err(|_| ClientError::Timeout)??;

        tracing::info!(
            server_id = %info.server_id,
            server_name = %info.server_name,
            max_payload = info.max_payload,
            "connected"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let engine = EngineHandle {
            tx,
            shared: Arc::new(Shared::new(info, opts)),
        };
        let task = Engine::new(framed, rx, engine.downgrade(), engine.shared.clone());
        tokio::spawn(task.run());

        Ok(Connection { engine })
    }

    pub fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> Result<()> {
        self.engine.publish(subject, None, None, payload.into())
    }

    pub fn publish_with_reply(
        &self,
        subject: &str,
        reply: &str,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        self.engine.publish(subject, Some(reply), None, payload.into())
    }

    pub fn publish_with_headers(
        &self,
        subject: &str,
        reply: Option<&str>,
        headers: Headers,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        if !self.engine.shared.info.borrow().headers {
            return Err(ClientError::BadHeaders("server does not support headers".into()));
        }
        self.engine.publish(subject, reply, Some(headers), payload.into())
    }

    /// Subscribes with messages delivered through the returned [`Subscriber`].
    pub fn subscribe(&self, subject: &str, opts: SubscribeOptions) -> Result<Subscriber> {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = self.register(subject, opts, Delivery::Channel(tx))?;
        Ok(Subscriber::new(sub, rx))
    }

    /// Subscribes with every message handed to `callback` on the engine task.
    /// The callback must not block; use `tokio::spawn` for anything that
    /// awaits, including draining or closing from inside it.
    pub fn subscribe_with<F>(
        &self,
        subject: &str,
        opts: SubscribeOptions,
        callback: F,
    ) -> Result<Subscription>
    where
        F: FnMut(Message) + Send + 'static,
    {
        let callback: Callback = Box::new(callback);
        self.register(subject, opts, Delivery::Callback(callback))
    }

    fn register(
        &self,
        subject: &str,
        opts: SubscribeOptions,
        delivery: Delivery,
    ) -> Result<Subscription> {
        self.engine.shared.status.ensure_accepting()?;
        if !is_valid_subject(subject) {
            return Err(ClientError::BadSubject(subject.to_string()));
        }
        if let Some(group) = opts.queue_group.as_deref().filter(|g| !is_valid_queue_group(g)) {
            return Err(ClientError::BadSubject(group.to_string()));
        }

        let sid = self.engine.shared.allocate_sid();
        let shared = Arc::new(SubShared::new(sid, subject.to_string(), opts.queue_group));
        self.engine.send(Command::Subscribe {
            shared: shared.clone(),
            max: opts.max,
            delivery,
        })?;
        Ok(Subscription::new(shared, self.engine.clone()))
    }

    /// Publishes to `subject` with a fresh inbox as the reply subject and
    /// waits for the first response.
    pub async fn request(&self, subject: &str, payload: impl Into<Bytes>) -> Result<Message> {
        let timeout = self.engine.shared.options.request_timeout;
        self.request_with_timeout(subject, payload, timeout).await
    }

    pub async fn request_with_timeout(
        &self,
        subject: &str,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Message> {
        self.engine.shared.status.ensure_accepting()?;
        if !is_valid_subject(subject) {
            return Err(ClientError::BadSubject(subject.to_string()));
        }

        let inbox = new_inbox(&self.engine.shared.options.inbox_prefix);
        let mut sub = self.subscribe(&inbox, SubscribeOptions::default().with_max(1))?;
        if let Err(err) = self.engine.publish(subject, Some(&inbox), None, payload.into()) {
            let _ = sub.unsubscribe(None);
            return Err(err);
        }

        match tokio::time::timeout(timeout, sub.next()).await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(match self.status() {
                ConnectionStatus::Draining => ClientError::ConnectionDraining,
                _ => ClientError::ConnectionClosed,
            }),
            Err(_) => {
                tracing::debug!(%subject, %inbox, "request timed out");
                let _ = sub.unsubscribe(None);
                Err(ClientError::Timeout)
            }
        }
    }

    /// Resolves once the server has processed everything written before it.
    pub fn flush(&self) -> Completion {
        if let Err(err) = self.engine.shared.status.ensure_open() {
            return Completion::failed(err);
        }
        self.engine.completion(|reply| Command::Flush { reply })
    }

    /// Unsubscribes everything, waits for in-flight messages to be delivered,
    /// flushes pending publishes and closes the connection.
    pub fn drain(&self) -> Completion {
        if let Err(err) = self.engine.shared.status.begin_drain() {
            return Completion::failed(err);
        }
        self.engine.completion(|reply| Command::Drain { reply })
    }

    /// Closes immediately. Outstanding flushes and drains fail with
    /// `ConnectionClosed`. Calling it again is a no-op.
    pub async fn close(&self) {
        self.engine.shared.status.store(ConnectionStatus::Closed);
        let (tx, rx) = oneshot::channel();
        if self.engine.send(Command::Close { reply: tx }).is_ok() {
            let _ = rx.await;
        } else {
            // engine already gone; wait for it to finish its shutdown
            self.closed().await;
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.engine.shared.status.load()
    }

    pub fn is_closed(&self) -> bool {
        self.status() == ConnectionStatus::Closed
    }

    pub fn is_draining(&self) -> bool {
        self.status() == ConnectionStatus::Draining
    }

    pub fn stats(&self) -> Stats {
        self.engine.shared.stats.snapshot()
    }

    /// The latest INFO the server sent.
    pub fn server_info(&self) -> Info {
        self.engine.shared.info.borrow().clone()
    }

    /// Waits for the engine to stop and reports why.
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.engine.shared.closed.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or(CloseReason::Closed),
            Err(_) => CloseReason::Closed,
        }
    }
}

/// INFO, then CONNECT and a PING whose PONG proves the server accepted us.
async fn handshake<T>(framed: &mut Framed<T, ClientCodec>, opts: &ConnectOptions) -> Result<Info>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut info = match next_op(framed).await? {
        ServerOp::Info(info) => *info,
        other => {
            return Err(ClientError::Protocol(format!(
                "expected INFO, got {}",
                other.op()
            )));
        }
    };
    tracing::debug!(server_id = %info.server_id, proto = info.proto, "received INFO");

    let mut connect = opts.to_connect();
    connect.headers &= info.headers;
    framed.feed(ClientOp::Connect(Box::new(connect))).await?;
    framed.send(ClientOp::Ping).await?;

    loop {
        match next_op(framed).await? {
            ServerOp::Pong => return Ok(info),
            ServerOp::Ok => {}
            ServerOp::Ping => framed.send(ClientOp::Pong).await?,
            ServerOp::Info(update) => info = *update,
            ServerOp::Err(text) => {
                tracing::warn!(error = %text, "server rejected CONNECT");
                return Err(ClientError::Protocol(format!("server error: {text}")));
            }
            ServerOp::Message { .. } => {
                return Err(ClientError::Protocol("MSG before handshake completed".into()));
            }
        }
    }
}

async fn next_op<T>(framed: &mut Framed<T, ClientCodec>) -> Result<ServerOp>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    match framed.next().await {
        Some(op) => Ok(op?),
        None => Err(ClientError::Io(std::io::ErrorKind::UnexpectedEof.into())),
    }
}
