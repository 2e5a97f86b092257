use std::{ops::Deref, sync::Arc, sync::atomic::Ordering};

use futures::Stream;
use tokio::sync::mpsc;

use crate::{
    completion::Completion,
    connection::EngineHandle,
    engine::Command,
    error::{ClientError, Result},
    message::Message,
    registry::SubShared,
    state::{ConnectionStatus, SubscriptionStatus},
};

/// Handle to one subscription. Clones refer to the same subscription.
#[derive(Clone, Debug)]
pub struct Subscription {
    shared: Arc<SubShared>,
    engine: EngineHandle,
}

impl Subscription {
    pub(crate) fn new(shared: Arc<SubShared>, engine: EngineHandle) -> Self {
        Subscription { shared, engine }
    }

    pub fn sid(&self) -> u64 {
        self.shared.sid
    }

    pub fn subject(&self) -> &str {
        &self.shared.subject
    }

    pub fn queue_group(&self) -> Option<&str> {
        self.shared.queue_group.as_deref()
    }

    /// Messages delivered so far.
    pub fn received(&self) -> u64 {
        self.shared.received.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.shared.status.load()
    }

    pub fn is_draining(&self) -> bool {
        self.status() == SubscriptionStatus::Draining
    }

    pub fn is_closed(&self) -> bool {
        self.status() == SubscriptionStatus::Closed
    }

    /// Stops interest, delivers whatever the server already routed, then
    /// closes. Resolves after the last message has been handed over.
    pub fn drain(&self) -> Completion {
        if self.engine.shared.status.load() == ConnectionStatus::Closed {
            return Completion::failed(ClientError::ConnectionClosed);
        }
        if let Err(err) = self.shared.status.begin_drain() {
            return Completion::failed(err);
        }
        self.engine.completion(|reply| Command::DrainSubscription {
            sid: self.shared.sid,
            reply,
        })
    }

    /// `None` unsubscribes now. `Some(n)` lets the subscription run until it
    /// has received `n` messages in total.
    pub fn unsubscribe(&self, max: Option<u64>) -> Result<()> {
        self.engine.shared.status.ensure_open()?;
        if self.is_closed() {
            return Ok(());
        }
        self.engine.send(Command::Unsubscribe {
            sid: self.shared.sid,
            max,
        })
    }
}

/// A subscription whose messages are read from a channel.
#[derive(Debug)]
pub struct Subscriber {
    sub: Subscription,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Subscriber {
    pub(crate) fn new(sub: Subscription, rx: mpsc::UnboundedReceiver<Message>) -> Self {
        Subscriber { sub, rx }
    }

    /// Next message, or `None` once the subscription is closed and every
    /// delivered message has been read.
    pub async fn next(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    pub fn subscription(&self) -> &Subscription {
        &self.sub
    }

    pub fn into_stream(self) -> impl Stream<Item = Message> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|msg| (msg, sub))
        })
    }
}

impl Deref for Subscriber {
    type Target = Subscription;

    fn deref(&self) -> &Subscription {
        &self.sub
    }
}
