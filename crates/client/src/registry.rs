use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use skein_protocol::v1::ClientOp;
use tokio::sync::mpsc;

use crate::{
    message::Message,
    state::{StatusCell, SubscriptionStatus},
};

/// Subscription state visible to both the engine and the application's
/// handles.
#[derive(Debug)]
pub(crate) struct SubShared {
    pub(crate) sid: u64,
    pub(crate) subject: String,
    pub(crate) queue_group: Option<String>,
    pub(crate) status: StatusCell<SubscriptionStatus>,
    pub(crate) received: AtomicU64,
}

impl SubShared {
    pub(crate) fn new(sid: u64, subject: String, queue_group: Option<String>) -> Self {
        SubShared {
            sid,
            subject,
            queue_group,
            status: StatusCell::new(SubscriptionStatus::Open),
            received: AtomicU64::new(0),
        }
    }
}

pub(crate) type Callback = Box<dyn FnMut(Message) + Send + 'static>;

pub(crate) enum Delivery {
    Callback(Callback),
    Channel(mpsc::UnboundedSender<Message>),
}

impl Delivery {
    /// Hands the message over. False when the receiving side is gone.
    pub(crate) fn deliver(&mut self, msg: Message) -> bool {
        match self {
            Delivery::Callback(cb) => {
                cb(msg);
                true
            }
            Delivery::Channel(tx) => tx.send(msg).is_ok(),
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Delivery::Callback(_) => f.write_str("Callback"),
            Delivery::Channel(_) => f.write_str("Channel"),
        }
    }
}

#[derive(Debug)]
pub(crate) struct SubState {
    pub(crate) shared: Arc<SubShared>,
    pub(crate) max: Option<u64>,
    pub(crate) delivered: u64,
    /// UNSUB already written for this sid (drain or explicit unsubscribe).
    pub(crate) unsub_sent: bool,
    pub(crate) delivery: Delivery,
}

impl SubState {
    pub(crate) fn new(shared: Arc<SubShared>, max: Option<u64>, delivery: Delivery) -> Self {
        SubState {
            shared,
            max,
            delivered: 0,
            unsub_sent: false,
            delivery,
        }
    }

    pub(crate) fn sid(&self) -> u64 {
        self.shared.sid
    }

    pub(crate) fn status(&self) -> SubscriptionStatus {
        self.shared.status.load()
    }

    pub(crate) fn limit_reached(&self) -> bool {
        self.max.is_some_and(|max| self.delivered >= max)
    }

    pub(crate) fn record_delivery(&mut self) {
        self.delivered += 1;
        self.shared.received.fetch_add(1, Ordering::Relaxed);
    }

    /// Marks the subscription closed. The delivery side is dropped with the
    /// state, which ends any channel consumer.
    pub(crate) fn close(self) {
        self.shared.status.store(SubscriptionStatus::Closed);
    }
}

/// Every subscription the remote end may still route messages to, keyed by
/// sid.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    subs: HashMap<u64, SubState>,
}

impl Registry {
    /// Stores an open subscription and returns the frames announcing it.
    pub(crate) fn register(&mut self, state: SubState) -> Vec<ClientOp> {
        let sid = state.sid();
        let mut ops = vec![ClientOp::Subscribe {
            subject: state.shared.subject.clone(),
            queue_group: state.shared.queue_group.clone(),
            sid,
        }];
        if let Some(max) = state.max {
            ops.push(ClientOp::Unsubscribe {
                sid,
                max: Some(max),
            });
        }
        self.subs.insert(sid, state);
        ops
    }

    /// Removes `sid` and returns it with its UNSUB frame. `None` if it was
    /// already gone.
    pub(crate) fn unregister(&mut self, sid: u64) -> Option<(SubState, ClientOp)> {
        self.subs
            .remove(&sid)
            .map(|state| (state, ClientOp::Unsubscribe { sid, max: None }))
    }

    /// Removes `sid` without emitting anything: the broker already stopped
    /// routing to it.
    pub(crate) fn remove(&mut self, sid: u64) -> Option<SubState> {
        self.subs.remove(&sid)
    }

    pub(crate) fn lookup(&mut self, sid: u64) -> Option<&mut SubState> {
        self.subs.get_mut(&sid)
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut SubState> {
        self.subs.values_mut()
    }

    pub(crate) fn take_all(&mut self) -> impl Iterator<Item = SubState> + '_ {
        self.subs.drain().map(|(_, state)| state)
    }

    pub(crate) fn len(&self) -> usize {
        self.subs.len()
    }
}
