//! In-memory subject router speaking the skein text protocol.
//!
//! Meant for tests, benchmarks and local development: no persistence, no
//! clustering, no auth. Routing is synchronous on the publisher's reader
//! task, so every subscriber sees a given publisher's messages in publish
//! order, and a subscriber's PONG is always queued behind the messages routed
//! to it before its PING was read.

pub mod server;

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use dashmap::{DashMap, mapref::entry::Entry};
use skein_protocol::v1::{
    DEFAULT_MAX_PAYLOAD, Headers, Info, ServerOp, is_valid_queue_group, is_valid_subject,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub type ClientId = u64;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("invalid subject {0:?}")]
    InvalidSubject(String),

    #[error("invalid publish subject {0:?}")]
    InvalidPublishSubject(String),

    #[error("invalid queue group {0:?}")]
    InvalidQueueGroup(String),

    #[error("duplicate sid {0}")]
    DuplicateSid(u64),

    #[error("unknown client {0}")]
    UnknownClient(ClientId),
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub server_name: String,
    pub max_payload: usize,
    /// Send PING to idle clients this often; `None` disables it.
    pub ping_interval: Option<Duration>,
    /// Unanswered PINGs tolerated before a client is dropped.
    pub max_pings_outstanding: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            server_name: "skein".into(),
            max_payload: DEFAULT_MAX_PAYLOAD,
            ping_interval: None,
            max_pings_outstanding: 2,
        }
    }
}

impl BrokerConfig {
    pub fn with_server_name(self, server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            ..self
        }
    }

    pub fn with_max_payload(self, max_payload: usize) -> Self {
        Self {
            max_payload,
            ..self
        }
    }

    pub fn with_ping_interval(self, ping_interval: Duration) -> Self {
        Self {
            ping_interval: Some(ping_interval),
            ..self
        }
    }
}

#[derive(Debug)]
struct ClientEntry {
    tx: mpsc::UnboundedSender<ServerOp>,
    echo: bool,
}

#[derive(Debug)]
struct Route {
    client: ClientId,
    sid: u64,
    subject: String,
    queue_group: Option<String>,
    delivered: AtomicU64,
    /// `u64::MAX` when unlimited.
    max: AtomicU64,
}

impl Route {
    /// Counts one delivery. Returns whether it may go out and whether it was
    /// the last one allowed.
    fn admit(&self) -> (bool, bool) {
        let n = self.delivered.fetch_add(1, Ordering::AcqRel) + 1;
        let max = self.max.load(Ordering::Acquire);
        (n <= max, n >= max)
    }
}

/// Broker-wide counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BrokerStats {
    pub in_msgs: u64,
    pub out_msgs: u64,
    pub in_bytes: u64,
    pub out_bytes: u64,
}

#[derive(Debug)]
pub struct Broker {
    config: BrokerConfig,
    server_id: String,
    clients: DashMap<ClientId, ClientEntry>,
    routes: DashMap<(ClientId, u64), Arc<Route>>,
    /// Round-robin position per queue group, keyed by `subject group`.
    rr_counters: DashMap<String, AtomicU64>,
    next_client_id: AtomicU64,
    in_msgs: AtomicU64,
    out_msgs: AtomicU64,
    in_bytes: AtomicU64,
    out_bytes: AtomicU64,
    shutdown: CancellationToken,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Broker {
            config,
            server_id: skein_util::unique_token(),
            clients: DashMap::new(),
            routes: DashMap::new(),
            rr_counters: DashMap::new(),
            next_client_id: AtomicU64::new(1),
            in_msgs: AtomicU64::new(0),
            out_msgs: AtomicU64::new(0),
            in_bytes: AtomicU64::new(0),
            out_bytes: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn info_for(&self, client: ClientId) -> Info {
        Info {
            server_id: self.server_id.clone(),
            server_name: self.config.server_name.clone(),
            version: env!("CARGO_PKG_VERSION").into(),
            max_payload: self.config.max_payload,
            headers: true,
            client_id: Some(client),
            ..Info::default()
        }
    }

    /// Reserves an id for a connection that has not sent CONNECT yet.
    pub fn allocate_client_id(&self) -> ClientId {
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register_client(&self, id: ClientId, tx: mpsc::UnboundedSender<ServerOp>, echo: bool) {
        tracing::debug!(client = id, echo, "client registered");
        self.clients.insert(id, ClientEntry { tx, echo });
    }

    /// Drops the client and every route it owns.
    pub fn disconnect(&self, id: ClientId) {
        self.clients.remove(&id);
        self.routes.retain(|(client, _), _| *client != id);
        tracing::debug!(client = id, "client disconnected");
    }

    pub fn subscribe(
        &self,
        client: ClientId,
        sid: u64,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<(), BrokerError> {
        if !self.clients.contains_key(&client) {
            return Err(BrokerError::UnknownClient(client));
        }
        if !is_valid_subject(subject) {
            return Err(BrokerError::InvalidSubject(subject.to_string()));
        }
        if let Some(group) = queue_group.filter(|g| !is_valid_queue_group(g)) {
            return Err(BrokerError::InvalidQueueGroup(group.to_string()));
        }

        let route = Arc::new(Route {
            client,
            sid,
            subject: subject.to_string(),
            queue_group: queue_group.map(str::to_string),
            delivered: AtomicU64::new(0),
            max: AtomicU64::new(u64::MAX),
        });
        match self.routes.entry((client, sid)) {
            Entry::Occupied(_) => Err(BrokerError::DuplicateSid(sid)),
            Entry::Vacant(slot) => {
                slot.insert(route);
                tracing::trace!(client, sid, subject, queue = ?queue_group, "route added");
                Ok(())
            }
        }
    }

    /// `None` removes the route now; `Some(max)` removes it once `max`
    /// messages in total have been delivered to it.
    pub fn unsubscribe(&self, client: ClientId, sid: u64, max: Option<u64>) {
        let key = (client, sid);
        match max {
            Some(max) => {
                let exhausted = match self.routes.get(&key) {
                    Some(route) => {
                        route.max.store(max, Ordering::Release);
                        route.delivered.load(Ordering::Acquire) >= max
                    }
                    None => false,
                };
                if exhausted {
                    self.routes.remove(&key);
                }
            }
            None => {
                self.routes.remove(&key);
            }
        }
        tracing::trace!(client, sid, ?max, "unsubscribe");
    }

    /// Routes one message to every matching plain subscription and to one
    /// member of each matching queue group.
    pub fn publish(
        &self,
        from: ClientId,
        subject: &str,
        reply: Option<&str>,
        headers: Option<&Headers>,
        payload: &Bytes,
    ) -> Result<usize, BrokerError> {
        if !is_valid_subject(subject) || has_wildcard(subject) {
            return Err(BrokerError::InvalidPublishSubject(subject.to_string()));
        }
        let size = payload.len() + headers.map_or(0, Headers::encoded_len);
        self.in_msgs.fetch_add(1, Ordering::Relaxed);
        self.in_bytes.fetch_add(size as u64, Ordering::Relaxed);

        let no_echo = self.clients.get(&from).is_some_and(|c| !c.echo);

        let mut plain = Vec::new();
        let mut groups: Vec<(String, Vec<Arc<Route>>)> = Vec::new();
        for entry in self.routes.iter() {
            let route = entry.value();
            if no_echo && route.client == from {
                continue;
            }
            if !subject_matches(&route.subject, subject) {
                continue;
            }
            match &route.queue_group {
                None => plain.push(route.clone()),
                Some(group) => {
                    let key = format!("{} {}", route.subject, group);
                    match groups.iter_mut().find(|(k, _)| *k == key) {
                        Some((_, members)) => members.push(route.clone()),
                        None => groups.push((key, vec![route.clone()])),
                    }
                }
            }
        }

        for (key, mut members) in groups {
            members.sort_by_key(|r| (r.client, r.sid));
            let counter = self.rr_counters.entry(key).or_default();
            let start = counter.fetch_add(1, Ordering::Relaxed) as usize;
            drop(counter);
            plain.push(members[start % members.len()].clone());
        }

        let mut delivered = 0;
        for route in plain {
            let (admitted, last) = route.admit();
            if last {
                self.routes.remove(&(route.client, route.sid));
            }
            if !admitted {
                continue;
            }
            let Some(client) = self.clients.get(&route.client) else {
                continue;
            };
            let msg = ServerOp::Message {
                subject: subject.to_string(),
                sid: route.sid,
                reply: reply.map(str::to_string),
                headers: headers.cloned(),
                payload: payload.clone(),
            };
            if client.tx.send(msg).is_ok() {
                delivered += 1;
                self.out_msgs.fetch_add(1, Ordering::Relaxed);
                self.out_bytes.fetch_add(size as u64, Ordering::Relaxed);
            }
        }
        tracing::trace!(from, subject, delivered, "published");
        Ok(delivered)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            in_msgs: self.in_msgs.load(Ordering::Relaxed),
            out_msgs: self.out_msgs.load(Ordering::Relaxed),
            in_bytes: self.in_bytes.load(Ordering::Relaxed),
            out_bytes: self.out_bytes.load(Ordering::Relaxed),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops accepting and disconnects every client.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.clients.clear();
        self.routes.clear();
    }
}

fn has_wildcard(subject: &str) -> bool {
    subject.split('.').any(|t| t == "*" || t == ">")
}

/// `*` matches exactly one token, a trailing `>` one or more.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut subject_tokens = subject.split('.');
    let mut pattern_tokens = pattern.split('.').peekable();

    while let Some(p) = pattern_tokens.next() {
        if p == ">" && pattern_tokens.peek().is_none() {
            return subject_tokens.next().is_some();
        }
        match subject_tokens.next() {
            Some(s) if p == "*" || p == s => {}
            _ => return false,
        }
    }
    subject_tokens.next().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(broker: &Broker, echo: bool) -> (ClientId, mpsc::UnboundedReceiver<ServerOp>) {
        let id = broker.allocate_client_id();
        let (tx, rx) = mpsc::unbounded_channel();
        broker.register_client(id, tx, echo);
        (id, rx)
    }

    fn sids(rx: &mut mpsc::UnboundedReceiver<ServerOp>) -> Vec<u64> {
        let mut out = Vec::new();
        while let Ok(ServerOp::Message { sid, .. }) = rx.try_recv() {
            out.push(sid);
        }
        out
    }

    #[test]
    fn wildcard_matching() {
        assert!(subject_matches("a.b", "a.b"));
        assert!(subject_matches("a.*", "a.b"));
        assert!(!subject_matches("a.*", "a.b.c"));
        assert!(subject_matches("a.>", "a.b.c"));
        assert!(!subject_matches("a.>", "a"));
        assert!(subject_matches("*.b.>", "x.b.y"));
        assert!(!subject_matches("a.b", "a.b.c"));
        assert!(!subject_matches("a.b.c", "a.b"));
    }

    #[test]
    fn routes_to_plain_subscribers() -> anyhow::Result<()> {
        let broker = Broker::new(BrokerConfig::default());
        let (a, mut rx_a) = client(&broker, true);
        let (b, mut rx_b) = client(&broker, true);
        broker.subscribe(a, 1, "foo.*", None)?;
        broker.subscribe(b, 7, "foo.bar", None)?;

        let n = broker.publish(a, "foo.bar", None, None, &Bytes::from_static(b"x"))?;
        assert_eq!(n, 2);
        assert_eq!(sids(&mut rx_a), vec![1]);
        assert_eq!(sids(&mut rx_b), vec![7]);
        Ok(())
    }

    #[test]
    fn queue_group_round_robins() -> anyhow::Result<()> {
        let broker = Broker::new(BrokerConfig::default());
        let (a, mut rx_a) = client(&broker, true);
        let (b, mut rx_b) = client(&broker, true);
        broker.subscribe(a, 1, "q", Some("workers"))?;
        broker.subscribe(b, 1, "q", Some("workers"))?;

        for _ in 0..10 {
            assert_eq!(broker.publish(a, "q", None, None, &Bytes::new())?, 1);
        }
        assert_eq!(sids(&mut rx_a).len(), 5);
        assert_eq!(sids(&mut rx_b).len(), 5);
        Ok(())
    }

    #[test]
    fn auto_unsubscribe_stops_after_max() -> anyhow::Result<()> {
        let broker = Broker::new(BrokerConfig::default());
        let (a, mut rx) = client(&broker, true);
        broker.subscribe(a, 3, "s", None)?;
        broker.unsubscribe(a, 3, Some(2));

        for _ in 0..5 {
            broker.publish(a, "s", None, None, &Bytes::new())?;
        }
        assert_eq!(sids(&mut rx), vec![3, 3]);
        assert_eq!(broker.route_count(), 0);
        Ok(())
    }

    #[test]
    fn no_echo_skips_own_subscriptions() -> anyhow::Result<()> {
        let broker = Broker::new(BrokerConfig::default());
        let (a, mut rx) = client(&broker, false);
        broker.subscribe(a, 1, "s", None)?;
        assert_eq!(broker.publish(a, "s", None, None, &Bytes::new())?, 0);
        assert!(sids(&mut rx).is_empty());
        Ok(())
    }

    #[test]
    fn rejects_bad_input() {
        let broker = Broker::new(BrokerConfig::default());
        let (a, _rx) = client(&broker, true);
        assert_eq!(
            broker.publish(a, "foo.*", None, None, &Bytes::new()),
            Err(BrokerError::InvalidPublishSubject("foo.*".into()))
        );
        assert_eq!(
            broker.subscribe(a, 1, "foo..bar", None),
            Err(BrokerError::InvalidSubject("foo..bar".into()))
        );
        assert!(broker.subscribe(a, 1, "ok", None).is_ok());
        assert_eq!(broker.subscribe(a, 1, "ok", None), Err(BrokerError::DuplicateSid(1)));
        assert_eq!(
            broker.subscribe(99, 1, "ok", None),
            Err(BrokerError::UnknownClient(99))
        );
    }

    #[test]
    fn disconnect_drops_routes() -> anyhow::Result<()> {
        let broker = Broker::new(BrokerConfig::default());
        let (a, _rx) = client(&broker, true);
        broker.subscribe(a, 1, "s", None)?;
        broker.subscribe(a, 2, "t", Some("g"))?;
        broker.disconnect(a);
        assert_eq!(broker.route_count(), 0);
        assert_eq!(broker.client_count(), 0);
        Ok(())
    }
}
