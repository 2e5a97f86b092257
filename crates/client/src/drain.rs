use std::collections::{HashMap, HashSet};

use tokio::sync::oneshot;

use crate::error::{ClientError, Result};

type Reply = oneshot::Sender<Result<()>>;

#[derive(Debug, PartialEq, Eq)]
enum Phase {
    AwaitingSubscriptions,
    FinalFlush,
}

#[derive(Debug)]
struct ConnectionDrain {
    waiting_on: HashSet<u64>,
    phase: Phase,
    reply: Reply,
}

/// Outstanding drain requests, owned by the engine task.
#[derive(Debug, Default)]
pub(crate) struct DrainCoordinator {
    subscriptions: HashMap<u64, Vec<Reply>>,
    connection: Option<ConnectionDrain>,
}

impl DrainCoordinator {
    pub(crate) fn watch_subscription(&mut self, sid: u64, reply: Reply) {
        self.subscriptions.entry(sid).or_default().push(reply);
    }

    pub(crate) fn begin_connection(&mut self, sids: impl IntoIterator<Item = u64>, reply: Reply) {
        self.connection = Some(ConnectionDrain {
            waiting_on: sids.into_iter().collect(),
            phase: Phase::AwaitingSubscriptions,
            reply,
        });
    }

    /// Resolves every drain waiting on `sid`.
    pub(crate) fn subscription_closed(&mut self, sid: u64) {
        if let Some(replies) = self.subscriptions.remove(&sid) {
            for reply in replies {
                let _ = reply.send(Ok(()));
            }
        }
        if let Some(conn) = self.connection.as_mut() {
            conn.waiting_on.remove(&sid);
        }
    }

    /// True exactly once: when every subscription of a connection drain has
    /// closed and the final flush should be issued.
    pub(crate) fn take_final_flush(&mut self) -> bool {
        match self.connection.as_mut() {
            Some(conn) if conn.phase == Phase::AwaitingSubscriptions && conn.waiting_on.is_empty() => {
                conn.phase = Phase::FinalFlush;
                true
            }
            _ => false,
        }
    }

    /// Resolves the connection drain. Called once the transport is closed.
    pub(crate) fn complete_connection(&mut self) {
        if let Some(conn) = self.connection.take() {
            let _ = conn.reply.send(Ok(()));
        }
    }

    pub(crate) fn fail_all(&mut self) {
        for (_, replies) in self.subscriptions.drain() {
            for reply in replies {
                let _ = reply.send(Err(ClientError::ConnectionClosed));
            }
        }
        if let Some(conn) = self.connection.take() {
            let _ = conn.reply.send(Err(ClientError::ConnectionClosed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn subscription_drain_resolves_on_close() {
        let mut d = DrainCoordinator::default();
        let (tx, rx) = oneshot::channel();
        d.watch_subscription(7, tx);

        d.subscription_closed(8);
        d.subscription_closed(7);
        assert!(rx.await.expect("answered").is_ok());
    }

    #[tokio::test]
    async fn connection_drain_waits_for_every_subscription() {
        let mut d = DrainCoordinator::default();
        let (tx, mut rx) = oneshot::channel();
        d.begin_connection([1, 2], tx);

        assert!(!d.take_final_flush());
        d.subscription_closed(1);
        assert!(!d.take_final_flush());
        d.subscription_closed(2);
        assert!(d.take_final_flush());
        assert!(!d.take_final_flush(), "final flush issued once");

        assert!(rx.try_recv().is_err(), "not resolved before transport close");
        d.complete_connection();
        assert!(rx.await.expect("answered").is_ok());
        assert!(d.connection.is_none());
    }

    #[test]
    fn empty_connection_drain_is_immediately_ready() {
        let mut d = DrainCoordinator::default();
        let (tx, _rx) = oneshot::channel();
        d.begin_connection(Vec::new(), tx);
        assert!(d.take_final_flush());
    }

    #[tokio::test]
    async fn fail_all_reports_connection_closed() {
        let mut d = DrainCoordinator::default();
        let (sub_tx, sub_rx) = oneshot::channel();
        let (conn_tx, conn_rx) = oneshot::channel();
        d.watch_subscription(1, sub_tx);
        d.begin_connection([1], conn_tx);

        d.fail_all();
        for rx in [sub_rx, conn_rx] {
            let err = rx.await.expect("answered").expect_err("failed");
            assert_eq!(err.kind(), ErrorKind::ConnectionClosed);
        }
    }
}
