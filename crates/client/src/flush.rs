use std::collections::VecDeque;

use tokio::sync::oneshot;

use crate::error::{ClientError, Result};

/// What to do when the PONG for a PING arrives.
#[derive(Debug)]
pub(crate) enum FlushWaiter {
    /// A caller awaiting `flush()`.
    Caller(oneshot::Sender<Result<()>>),
    /// UNSUBs for these sids were written before the PING, so nothing more
    /// can arrive for them once the PONG is read.
    CloseSubscriptions(Vec<u64>),
    /// Last round trip of a connection drain.
    FinalDrain,
}

#[derive(Debug)]
pub(crate) struct PendingFlush {
    pub(crate) token: u64,
    pub(crate) waiter: FlushWaiter,
}

/// PINGs awaiting their PONG. The broker answers in order, so resolution is
/// strictly oldest-first.
#[derive(Debug, Default)]
pub(crate) struct FlushQueue {
    pending: VecDeque<PendingFlush>,
    next_token: u64,
}

impl FlushQueue {
    pub(crate) fn push(&mut self, waiter: FlushWaiter) -> u64 {
        self.next_token += 1;
        let token = self.next_token;
        self.pending.push_back(PendingFlush { token, waiter });
        token
    }

    /// Called for every PONG.
    pub(crate) fn pop_oldest(&mut self) -> Option<PendingFlush> {
        self.pending.pop_front()
    }

    /// Fails every caller still waiting. Internal waiters are discarded; the
    /// drain bookkeeping fails its own requests.
    pub(crate) fn fail_all(&mut self) {
        for pending in self.pending.drain(..) {
            if let FlushWaiter::Caller(tx) = pending.waiter {
                let _ = tx.send(Err(ClientError::ConnectionClosed));
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}
