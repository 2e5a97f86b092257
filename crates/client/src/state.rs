use std::{
    marker::PhantomData,
    sync::atomic::{AtomicU8, Ordering},
};

use crate::error::{ClientError, Result};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected = 0,
    Draining = 1,
    Closed = 2,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Open = 0,
    Draining = 1,
    Closed = 2,
}

/// Why the engine stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called, or every handle was dropped.
    Closed,
    /// A connection drain ran to completion.
    Drained,
    /// The stream failed or the server sent `-ERR`.
    Error(String),
}

pub(crate) trait StatusRepr: Copy + Eq {
    fn to_raw(self) -> u8;
    fn from_raw(raw: u8) -> Self;
}

impl StatusRepr for ConnectionStatus {
    fn to_raw(self) -> u8 {
        self as u8
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => ConnectionStatus::Connected,
            1 => ConnectionStatus::Draining,
            _ => ConnectionStatus::Closed,
        }
    }
}

impl StatusRepr for SubscriptionStatus {
    fn to_raw(self) -> u8 {
        self as u8
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => SubscriptionStatus::Open,
            1 => SubscriptionStatus::Draining,
            _ => SubscriptionStatus::Closed,
        }
    }
}

/// Lock-free status shared between the engine and its handles. Only the
/// `Open/Connected -> Draining` edge is taken by handles; every other
/// transition happens on the engine task.
#[derive(Debug)]
pub(crate) struct StatusCell<S> {
    raw: AtomicU8,
    _status: PhantomData<S>,
}

impl<S: StatusRepr> StatusCell<S> {
    pub(crate) fn new(initial: S) -> Self {
        StatusCell {
            raw: AtomicU8::new(initial.to_raw()),
            _status: PhantomData,
        }
    }

    pub(crate) fn load(&self) -> S {
        S::from_raw(self.raw.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, status: S) {
        self.raw.store(status.to_raw(), Ordering::Release);
    }

    /// Moves `from -> to`, or returns the status that prevented it.
    pub(crate) fn transition(&self, from: S, to: S) -> std::result::Result<(), S> {
        self.raw
            .compare_exchange(from.to_raw(), to.to_raw(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(S::from_raw)
    }
}

impl StatusCell<ConnectionStatus> {
    /// Gate for subscribe and request.
    pub(crate) fn ensure_accepting(&self) -> Result<()> {
        match self.load() {
            ConnectionStatus::Connected => Ok(()),
            ConnectionStatus::Draining => Err(ClientError::ConnectionDraining),
            ConnectionStatus::Closed => Err(ClientError::ConnectionClosed),
        }
    }

    /// Gate for publish, flush and unsubscribe: allowed until closed.
    pub(crate) fn ensure_open(&self) -> Result<()> {
        match self.load() {
            ConnectionStatus::Closed => Err(ClientError::ConnectionClosed),
            _ => Ok(()),
        }
    }

    pub(crate) fn begin_drain(&self) -> Result<()> {
        self.transition(ConnectionStatus::Connected, ConnectionStatus::Draining)
            .map_err(|current| match current {
                ConnectionStatus::Closed => ClientError::ConnectionClosed,
                _ => ClientError::ConnectionDraining,
            })
    }
}

impl StatusCell<SubscriptionStatus> {
    pub(crate) fn begin_drain(&self) -> Result<()> {
        self.transition(SubscriptionStatus::Open, SubscriptionStatus::Draining)
            .map_err(|current| match current {
                SubscriptionStatus::Closed => ClientError::SubscriptionClosed,
                _ => ClientError::SubscriptionDraining,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn connection_drain_is_one_shot() {
        let cell = StatusCell::new(ConnectionStatus::Connected);
        assert!(cell.ensure_accepting().is_ok());

        cell.begin_drain().expect("first drain");
        assert_eq!(cell.load(), ConnectionStatus::Draining);

        let err = cell.begin_drain().expect_err("second drain");
        assert_eq!(err.kind(), ErrorKind::ConnectionDraining);
        assert_eq!(
            cell.ensure_accepting().expect_err("subscribe while draining").kind(),
            ErrorKind::ConnectionDraining
        );
        assert!(cell.ensure_open().is_ok(), "publish allowed while draining");
    }

    #[test]
    fn closed_connection_rejects_everything() {
        let cell = StatusCell::new(ConnectionStatus::Closed);
        assert_eq!(cell.begin_drain().expect_err("drain").kind(), ErrorKind::ConnectionClosed);
        assert_eq!(cell.ensure_open().expect_err("publish").kind(), ErrorKind::ConnectionClosed);
        assert_eq!(
            cell.ensure_accepting().expect_err("subscribe").kind(),
            ErrorKind::ConnectionClosed
        );
    }

    #[test]
    fn subscription_drain_rejections() {
        let cell = StatusCell::new(SubscriptionStatus::Open);
        cell.begin_drain().expect("first drain");
        assert_eq!(cell.begin_drain().expect_err("again").kind(), ErrorKind::SubDraining);

        cell.store(SubscriptionStatus::Closed);
        assert_eq!(cell.begin_drain().expect_err("closed").kind(), ErrorKind::SubClosed);
    }
}
