use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::sync::oneshot;

use crate::error::{ClientError, Result};

/// Resolves when a flush or drain finishes.
///
/// The operation is already underway when this is returned: preconditions
/// were checked and the request queued at the call site. Dropping the
/// completion does not cancel anything.
#[derive(Debug)]
pub struct Completion {
    state: State,
}

#[derive(Debug)]
enum State {
    Failed(Option<ClientError>),
    Waiting(oneshot::Receiver<Result<()>>),
}

impl Completion {
    pub(crate) fn failed(err: ClientError) -> Self {
        Completion {
            state: State::Failed(Some(err)),
        }
    }

    pub(crate) fn waiting(rx: oneshot::Receiver<Result<()>>) -> Self {
        Completion {
            state: State::Waiting(rx),
        }
    }
}

impl Future for Completion {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        match &mut self.state {
            State::Failed(err) => Poll::Ready(Err(err.take().unwrap_or(ClientError::ConnectionClosed))),
            // A dropped sender means the engine went away without answering.
            State::Waiting(rx) => Pin::new(rx)
                .poll(cx)
                .map(|res| res.unwrap_or(Err(ClientError::ConnectionClosed))),
        }
    }
}
