use bytes::Bytes;
use skein_protocol::v1::Headers;

use crate::{
    connection::WeakEngineHandle,
    error::{ClientError, Result},
};

/// An inbound message. The payload is exactly the bytes the publisher sent.
#[derive(Debug, Clone)]
pub struct Message {
    pub subject: String,
    pub reply: Option<String>,
    pub headers: Option<Headers>,
    pub payload: Bytes,
    pub(crate) responder: Option<WeakEngineHandle>,
}

impl Message {
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Message {
            subject: subject.into(),
            reply: None,
            headers: None,
            payload: payload.into(),
            responder: None,
        }
    }

    /// Publishes `payload` to this message's reply subject on the connection
    /// it arrived on.
    pub fn respond(&self, payload: impl Into<Bytes>) -> Result<()> {
        let reply = self
            .reply
            .as_deref()
            .ok_or_else(|| ClientError::BadSubject(String::new()))?;
        let engine = self
            .responder
            .as_ref()
            .and_then(WeakEngineHandle::upgrade)
            .ok_or(ClientError::ConnectionClosed)?;
        engine.publish(reply, None, None, payload.into())
    }
}
