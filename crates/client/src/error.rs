use skein_protocol::v1::ProtocolError;

pub type Result<T, E = ClientError> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("connection closed")]
    ConnectionClosed,

    #[error("connection draining")]
    ConnectionDraining,

    #[error("subscription closed")]
    SubscriptionClosed,

    #[error("subscription draining")]
    SubscriptionDraining,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid subject {0:?}")]
    BadSubject(String),

    #[error("invalid headers: {0}")]
    BadHeaders(String),

    #[error("payload of {size} bytes exceeds server maximum of {max}")]
    MaxPayloadExceeded { size: usize, max: usize },

    #[error("timed out")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cause of a failure, for callers that branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConnectionClosed,
    ConnectionDraining,
    SubClosed,
    SubDraining,
    ProtocolError,
    BadSubject,
    BadHeaders,
    MaxPayloadExceeded,
    Timeout,
    Io,
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::ConnectionClosed => ErrorKind::ConnectionClosed,
            ClientError::ConnectionDraining => ErrorKind::ConnectionDraining,
            ClientError::SubscriptionClosed => ErrorKind::SubClosed,
            ClientError::SubscriptionDraining => ErrorKind::SubDraining,
            ClientError::Protocol(_) => ErrorKind::ProtocolError,
            ClientError::BadSubject(_) => ErrorKind::BadSubject,
            ClientError::BadHeaders(_) => ErrorKind::BadHeaders,
            ClientError::MaxPayloadExceeded { .. } => ErrorKind::MaxPayloadExceeded,
            ClientError::Timeout => ErrorKind::Timeout,
            ClientError::Io(_) => ErrorKind::Io,
        }
    }
}

impl From<ProtocolError> for ClientError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => ClientError::Io(e),
            ProtocolError::InvalidHeaders(e) => ClientError::BadHeaders(e),
            other => ClientError::Protocol(other.to_string()),
        }
    }
}
