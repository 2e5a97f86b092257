pub mod frame;
pub mod headers;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub use headers::Headers;

pub const CRLF: &[u8] = b"\r\n";

/// Longest control line accepted before a CRLF must appear.
pub const MAX_CONTROL_LINE: usize = 4096;

pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

/// Largest MSG/HMSG body a client decoder buffers before failing the stream.
pub const MAX_INBOUND_PAYLOAD: usize = 64 * 1024 * 1024;

pub const PROTOCOL_V1: u8 = 1;

#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown protocol operation: {0}")]
    UnknownOperation(String),

    #[error("malformed {op} line: {line}")]
    MalformedLine { op: Op, line: String },

    #[error("control line exceeds {max} bytes")]
    ControlLineTooLong { max: usize },

    #[error("invalid header block: {0}")]
    InvalidHeaders(String),

    #[error("payload of {size} bytes exceeds maximum of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("payload not followed by CRLF")]
    MissingPayloadTerminator,

    #[error("invalid json in {op}: {source}")]
    InvalidJson {
        op: Op,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Op {
    // client -> server
    Connect,
    Pub,
    Hpub,
    Sub,
    Unsub,

    // server -> client
    Info,
    Msg,
    Hmsg,
    Ok,
    Err,

    // both directions
    Ping,
    Pong,
}

impl Op {
    pub fn verb(self) -> &'static str {
        match self {
            Op::Connect => "CONNECT",
            Op::Pub => "PUB",
            Op::Hpub => "HPUB",
            Op::Sub => "SUB",
            Op::Unsub => "UNSUB",
            Op::Info => "INFO",
            Op::Msg => "MSG",
            Op::Hmsg => "HMSG",
            Op::Ok => "+OK",
            Op::Err => "-ERR",
            Op::Ping => "PING",
            Op::Pong => "PONG",
        }
    }

    /// Verbs are matched case-insensitively.
    pub fn from_verb(verb: &str) -> Option<Op> {
        const ALL: [Op; 12] = [
            Op::Connect,
            Op::Pub,
            Op::Hpub,
            Op::Sub,
            Op::Unsub,
            Op::Info,
            Op::Msg,
            Op::Hmsg,
            Op::Ok,
            Op::Err,
            Op::Ping,
            Op::Pong,
        ];
        ALL.into_iter().find(|op| op.verb().eq_ignore_ascii_case(verb))
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.verb())
    }
}

/// Sent by the server right after the transport is up, and again whenever
/// its view of the cluster changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Info {
    pub server_id: String,
    pub server_name: String,
    pub version: String,
    pub proto: u8,
    pub host: String,
    pub port: u16,
    pub max_payload: usize,
    pub headers: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<u64>,
}

impl Default for Info {
    fn default() -> Self {
        Info {
            server_id: String::new(),
            server_name: String::new(),
            version: String::new(),
            proto: PROTOCOL_V1,
            host: String::new(),
            port: 0,
            max_payload: DEFAULT_MAX_PAYLOAD,
            headers: true,
            client_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Connect {
    pub verbose: bool,
    pub pedantic: bool,
    pub tls_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub lang: String,
    pub version: String,
    pub protocol: u8,
    pub echo: bool,
    pub headers: bool,
    pub no_responders: bool,
}

impl Default for Connect {
    fn default() -> Self {
        Connect {
            verbose: false,
            pedantic: false,
            tls_required: false,
            name: None,
            lang: "rust".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            protocol: PROTOCOL_V1,
            echo: true,
            headers: true,
            no_responders: false,
        }
    }
}

/// Operations a client writes to the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientOp {
    Connect(Box<Connect>),
    Publish {
        subject: String,
        reply: Option<String>,
        headers: Option<Headers>,
        payload: Bytes,
    },
    Subscribe {
        subject: String,
        queue_group: Option<String>,
        sid: u64,
    },
    Unsubscribe {
        sid: u64,
        max: Option<u64>,
    },
    Ping,
    Pong,
}

impl ClientOp {
    pub fn op(&self) -> Op {
        match self {
            ClientOp::Connect(_) => Op::Connect,
            ClientOp::Publish { headers: None, .. } => Op::Pub,
            ClientOp::Publish { headers: Some(_), .. } => Op::Hpub,
            ClientOp::Subscribe { .. } => Op::Sub,
            ClientOp::Unsubscribe { .. } => Op::Unsub,
            ClientOp::Ping => Op::Ping,
            ClientOp::Pong => Op::Pong,
        }
    }
}

/// Operations a server writes to the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerOp {
    Info(Box<Info>),
    Message {
        subject: String,
        sid: u64,
        reply: Option<String>,
        headers: Option<Headers>,
        payload: Bytes,
    },
    Ping,
    Pong,
    Ok,
    Err(String),
}

impl ServerOp {
    pub fn op(&self) -> Op {
        match self {
            ServerOp::Info(_) => Op::Info,
            ServerOp::Message { headers: None, .. } => Op::Msg,
            ServerOp::Message { headers: Some(_), .. } => Op::Hmsg,
            ServerOp::Ping => Op::Ping,
            ServerOp::Pong => Op::Pong,
            ServerOp::Ok => Op::Ok,
            ServerOp::Err(_) => Op::Err,
        }
    }
}

/// A subject is a non-empty, whitespace-free, dot-separated list of
/// non-empty tokens.
pub fn is_valid_subject(subject: &str) -> bool {
    !subject.is_empty()
        && !subject.chars().any(char::is_whitespace)
        && subject.split('.').all(|token| !token.is_empty())
}

pub fn is_valid_queue_group(group: &str) -> bool {
    !group.is_empty() && !group.chars().any(char::is_whitespace)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbs_round_trip_case_insensitively() {
        assert_eq!(Op::from_verb("pub"), Some(Op::Pub));
        assert_eq!(Op::from_verb("HMSG"), Some(Op::Hmsg));
        assert_eq!(Op::from_verb("+ok"), Some(Op::Ok));
        assert_eq!(Op::from_verb("-ERR"), Some(Op::Err));
        assert_eq!(Op::from_verb("NOPE"), None);
    }

    #[test]
    fn subject_validation() {
        assert!(is_valid_subject("foo"));
        assert!(is_valid_subject("foo.bar.>"));
        assert!(is_valid_subject("_INBOX.abc"));
        assert!(!is_valid_subject(""));
        assert!(!is_valid_subject("foo bar"));
        assert!(!is_valid_subject("foo\tbar"));
        assert!(!is_valid_subject("foo..bar"));
        assert!(!is_valid_subject(".foo"));
        assert!(!is_valid_subject("foo."));
    }

    #[test]
    fn info_tolerates_missing_and_unknown_fields() {
        let info: Info =
            serde_json::from_str(r#"{"server_id":"abc","max_payload":512,"cluster":"x"}"#)
                .expect("parse info");
        assert_eq!(info.server_id, "abc");
        assert_eq!(info.max_payload, 512);
        assert!(info.headers);
    }

    #[test]
    fn connect_omits_missing_name() {
        let json = serde_json::to_string(&Connect::default()).expect("serialize");
        assert!(!json.contains("\"name\""));
        assert!(json.contains("\"echo\":true"));
    }
}
