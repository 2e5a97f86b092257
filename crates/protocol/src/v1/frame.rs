use std::marker::PhantomData;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::v1::{
    CRLF, ClientOp, Connect, Headers, Info, MAX_CONTROL_LINE, MAX_INBOUND_PAYLOAD, Op,
    ProtocolError, ServerOp,
};

/// Control line of a payload-bearing frame whose body has not fully arrived.
#[derive(Debug)]
struct PayloadHead {
    subject: String,
    sid: u64,
    reply: Option<String>,
    header_len: Option<usize>,
    total_len: usize,
}

enum Parsed<T> {
    Complete(T),
    Payload(PayloadHead),
}

/// Which side's operations a decoder reads.
trait Direction {
    type Item;

    fn parse_control(
        op: Op,
        args: &[&str],
        rest: &str,
        line: &str,
    ) -> Result<Parsed<Self::Item>, ProtocolError>;

    fn assemble(head: PayloadHead, headers: Option<Headers>, payload: Bytes) -> Self::Item;
}

#[derive(Debug, Default)]
struct FromServer;

#[derive(Debug, Default)]
struct FromClient;

#[derive(Debug)]
struct FrameDecoder<D> {
    pending: Option<PayloadHead>,
    max_payload: usize,
    _direction: PhantomData<D>,
}

impl<D: Direction> FrameDecoder<D> {
    fn with_limit(max_payload: usize) -> Self {
        FrameDecoder {
            pending: None,
            max_payload,
            _direction: PhantomData,
        }
    }

    fn decode_frame(&mut self, src: &mut BytesMut) -> Result<Option<D::Item>, ProtocolError> {
        loop {
            if let Some(head) = self.pending.take() {
                // total_len is bounded by max_payload when the head is parsed
                let need = head.total_len.saturating_add(CRLF.len());
                if src.len() < need {
                    src.reserve(need - src.len());
                    self.pending = Some(head);
                    return Ok(None);
                }

                // Length-delimited: the body may contain CRLF or anything else.
                let mut body = src.split_to(head.total_len).freeze();
                if &src[..CRLF.len()] != CRLF {
                    return Err(ProtocolError::MissingPayloadTerminator);
                }
                src.advance(CRLF.len());

                let headers = match head.header_len {
                    Some(0) => Some(Headers::new()),
                    Some(len) => Some(Headers::decode(&body.split_to(len))?),
                    None => None,
                };
                return Ok(Some(D::assemble(head, headers, body)));
            }

            let Some(pos) = find_crlf(src) else {
                if src.len() > MAX_CONTROL_LINE {
                    return Err(ProtocolError::ControlLineTooLong {
                        max: MAX_CONTROL_LINE,
                    });
                }
                return Ok(None);
            };
            if pos > MAX_CONTROL_LINE {
                return Err(ProtocolError::ControlLineTooLong {
                    max: MAX_CONTROL_LINE,
                });
            }

            let raw = src.split_to(pos);
            src.advance(CRLF.len());

            let line = std::str::from_utf8(&raw).map_err(|_| {
                ProtocolError::UnknownOperation(String::from_utf8_lossy(&raw).into_owned())
            })?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let (verb, rest) = line
                .split_once([' ', '\t'])
                .map(|(v, r)| (v, r.trim()))
                .unwrap_or((line, ""));
            let op = Op::from_verb(verb)
                .ok_or_else(|| ProtocolError::UnknownOperation(verb.to_string()))?;
            let args: Vec<&str> = rest.split_ascii_whitespace().collect();

            match D::parse_control(op, &args, rest, line)? {
                Parsed::Complete(item) => return Ok(Some(item)),
                Parsed::Payload(head) => {
                    if head.total_len > self.max_payload {
                        return Err(ProtocolError::PayloadTooLarge {
                            size: head.total_len,
                            max: self.max_payload,
                        });
                    }
                    self.pending = Some(head);
                }
            }
        }
    }
}

impl Direction for FromServer {
    type Item = ServerOp;

    fn parse_control(
        op: Op,
        args: &[&str],
        rest: &str,
        line: &str,
    ) -> Result<Parsed<ServerOp>, ProtocolError> {
        let parsed = match op {
            Op::Msg => {
                let (subject, sid, reply, size) = match args {
                    [subject, sid, size] => (subject, sid, None, size),
                    [subject, sid, reply, size] => (subject, sid, Some(reply), size),
                    _ => return Err(malformed(op, line)),
                };
                Parsed::Payload(PayloadHead {
                    subject: subject.to_string(),
                    sid: parse_num(op, line, sid)?,
                    reply: reply.map(|r| r.to_string()),
                    header_len: None,
                    total_len: parse_num(op, line, size)?,
                })
            }
            Op::Hmsg => {
                let (subject, sid, reply, hdr, total) = match args {
                    [subject, sid, hdr, total] => (subject, sid, None, hdr, total),
                    [subject, sid, reply, hdr, total] => (subject, sid, Some(reply), hdr, total),
                    _ => return Err(malformed(op, line)),
                };
                let header_len: usize = parse_num(op, line, hdr)?;
                let total_len: usize = parse_num(op, line, total)?;
                if header_len > total_len {
                    return Err(malformed(op, line));
                }
                Parsed::Payload(PayloadHead {
                    subject: subject.to_string(),
                    sid: parse_num(op, line, sid)?,
                    reply: reply.map(|r| r.to_string()),
                    header_len: Some(header_len),
                    total_len,
                })
            }
            Op::Info => {
                let info: Info = serde_json::from_str(rest)
                    .map_err(|source| ProtocolError::InvalidJson { op, source })?;
                Parsed::Complete(ServerOp::Info(Box::new(info)))
            }
            Op::Err => Parsed::Complete(ServerOp::Err(
                rest.trim_matches(|c| c == '\'' || c == '"').to_string(),
            )),
            Op::Ok => Parsed::Complete(ServerOp::Ok),
            Op::Ping => Parsed::Complete(ServerOp::Ping),
            Op::Pong => Parsed::Complete(ServerOp::Pong),
            _ => return Err(ProtocolError::UnknownOperation(op.verb().to_string())),
        };
        Ok(parsed)
    }

    fn assemble(head: PayloadHead, headers: Option<Headers>, payload: Bytes) -> ServerOp {
        ServerOp::Message {
            subject: head.subject,
            sid: head.sid,
            reply: head.reply,
            headers,
            payload,
        }
    }
}

impl Direction for FromClient {
    type Item = ClientOp;

    fn parse_control(
        op: Op,
        args: &[&str],
        rest: &str,
        line: &str,
    ) -> Result<Parsed<ClientOp>, ProtocolError> {
        let parsed = match op {
            Op::Pub => {
                let (subject, reply, size) = match args {
                    [subject, size] => (subject, None, size),
                    [subject, reply, size] => (subject, Some(reply), size),
                    _ => return Err(malformed(op, line)),
                };
                Parsed::Payload(PayloadHead {
                    subject: subject.to_string(),
                    sid: 0,
                    reply: reply.map(|r| r.to_string()),
                    header_len: None,
                    total_len: parse_num(op, line, size)?,
                })
            }
            Op::Hpub => {
                let (subject, reply, hdr, total) = match args {
                    [subject, hdr, total] => (subject, None, hdr, total),
                    [subject, reply, hdr, total] => (subject, Some(reply), hdr, total),
                    _ => return Err(malformed(op, line)),
                };
                let header_len: usize = parse_num(op, line, hdr)?;
                let total_len: usize = parse_num(op, line, total)?;
                if header_len > total_len {
                    return Err(malformed(op, line));
                }
                Parsed::Payload(PayloadHead {
                    subject: subject.to_string(),
                    sid: 0,
                    reply: reply.map(|r| r.to_string()),
                    header_len: Some(header_len),
                    total_len,
                })
            }
            Op::Sub => {
                let (subject, queue_group, sid) = match args {
                    [subject, sid] => (subject, None, sid),
                    [subject, queue, sid] => (subject, Some(queue.to_string()), sid),
                    _ => return Err(malformed(op, line)),
                };
                Parsed::Complete(ClientOp::Subscribe {
                    subject: subject.to_string(),
                    queue_group,
                    sid: parse_num(op, line, sid)?,
                })
            }
            Op::Unsub => {
                let (sid, max) = match args {
                    [sid] => (parse_num(op, line, sid)?, None),
                    [sid, max] => (parse_num(op, line, sid)?, Some(parse_num(op, line, max)?)),
                    _ => return Err(malformed(op, line)),
                };
                Parsed::Complete(ClientOp::Unsubscribe { sid, max })
            }
            Op::Connect => {
                let connect: Connect = serde_json::from_str(rest)
                    .map_err(|source| ProtocolError::InvalidJson { op, source })?;
                Parsed::Complete(ClientOp::Connect(Box::new(connect)))
            }
            Op::Ping => Parsed::Complete(ClientOp::Ping),
            Op::Pong => Parsed::Complete(ClientOp::Pong),
            _ => return Err(ProtocolError::UnknownOperation(op.verb().to_string())),
        };
        Ok(parsed)
    }

    fn assemble(head: PayloadHead, headers: Option<Headers>, payload: Bytes) -> ClientOp {
        ClientOp::Publish {
            subject: head.subject,
            reply: head.reply,
            headers,
            payload,
        }
    }
}

/// Client side of the stream: writes [`ClientOp`], reads [`ServerOp`].
#[derive(Debug)]
pub struct ClientCodec {
    decoder: FrameDecoder<FromServer>,
}

impl ClientCodec {
    pub fn new() -> Self {
        Self::with_max_payload(MAX_INBOUND_PAYLOAD)
    }

    /// Inbound bodies above `max_payload` fail with [`ProtocolError::PayloadTooLarge`].
    pub fn with_max_payload(max_payload: usize) -> Self {
        ClientCodec {
            decoder: FrameDecoder::with_limit(max_payload),
        }
    }
}

impl Default for ClientCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ClientCodec {
    type Item = ServerOp;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ServerOp>, ProtocolError> {
        self.decoder.decode_frame(src)
    }
}

impl Encoder<ClientOp> for ClientCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: ClientOp, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        match item {
            ClientOp::Connect(connect) => {
                let json = serde_json::to_vec(&connect).map_err(|source| {
                    ProtocolError::InvalidJson {
                        op: Op::Connect,
                        source,
                    }
                })?;
                dst.reserve(Op::Connect.verb().len() + 1 + json.len() + CRLF.len());
                dst.put_slice(b"CONNECT ");
                dst.put_slice(&json);
                dst.put_slice(CRLF);
            }
            ClientOp::Publish {
                subject,
                reply,
                headers,
                payload,
            } => put_payload_frame(
                dst,
                (Op::Pub, Op::Hpub),
                &subject,
                None,
                reply.as_deref(),
                headers.as_ref(),
                &payload,
            ),
            ClientOp::Subscribe {
                subject,
                queue_group,
                sid,
            } => {
                let sid = sid.to_string();
                match queue_group {
                    Some(queue) => put_line(dst, &["SUB", &subject, &queue, &sid]),
                    None => put_line(dst, &["SUB", &subject, &sid]),
                }
            }
            ClientOp::Unsubscribe { sid, max } => {
                let sid = sid.to_string();
                match max {
                    Some(max) => put_line(dst, &["UNSUB", &sid, &max.to_string()]),
                    None => put_line(dst, &["UNSUB", &sid]),
                }
            }
            ClientOp::Ping => put_line(dst, &["PING"]),
            ClientOp::Pong => put_line(dst, &["PONG"]),
        }
        Ok(())
    }
}

/// Broker side of the stream: writes [`ServerOp`], reads [`ClientOp`].
#[derive(Debug)]
pub struct ServerCodec {
    decoder: FrameDecoder<FromClient>,
}

impl ServerCodec {
    pub fn new(max_payload: usize) -> Self {
        ServerCodec {
            decoder: FrameDecoder::with_limit(max_payload),
        }
    }
}

impl Decoder for ServerCodec {
    type Item = ClientOp;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ClientOp>, ProtocolError> {
        self.decoder.decode_frame(src)
    }
}

impl Encoder<ServerOp> for ServerCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: ServerOp, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        match item {
            ServerOp::Info(info) => {
                let json = serde_json::to_vec(&info).map_err(|source| {
                    ProtocolError::InvalidJson {
                        op: Op::Info,
                        source,
                    }
                })?;
                dst.put_slice(b"INFO ");
                dst.put_slice(&json);
                dst.put_slice(CRLF);
            }
            ServerOp::Message {
                subject,
                sid,
                reply,
                headers,
                payload,
            } => put_payload_frame(
                dst,
                (Op::Msg, Op::Hmsg),
                &subject,
                Some(sid),
                reply.as_deref(),
                headers.as_ref(),
                &payload,
            ),
            ServerOp::Ping => put_line(dst, &["PING"]),
            ServerOp::Pong => put_line(dst, &["PONG"]),
            ServerOp::Ok => put_line(dst, &["+OK"]),
            ServerOp::Err(text) => put_line(dst, &["-ERR", &format!("'{text}'")]),
        }
        Ok(())
    }
}

/// `<verb> <subject> [sid] [reply] [hdr_len] <total_len>\r\n<headers><payload>\r\n`
fn put_payload_frame(
    dst: &mut BytesMut,
    (plain, with_headers): (Op, Op),
    subject: &str,
    sid: Option<u64>,
    reply: Option<&str>,
    headers: Option<&Headers>,
    payload: &[u8],
) {
    let header_len = headers.map(Headers::encoded_len);
    let total = header_len.unwrap_or(0) + payload.len();

    let sid = sid.map(|s| s.to_string());
    let header_len_str = header_len.map(|h| h.to_string());
    let total_str = total.to_string();

    let verb = if headers.is_some() { with_headers } else { plain };
    let mut parts: Vec<&str> = vec![verb.verb(), subject];
    parts.extend(sid.as_deref());
    parts.extend(reply);
    parts.extend(header_len_str.as_deref());
    parts.push(&total_str);

    dst.reserve(64 + subject.len() + total + 2 * CRLF.len());
    put_line(dst, &parts);
    if let Some(headers) = headers {
        headers.encode_into(dst);
    }
    dst.put_slice(payload);
    dst.put_slice(CRLF);
}

fn put_line(dst: &mut BytesMut, parts: &[&str]) {
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            dst.put_u8(b' ');
        }
        dst.put_slice(part.as_bytes());
    }
    dst.put_slice(CRLF);
}

fn find_crlf(src: &[u8]) -> Option<usize> {
    src.windows(CRLF.len()).position(|w| w == CRLF)
}

fn parse_num<T: std::str::FromStr>(op: Op, line: &str, field: &str) -> Result<T, ProtocolError> {
    field.parse().map_err(|_| malformed(op, line))
}

fn malformed(op: Op, line: &str) -> ProtocolError {
    ProtocolError::MalformedLine {
        op,
        line: line.to_string(),
    }
}
