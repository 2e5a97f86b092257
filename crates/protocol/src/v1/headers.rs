use bytes::{BufMut, Bytes, BytesMut};

use crate::v1::ProtocolError;

pub const HEADER_VERSION: &str = "NATS/1.0";

/// Header block carried by HPUB/HMSG frames.
///
/// Keys keep insertion order and may repeat. Lookups ignore ASCII case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    status: Option<u16>,
    description: Option<String>,
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(status: u16, description: Option<String>) -> Self {
        Headers {
            status: Some(status),
            description,
            entries: Vec::new(),
        }
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Replaces every value stored under `key`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        self.remove(&key);
        self.entries.push((key, value.into()));
    }

    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    pub fn remove(&mut self, key: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
    }

    /// First value stored under `key`, compared case-insensitively.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.status.is_none()
    }

    /// Rejects keys and values that would break the line-oriented block.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        for (k, v) in &self.entries {
            if k.is_empty() || k.contains([':', '\r', '\n']) || k.chars().any(char::is_whitespace)
            {
                return Err(ProtocolError::InvalidHeaders(format!("bad key {k:?}")));
            }
            if v.contains(['\r', '\n']) {
                return Err(ProtocolError::InvalidHeaders(format!(
                    "bad value for {k}: {v:?}"
                )));
            }
        }
        if let Some(d) = &self.description
            && d.contains(['\r', '\n'])
        {
            return Err(ProtocolError::InvalidHeaders("bad status description".into()));
        }
        Ok(())
    }

    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut dst);
        dst.freeze()
    }

    pub fn encoded_len(&self) -> usize {
        let mut len = HEADER_VERSION.len() + 2;
        if let Some(status) = self.status {
            len += 1 + status.to_string().len();
            if let Some(d) = &self.description {
                len += 1 + d.len();
            }
        }
        for (k, v) in &self.entries {
            len += k.len() + 2 + v.len() + 2;
        }
        len + 2
    }

    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.put_slice(HEADER_VERSION.as_bytes());
        if let Some(status) = self.status {
            dst.put_u8(b' ');
            dst.put_slice(status.to_string().as_bytes());
            if let Some(d) = &self.description {
                dst.put_u8(b' ');
                dst.put_slice(d.as_bytes());
            }
        }
        dst.put_slice(b"\r\n");
        for (k, v) in &self.entries {
            dst.put_slice(k.as_bytes());
            dst.put_slice(b": ");
            dst.put_slice(v.as_bytes());
            dst.put_slice(b"\r\n");
        }
        dst.put_slice(b"\r\n");
    }

    pub fn decode(block: &[u8]) -> Result<Headers, ProtocolError> {
        let text = std::str::from_utf8(block)
            .map_err(|_| ProtocolError::InvalidHeaders("not utf-8".into()))?;
        let mut lines = text.split("\r\n");

        let first = lines.next().unwrap_or_default();
        let rest = first
            .strip_prefix(HEADER_VERSION)
            .ok_or_else(|| ProtocolError::InvalidHeaders(format!("bad version line {first:?}")))?;

        let mut headers = Headers::new();
        let rest = rest.trim();
        if !rest.is_empty() {
            let (code, description) = match rest.split_once(' ') {
                Some((code, d)) => (code, Some(d.trim().to_string())),
                None => (rest, None),
            };
            let code = code
                .parse::<u16>()
                .map_err(|_| ProtocolError::InvalidHeaders(format!("bad status {code:?}")))?;
            headers.status = Some(code);
            headers.description = description.filter(|d| !d.is_empty());
        }

        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (k, v) = line
                .split_once(':')
                .ok_or_else(|| ProtocolError::InvalidHeaders(format!("bad line {line:?}")))?;
            let k = k.trim();
            if k.is_empty() {
                return Err(ProtocolError::InvalidHeaders(format!("empty key in {line:?}")));
            }
            headers.append(k, v.trim_start());
        }

        Ok(headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_entries_in_insertion_order() {
        let mut h = Headers::new();
        h.append("A", "1");
        h.append("B", "2");
        h.append("A", "3");
        assert_eq!(&h.encode()[..], b"NATS/1.0\r\nA: 1\r\nB: 2\r\nA: 3\r\n\r\n");
        assert_eq!(h.encoded_len(), h.encode().len());
    }

    #[test]
    fn insert_replaces_case_insensitively() {
        let mut h = Headers::new();
        h.append("Trace-Id", "a");
        h.append("trace-id", "b");
        h.insert("TRACE-ID", "c");
        assert_eq!(h.get_all("trace-id").collect::<Vec<_>>(), ["c"]);
    }

    #[test]
    fn get_outlives_its_key() {
        let mut h = Headers::new();
        h.append("Nats-Msg-Id", "42");
        h.append("nats-msg-id", "43");
        let value = {
            let key = String::from("NATS-MSG-ID");
            h.get(&key)
        };
        assert_eq!(value, Some("42"));
        assert_eq!(h.get("missing"), None);
    }

    #[test]
    fn decodes_status_line() {
        let h = Headers::decode(b"NATS/1.0 503 No Responders\r\n\r\n").expect("decode");
        assert_eq!(h.status(), Some(503));
        assert_eq!(h.description(), Some("No Responders"));
        assert_eq!(h.len(), 0);

        let h = Headers::decode(b"NATS/1.0 408\r\n\r\n").expect("decode");
        assert_eq!(h.status(), Some(408));
        assert_eq!(h.description(), None);
    }

    #[test]
    fn decode_keeps_repeated_keys_and_colons_in_values() {
        let h = Headers::decode(b"NATS/1.0\r\nX: a:b\r\nX: c\r\n\r\n").expect("decode");
        assert_eq!(h.get_all("x").collect::<Vec<_>>(), ["a:b", "c"]);
    }

    #[test]
    fn decode_rejects_bad_version() {
        assert!(matches!(
            Headers::decode(b"HTTP/1.1\r\n\r\n"),
            Err(ProtocolError::InvalidHeaders(_))
        ));
    }

    #[test]
    fn validate_rejects_line_breaks() {
        let mut h = Headers::new();
        h.insert("Key", "line\r\nbreak");
        assert!(h.validate().is_err());

        let mut h = Headers::new();
        h.insert("Bad Key", "v");
        assert!(h.validate().is_err());

        let mut h = Headers::new();
        h.insert("Good-Key", "v");
        assert!(h.validate().is_ok());
    }
}
