//! Frame encoding.
//!
//! One frame per connection:
//!
//! ```text
//! <kind>\n
//! <source>|<run-id>|<terminal-id>|<host-pid>\n   (optional)
//! <json payload>                                (optional)
//! ```
//!
//! A connection that closes without writing anything is a probe.

use ring::digest::{digest, SHA256};
use serde_json::Value;
use thiserror::Error;

use crate::event::{HookEvent, HookPayload};
use crate::types::{EventKind, RelayMeta};

#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame has no event kind")]
    MissingKind,

    #[error("payload is not valid JSON: {0}")]
    MalformedPayload(#[from] serde_json::Error),

    #[error("payload must be a JSON object")]
    PayloadNotObject,
}

/// A decoded frame. The kind is kept verbatim so unknown kinds can still be
/// relayed by the daemon.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Probe,
    Event(RawEvent),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub kind_name: String,
    pub meta: RelayMeta,
    pub payload: Option<Value>,
}

impl RawEvent {
    pub fn new(kind: EventKind, meta: RelayMeta, payload: Option<Value>) -> Self {
        RawEvent {
            kind_name: kind.as_str().to_string(),
            meta,
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        EventKind::parse(&self.kind_name)
    }

    /// Typed view of the payload. An absent payload is an empty one.
    pub fn typed_payload(&self) -> Result<HookPayload, WireError> {
        match &self.payload {
            Some(value) => Ok(HookPayload::from_value(value.clone())?),
            None => Ok(HookPayload::default()),
        }
    }

    pub fn into_event(self, now: u64) -> Result<HookEvent, WireError> {
        let payload = self.typed_payload()?;
        Ok(HookEvent::from_payload(self.kind(), self.meta, payload, now))
    }

    pub fn request_id(&self) -> Option<&str> {
        self.payload
            .as_ref()
            .and_then(|p| p.get("request_id"))
            .and_then(Value::as_str)
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_frame(&self.kind_name, &self.meta, self.payload.as_ref())
    }
}

pub fn encode_frame(kind_name: &str, meta: &RelayMeta, payload: Option<&Value>) -> Vec<u8> {
    let mut out = String::with_capacity(128);
    out.push_str(kind_name.trim());
    out.push('\n');
    out.push_str(&meta.to_line());
    out.push('\n');
    if let Some(payload) = payload {
        out.push_str(&payload.to_string());
    }
    out.into_bytes()
}

pub fn decode_frame(bytes: &[u8]) -> Result<Frame, WireError> {
    let text = decode_payload_bytes(bytes);
    if text.trim().is_empty() {
        return Ok(Frame::Probe);
    }

    let text = text.trim_start_matches(['\r', '\n']);
    let (kind_line, rest) = split_line(text);
    let kind_name = kind_line.trim();
    if kind_name.is_empty() || opens_payload(kind_name) {
        return Err(WireError::MissingKind);
    }

    let (meta, payload_text) = match rest {
        Some(rest) if opens_payload(rest.trim_start()) => (RelayMeta::default(), rest),
        Some(rest) => {
            let (meta_line, remainder) = split_line(rest);
            (RelayMeta::parse_line(meta_line), remainder.unwrap_or(""))
        }
        None => (RelayMeta::default(), ""),
    };

    let payload_text = payload_text.trim();
    let payload = if payload_text.is_empty() {
        None
    } else {
        let value: Value = serde_json::from_str(payload_text)?;
        if !value.is_object() {
            return Err(WireError::PayloadNotObject);
        }
        Some(value)
    };

    Ok(Frame::Event(RawEvent {
        kind_name: kind_name.to_string(),
        meta,
        payload,
    }))
}

fn split_line(text: &str) -> (&str, Option<&str>) {
    match text.find('\n') {
        Some(idx) => (text[..idx].trim_end_matches('\r'), Some(&text[idx + 1..])),
        None => (text, None),
    }
}

fn opens_payload(text: &str) -> bool {
    text.starts_with('{') || text.starts_with('[')
}

/// Reduce raw payload bytes to text.
///
/// Handles UTF-8 (with or without BOM) and UTF-16 in either byte order, which
/// some Windows shells produce when piping into a native executable.
pub fn decode_payload_bytes(bytes: &[u8]) -> String {
    if let Some(rest) = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        return String::from_utf8_lossy(rest).into_owned();
    }
    if let Some(rest) = bytes.strip_prefix(&[0xFF, 0xFE]) {
        return decode_utf16(rest, u16::from_le_bytes);
    }
    if let Some(rest) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        return decode_utf16(rest, u16::from_be_bytes);
    }
    match sniff_utf16(bytes) {
        Some(Utf16Order::Little) => decode_utf16(bytes, u16::from_le_bytes),
        Some(Utf16Order::Big) => decode_utf16(bytes, u16::from_be_bytes),
        None => String::from_utf8_lossy(bytes).into_owned(),
    }
}

enum Utf16Order {
    Little,
    Big,
}

/// BOM-less UTF-16 of ASCII-heavy text has a NUL in every other byte.
fn sniff_utf16(bytes: &[u8]) -> Option<Utf16Order> {
    if bytes.len() < 4 || bytes.len() % 2 != 0 {
        return None;
    }
    let pairs = bytes.len() / 2;
    let odd_nuls = bytes.iter().skip(1).step_by(2).filter(|b| **b == 0).count();
    let even_nuls = bytes.iter().step_by(2).filter(|b| **b == 0).count();
    if odd_nuls * 10 >= pairs * 9 && even_nuls == 0 {
        Some(Utf16Order::Little)
    } else if even_nuls * 10 >= pairs * 9 && odd_nuls == 0 {
        Some(Utf16Order::Big)
    } else {
        None
    }
}

fn decode_utf16(bytes: &[u8], to_unit: fn([u8; 2]) -> u16) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| to_unit([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

/// Dedup fingerprint for one hook invocation.
///
/// Identical payloads for the same kind within the same wall-clock second
/// collapse to one id, so a hook registered twice is applied once.
pub fn fingerprint(kind: EventKind, payload: &[u8], at_millis: u64) -> String {
    let mut input = Vec::with_capacity(payload.len() + 32);
    input.extend_from_slice(kind.as_str().as_bytes());
    input.push(0);
    input.extend_from_slice(&(at_millis / 1000).to_be_bytes());
    input.push(0);
    input.extend_from_slice(payload);
    let hash = digest(&SHA256, &input);
    hex_prefix(hash.as_ref(), 16)
}

pub(crate) fn hex_prefix(bytes: &[u8], chars: usize) -> String {
    let mut out = String::with_capacity(chars);
    for byte in bytes {
        if out.len() >= chars {
            break;
        }
        out.push_str(&format!("{byte:02x}"));
    }
    out.truncate(chars);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta() -> RelayMeta {
        RelayMeta {
            source: "claude".into(),
            run_id: "run-7".into(),
            terminal_id: "term-1".into(),
            host_pid: 4242,
        }
    }

    #[test]
    fn empty_connection_is_a_probe() {
        assert_eq!(decode_frame(b"").unwrap(), Frame::Probe);
        assert_eq!(decode_frame(b" \r\n").unwrap(), Frame::Probe);
    }

    #[test]
    fn decodes_full_frame() {
        let payload = json!({"session_id": "s1", "cwd": "/proj"});
        let bytes = encode_frame("tool_start", &meta(), Some(&payload));

        let Frame::Event(raw) = decode_frame(&bytes).unwrap() else {
            panic!("expected event frame");
        };
        assert_eq!(raw.kind(), EventKind::ToolStart);
        assert_eq!(raw.meta, meta());
        assert_eq!(raw.payload, Some(payload));
    }

    #[test]
    fn payload_may_replace_metadata_line() {
        let Frame::Event(raw) = decode_frame(b"stop\n{\"session_id\":\"s1\"}").unwrap() else {
            panic!("expected event frame");
        };
        assert_eq!(raw.kind(), EventKind::Stop);
        assert!(raw.meta.is_empty());
        assert_eq!(raw.payload, Some(json!({"session_id": "s1"})));
    }

    #[test]
    fn kind_only_frame_has_no_payload() {
        let Frame::Event(raw) = decode_frame(b"session_end\r\n").unwrap() else {
            panic!("expected event frame");
        };
        assert_eq!(raw.kind(), EventKind::SessionEnd);
        assert_eq!(raw.payload, None);
    }

    #[test]
    fn multi_line_payload_survives() {
        let bytes = b"notification\nclaude|||0\n{\n  \"message\": \"hi\"\n}\n";
        let Frame::Event(raw) = decode_frame(bytes).unwrap() else {
            panic!("expected event frame");
        };
        assert_eq!(raw.meta.source, "claude");
        assert_eq!(raw.payload, Some(json!({"message": "hi"})));
    }

    #[test]
    fn malformed_payload_is_an_error() {
        assert!(matches!(
            decode_frame(b"stop\n\n{not json"),
            Err(WireError::MalformedPayload(_))
        ));
        assert!(matches!(
            decode_frame(b"stop\n\n[1,2]"),
            Err(WireError::PayloadNotObject)
        ));
        assert!(matches!(
            decode_frame(b"{\"session_id\":\"s1\"}"),
            Err(WireError::MissingKind)
        ));
    }

    #[test]
    fn decodes_utf16_payloads() {
        let text = "stop\n{\"session_id\":\"s1\"}";
        let le: Vec<u8> = text.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        let be: Vec<u8> = text.encode_utf16().flat_map(|u| u.to_be_bytes()).collect();
        let mut le_bom = vec![0xFF, 0xFE];
        le_bom.extend_from_slice(&le);

        assert_eq!(decode_payload_bytes(&le), text);
        assert_eq!(decode_payload_bytes(&be), text);
        assert_eq!(decode_payload_bytes(&le_bom), text);

        let Frame::Event(raw) = decode_frame(&le).unwrap() else {
            panic!("expected event frame");
        };
        assert_eq!(raw.kind(), EventKind::Stop);
    }

    #[test]
    fn strips_utf8_bom() {
        let mut bytes = vec![0xEF, 0xBB, 0xBF];
        bytes.extend_from_slice(b"{\"a\":1}");
        assert_eq!(decode_payload_bytes(&bytes), "{\"a\":1}");
    }

    #[test]
    fn request_id_is_read_from_payload() {
        let raw = RawEvent::new(
            EventKind::PermissionRequest,
            RelayMeta::default(),
            Some(json!({"request_id": "r1"})),
        );
        assert_eq!(raw.request_id(), Some("r1"));
    }

    #[test]
    fn fingerprint_buckets_by_second() {
        let a = fingerprint(EventKind::ToolStart, b"{}", 10_100);
        let b = fingerprint(EventKind::ToolStart, b"{}", 10_900);
        let c = fingerprint(EventKind::ToolStart, b"{}", 11_000);
        let d = fingerprint(EventKind::ToolEnd, b"{}", 10_100);

        assert_eq!(a.len(), 16);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }
}
