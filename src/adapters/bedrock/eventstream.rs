//! AWS `application/vnd.amazon.eventstream` binary framing (§4.2, §6.2),
//! used by Bedrock's `invoke-with-response-stream` endpoints.
//!
//! Frame layout: a 12-byte prelude (`total_length`, `headers_length`,
//! `prelude_crc`, all big-endian `u32`), followed by `headers_length` bytes
//! of headers, the payload, and a trailing 4-byte message CRC. This parser
//! reassembles frames across arbitrary HTTP chunk boundaries the same way
//! `adapters::openai::sse_to_chunks` reassembles SSE lines — buffer until a
//! full frame is available, then drain it. CRC verification is intentionally
//! skipped: a corrupt frame will fail JSON parsing downstream and be treated
//! like any other malformed chunk (logged and skipped, §4.2), which is the
//! outcome CRC verification would also produce.

use base64::Engine;
use bytes::BytesMut;
use futures::{Stream, StreamExt};
use serde_json::Value;

use crate::error::ErrorKind;

const PRELUDE_LEN: usize = 12;
const TRAILING_CRC_LEN: usize = 4;

/// One decoded event: its `:event-type` header (e.g. `"chunk"`,
/// `"modelStreamErrorException"`) and its JSON payload, already base64
/// decoded out of the wrapping `{"bytes": "<base64>"}` envelope Bedrock uses
/// for model chunk events.
pub struct Event {
    pub event_type: String,
    pub payload: Value,
}

/// Parses a raw byte stream into a stream of decoded `Event`s. Malformed
/// frames are logged and skipped rather than aborting the stream, matching
/// the SSE parser's error policy; a transport-level error or truncated
/// final frame ends the stream with `ErrorKind::Transient`.
pub fn parse(
    byte_stream: impl Stream<Item = reqwest::Result<bytes::Bytes>> + Send + 'static,
) -> impl Stream<Item = Result<Event, ErrorKind>> + Send + 'static {
    async_stream::stream! {
        let mut buf = BytesMut::new();
        futures::pin_mut!(byte_stream);
        loop {
            while let Some(frame) = try_take_frame(&mut buf) {
                match decode_frame(&frame) {
                    Some(event) => yield Ok(event),
                    None => tracing::debug!("skipping malformed event-stream frame"),
                }
            }
            match byte_stream.next().await {
                Some(Ok(bytes)) => buf.extend_from_slice(&bytes),
                Some(Err(_)) => {
                    yield Err(ErrorKind::Transient);
                    return;
                }
                None => return,
            }
        }
    }
}

/// Pops one complete frame off the front of `buf` once its declared
/// `total_length` has fully arrived; returns `None` if more bytes are
/// needed.
fn try_take_frame(buf: &mut BytesMut) -> Option<BytesMut> {
    if buf.len() < PRELUDE_LEN {
        return None;
    }
    let total_length = u32::from_be_bytes(buf[0..4].try_into().ok()?) as usize;
    if total_length < PRELUDE_LEN + TRAILING_CRC_LEN || buf.len() < total_length {
        return None;
    }
    Some(buf.split_to(total_length))
}

fn decode_frame(frame: &BytesMut) -> Option<Event> {
    let headers_length = u32::from_be_bytes(frame[4..8].try_into().ok()?) as usize;
    let headers_end = PRELUDE_LEN + headers_length;
    if frame.len() < headers_end + TRAILING_CRC_LEN {
        return None;
    }

    let headers = parse_headers(&frame[PRELUDE_LEN..headers_end])?;
    let event_type = headers.get(":event-type").cloned().unwrap_or_default();

    let payload_bytes = &frame[headers_end..frame.len() - TRAILING_CRC_LEN];
    let payload = decode_payload(payload_bytes)?;

    Some(Event { event_type, payload })
}

/// Headers are a flat sequence of `{name_len: u8, name, type: u8, value}`.
/// Only string-typed values (type 7) carry data this parser needs; other
/// known types are skipped by their fixed or length-prefixed width so the
/// cursor stays aligned for subsequent headers.
fn parse_headers(mut bytes: &[u8]) -> Option<std::collections::HashMap<String, String>> {
    let mut headers = std::collections::HashMap::new();
    while !bytes.is_empty() {
        let name_len = *bytes.first()? as usize;
        bytes = &bytes[1..];
        if bytes.len() < name_len + 1 {
            return None;
        }
        let name = String::from_utf8_lossy(&bytes[..name_len]).to_string();
        bytes = &bytes[name_len..];
        let value_type = bytes[0];
        bytes = &bytes[1..];

        match value_type {
            0 | 1 => {
                headers.insert(name, (value_type == 0).to_string());
            }
            2 => {
                bytes = bytes.get(1..)?;
            }
            3 => {
                bytes = bytes.get(2..)?;
            }
            4 => {
                bytes = bytes.get(4..)?;
            }
            5 | 8 => {
                bytes = bytes.get(8..)?;
            }
            9 => {
                bytes = bytes.get(16..)?;
            }
            6 | 7 => {
                if bytes.len() < 2 {
                    return None;
                }
                let value_len = u16::from_be_bytes(bytes[0..2].try_into().ok()?) as usize;
                bytes = &bytes[2..];
                if bytes.len() < value_len {
                    return None;
                }
                if value_type == 7 {
                    headers.insert(name, String::from_utf8_lossy(&bytes[..value_len]).to_string());
                }
                bytes = &bytes[value_len..];
            }
            _ => return None,
        }
    }
    Some(headers)
}

/// Bedrock wraps each chunk event's real payload as
/// `{"bytes": "<base64 JSON>", "p": "..."}`; decode that envelope when
/// present, falling back to parsing the payload directly as JSON (the shape
/// exception events use).
fn decode_payload(bytes: &[u8]) -> Option<Value> {
    let outer: Value = serde_json::from_slice(bytes).ok()?;
    if let Some(encoded) = outer.get("bytes").and_then(|v| v.as_str()) {
        let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).ok()?;
        return serde_json::from_slice(&decoded).ok();
    }
    Some(outer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn string_header(name: &str, value: &str) -> Vec<u8> {
        let mut out = vec![name.len() as u8];
        out.extend_from_slice(name.as_bytes());
        out.push(7);
        out.extend_from_slice(&(value.len() as u16).to_be_bytes());
        out.extend_from_slice(value.as_bytes());
        out
    }

    fn build_frame(event_type: &str, payload_json: &str) -> Vec<u8> {
        let headers = string_header(":event-type", event_type);
        let envelope = serde_json::json!({
            "bytes": base64::engine::general_purpose::STANDARD.encode(payload_json),
        });
        let payload = serde_json::to_vec(&envelope).unwrap();

        let total_length = PRELUDE_LEN + headers.len() + payload.len() + TRAILING_CRC_LEN;
        let mut frame = Vec::with_capacity(total_length);
        frame.extend_from_slice(&(total_length as u32).to_be_bytes());
        frame.extend_from_slice(&(headers.len() as u32).to_be_bytes());
        frame.extend_from_slice(&0u32.to_be_bytes()); // prelude crc, unchecked
        frame.extend_from_slice(&headers);
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&0u32.to_be_bytes()); // message crc, unchecked
        frame
    }

    #[test]
    fn decodes_a_single_complete_frame() {
        let raw = build_frame("chunk", r#"{"type":"content_block_delta"}"#);
        let mut buf = BytesMut::from(&raw[..]);
        let frame = try_take_frame(&mut buf).unwrap();
        let event = decode_frame(&frame).unwrap();
        assert_eq!(event.event_type, "chunk");
        assert_eq!(event.payload["type"], "content_block_delta");
        assert!(buf.is_empty());
    }

    #[test]
    fn returns_none_until_full_frame_has_arrived() {
        let raw = build_frame("chunk", r#"{"a":1}"#);
        let mut buf = BytesMut::from(&raw[..raw.len() - 1]);
        assert!(try_take_frame(&mut buf).is_none());
        buf.extend_from_slice(&raw[raw.len() - 1..]);
        assert!(try_take_frame(&mut buf).is_some());
    }

    #[test]
    fn parses_two_frames_concatenated_in_one_buffer() {
        let mut raw = build_frame("chunk", r#"{"n":1}"#);
        raw.extend(build_frame("chunk", r#"{"n":2}"#));
        let mut buf = BytesMut::from(&raw[..]);

        let first = decode_frame(&try_take_frame(&mut buf).unwrap()).unwrap();
        let second = decode_frame(&try_take_frame(&mut buf).unwrap()).unwrap();
        assert_eq!(first.payload["n"], 1);
        assert_eq!(second.payload["n"], 2);
        assert!(buf.is_empty());
    }
}
