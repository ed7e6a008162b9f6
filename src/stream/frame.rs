//! Server-sent event framing and payload decoding.
//!
//! The parser accepts arbitrary byte chunks from a streaming HTTP body and
//! yields complete events:
//! - `data:` lines contain the payload (may span multiple lines)
//! - `event:` and `id:` lines are kept on the event
//! - empty lines delimit events
//! - lines starting with `:` are comments (keep-alives)
//! - `retry:` is ignored; the reconnect delay is a client-side policy
//!
//! An event is only dispatched when it carried at least one `data:` line.

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Longest line the parser buffers before giving up on the connection.
pub const MAX_LINE_LEN: usize = 1 << 20;

/// A complete event read off the stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type from the `event:` field.
    pub event_type: Option<String>,
    /// Payload from the `data:` field(s), joined with newlines.
    pub data: String,
    /// Event id from the `id:` field.
    pub id: Option<String>,
}

impl SseEvent {
    /// Whether this is an unnamed (or explicitly `message`) event, the only
    /// kind a stream subscription delivers as a payload.
    pub fn is_message(&self) -> bool {
        self.event_type.as_deref().map_or(true, |kind| kind == "message")
    }
}

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SseError {
    #[error("invalid utf-8 in event stream line")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("event stream line exceeds {limit} bytes")]
    LineTooLong { limit: usize },
}

/// Incremental SSE parser.
///
/// Bytes are buffered until a full line is available, so a multi-byte UTF-8
/// sequence split across chunks decodes correctly.
#[derive(Debug)]
pub struct SseParser {
    buffer: Vec<u8>,
    max_line_len: usize,
    event_type: Option<String>,
    data: Vec<String>,
    saw_data: bool,
    id: Option<String>,
}

impl Default for SseParser {
    fn default() -> Self {
        Self::with_max_line_len(MAX_LINE_LEN)
    }
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line_len(max_line_len: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_line_len,
            event_type: None,
            data: Vec::new(),
            saw_data: false,
            id: None,
        }
    }

    /// Feeds a chunk and returns every event it completes.
    ///
    /// Fails when a complete line is not valid UTF-8 or a line grows past the
    /// length limit. The parser state is unspecified after an error; callers
    /// drop the connection.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<SseEvent>, SseError> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        let mut consumed = 0;

        while let Some(offset) = self.buffer[consumed..].iter().position(|b| *b == b'\n') {
            let end = consumed + offset;
            if offset > self.max_line_len {
                return Err(SseError::LineTooLong {
                    limit: self.max_line_len,
                });
            }
            let line = std::str::from_utf8(&self.buffer[consumed..end])?;
            let line = line.strip_suffix('\r').unwrap_or(line).to_string();
            consumed = end + 1;

            if let Some(event) = self.apply_line(&line) {
                events.push(event);
            }
        }

        self.buffer.drain(..consumed);
        if self.buffer.len() > self.max_line_len {
            return Err(SseError::LineTooLong {
                limit: self.max_line_len,
            });
        }
        Ok(events)
    }

    /// Drops buffered bytes and any partially built event.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.event_type = None;
        self.data.clear();
        self.saw_data = false;
        self.id = None;
    }

    fn apply_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            if !std::mem::take(&mut self.saw_data) {
                self.event_type = None;
                self.id = None;
                return None;
            }
            return Some(SseEvent {
                event_type: self.event_type.take(),
                data: std::mem::take(&mut self.data).join("\n"),
                id: self.id.take(),
            });
        }

        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "data" => {
                self.data.push(value.to_string());
                self.saw_data = true;
            }
            "event" => self.event_type = Some(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
        None
    }
}

/// Latest value published by a stream client.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    /// Frame decoded as JSON.
    Json(Value),
    /// Frame that was not valid JSON, kept verbatim.
    Text(String),
}

impl Payload {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Json(_) => None,
            Self::Text(text) => Some(text),
        }
    }
}

/// Decodes a text frame, falling back to the raw text when it is not JSON.
pub fn decode_payload(frame: &str) -> Payload {
    match serde_json::from_str(frame) {
        Ok(value) => Payload::Json(value),
        Err(err) => {
            debug!(event = "payload_not_json", error = %err, len = frame.len());
            Payload::Text(frame.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{decode_payload, Payload, SseError, SseParser};

    #[test]
    fn parses_single_data_event() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: {\"status\":\"ok\"}\n\n").expect("utf8");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, r#"{"status":"ok"}"#);
        assert_eq!(events[0].event_type, None);
    }

    #[test]
    fn joins_multiline_data() {
        let mut parser = SseParser::new();
        let events = parser
            .feed(b"event: log\ndata: line1\ndata: line2\n\n")
            .expect("utf8");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type.as_deref(), Some("log"));
        assert_eq!(events[0].data, "line1\nline2");
    }

    #[test]
    fn completes_event_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"id: 7\nda").expect("utf8").is_empty());

        let events = parser.feed(b"ta: hello\n\n").expect("utf8");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hello");
        assert_eq!(events[0].id.as_deref(), Some("7"));
    }

    #[test]
    fn keeps_utf8_sequence_split_between_chunks() {
        let bytes = "data: caf\u{e9}\n\n".as_bytes();
        let split = bytes.len() - 3;
        let mut parser = SseParser::new();

        assert!(parser.feed(&bytes[..split]).expect("utf8").is_empty());
        let events = parser.feed(&bytes[split..]).expect("utf8");
        assert_eq!(events[0].data, "caf\u{e9}");
    }

    #[test]
    fn ignores_comments_and_retry() {
        let mut parser = SseParser::new();
        let events = parser
            .feed(b": keep-alive\n\nretry: 100\ndata:no-space\n\n")
            .expect("utf8");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "no-space");
    }

    #[test]
    fn accepts_crlf_line_endings() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: a\r\n\r\ndata: b\r\n\r\n").expect("utf8");

        let data: Vec<_> = events.iter().map(|event| event.data.as_str()).collect();
        assert_eq!(data, ["a", "b"]);
    }

    #[test]
    fn rejects_invalid_utf8_line() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: \xff\xfe\n\n").is_err());
    }

    #[test]
    fn reset_discards_partial_event() {
        let mut parser = SseParser::new();
        parser.feed(b"data: partial\n").expect("utf8");
        parser.reset();

        let events = parser.feed(b"data: fresh\n\n").expect("utf8");
        assert_eq!(events[0].data, "fresh");
    }

    #[test]
    fn skips_events_without_data_lines() {
        let mut parser = SseParser::new();
        let events = parser
            .feed(b"event: ping\n\nid: 3\n\ndata:\n\n")
            .expect("utf8");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "");
        assert_eq!(events[0].event_type, None);
        assert_eq!(events[0].id, None);
        assert!(events[0].is_message());
    }

    #[test]
    fn named_events_are_not_messages() {
        let mut parser = SseParser::new();
        let events = parser
            .feed(b"event: log\ndata: a\n\nevent: message\ndata: b\n\n")
            .expect("utf8");

        assert!(!events[0].is_message());
        assert!(events[1].is_message());
    }

    #[test]
    fn rejects_line_past_limit() {
        let mut parser = SseParser::with_max_line_len(8);
        assert!(parser.feed(b"data: ok\n\n").is_ok());
        assert_eq!(
            parser.feed(b"data: 0123"),
            Err(SseError::LineTooLong { limit: 8 })
        );

        let mut parser = SseParser::with_max_line_len(8);
        assert_eq!(
            parser.feed(b"data: 0123456789\n\n"),
            Err(SseError::LineTooLong { limit: 8 })
        );
    }

    #[test]
    fn decode_prefers_json_and_falls_back_to_text() {
        assert_eq!(
            decode_payload(r#"{"status":"ok"}"#),
            Payload::Json(json!({"status": "ok"}))
        );
        assert_eq!(
            decode_payload("plainly not json"),
            Payload::Text("plainly not json".to_string())
        );
    }
}
