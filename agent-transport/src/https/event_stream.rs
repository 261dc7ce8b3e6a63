//! Incremental decoder for `text/event-stream` bodies.

use agent_primitives::RemoteError;
use bytes::{Buf, BytesMut};
use serde_json::Value;

use crate::error::TransportError;

const DONE_SENTINEL: &str = "[DONE]";

/// One dispatched server-sent event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ServerEvent {
    event: Option<String>,
    data: String,
    id: Option<String>,
}

impl ServerEvent {
    pub(crate) fn event(&self) -> Option<&str> {
        self.event.as_deref()
    }

    pub(crate) fn data(&self) -> &str {
        &self.data
    }

    pub(crate) fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }
}

/// What a decoded event means for the chunk sequence.
#[derive(Debug)]
pub(crate) enum EventSignal {
    Chunk(Value),
    Failed(TransportError),
    Done,
    Skip,
}

/// Maps an event onto the chunk sequence.
///
/// `error` events terminate the stream with the remote failure, `complete`
/// and `done` events (or a `[DONE]` payload) end it cleanly. Payloads that are
/// not JSON are delivered as strings.
pub(crate) fn interpret(event: &ServerEvent) -> EventSignal {
    let data = event.data().trim();
    match event.event() {
        Some("error") => {
            let detail = parse_data(data);
            EventSignal::Failed(TransportError::remote(RemoteError::from_value(&detail)))
        }
        Some("complete" | "done") => EventSignal::Done,
        _ if data == DONE_SENTINEL => EventSignal::Done,
        _ if data.is_empty() => EventSignal::Skip,
        _ => EventSignal::Chunk(parse_data(data)),
    }
}

fn parse_data(data: &str) -> Value {
    serde_json::from_str(data).unwrap_or_else(|_| Value::String(data.to_owned()))
}

#[derive(Debug, Default)]
struct PartialEvent {
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

/// Line-oriented decoder tolerant of events split across body frames.
#[derive(Debug, Default)]
pub(crate) struct EventStreamDecoder {
    buffer: BytesMut,
    current: PartialEvent,
}

impl EventStreamDecoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Feeds body bytes, returning every event completed by them.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<ServerEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some((line_len, terminator_len)) = self.next_line() {
            let line = self.buffer.split_to(line_len);
            self.buffer.advance(terminator_len);
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }

        events
    }

    /// Flushes a trailing event left without its blank-line terminator once
    /// the body ends.
    pub(crate) fn finish(&mut self) -> Option<ServerEvent> {
        if !self.buffer.is_empty() {
            let rest = self.buffer.split();
            let line = String::from_utf8_lossy(&rest);
            let line = line.trim_end_matches('\r').to_owned();
            if let Some(event) = self.process_line(&line) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    /// Returns `(line length, terminator length)` for the next complete line.
    fn next_line(&self) -> Option<(usize, usize)> {
        let position = self.buffer.iter().position(|b| *b == b'\n' || *b == b'\r')?;
        if self.buffer[position] == b'\n' {
            return Some((position, 1));
        }
        // A trailing CR may be the first half of CRLF.
        match self.buffer.get(position + 1) {
            Some(b'\n') => Some((position, 2)),
            Some(_) => Some((position, 1)),
            None => None,
        }
    }

    fn process_line(&mut self, line: &str) -> Option<ServerEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "data" => self.current.data.push(value.to_owned()),
            "event" => self.current.event = Some(value.to_owned()),
            "id" => self.current.id = Some(value.to_owned()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<ServerEvent> {
        let partial = std::mem::take(&mut self.current);
        if partial.data.is_empty() && partial.event.is_none() {
            return None;
        }
        Some(ServerEvent {
            event: partial.event,
            data: partial.data.join("\n"),
            id: partial.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn events_split_across_frames_are_reassembled() {
        let mut decoder = EventStreamDecoder::new();
        assert!(decoder.push(b"data: {\"n\"").is_empty());
        assert!(decoder.push(b": 1}\r").is_empty());
        let events = decoder.push(b"\n\r\ndata: 2\n\n");

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data(), "{\"n\": 1}");
        assert_eq!(events[1].data(), "2");
    }

    #[test]
    fn multi_line_data_and_fields() {
        let mut decoder = EventStreamDecoder::new();
        let events = decoder.push(b": keep-alive\nid: 7\nevent: token\ndata: a\ndata: b\n\n");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event(), Some("token"));
        assert_eq!(events[0].id(), Some("7"));
        assert_eq!(events[0].data(), "a\nb");
    }

    #[test]
    fn finish_flushes_unterminated_event() {
        let mut decoder = EventStreamDecoder::new();
        assert!(decoder.push(b"data: last").is_empty());
        let event = decoder.finish().unwrap();
        assert_eq!(event.data(), "last");
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn interpretation_of_control_events() {
        let chunk = ServerEvent {
            data: "{\"text\":\"hi\"}".into(),
            ..ServerEvent::default()
        };
        assert!(matches!(interpret(&chunk), EventSignal::Chunk(v) if v == json!({"text": "hi"})));

        let plain = ServerEvent {
            data: "hello".into(),
            ..ServerEvent::default()
        };
        assert!(matches!(interpret(&plain), EventSignal::Chunk(Value::String(s)) if s == "hello"));

        let sentinel = ServerEvent {
            data: "[DONE]".into(),
            ..ServerEvent::default()
        };
        assert!(matches!(interpret(&sentinel), EventSignal::Done));

        let complete = ServerEvent {
            event: Some("complete".into()),
            ..ServerEvent::default()
        };
        assert!(matches!(interpret(&complete), EventSignal::Done));
    }

    #[test]
    fn error_events_carry_remote_detail() {
        let event = ServerEvent {
            event: Some("error".into()),
            data: "{\"type\":\"RateLimited\",\"message\":\"slow down\"}".into(),
            id: None,
        };
        let EventSignal::Failed(err) = interpret(&event) else {
            panic!("expected failure signal");
        };
        assert_eq!(err.kind(), ErrorKind::Invocation);
        assert_eq!(err.remote_error().unwrap().kind(), "RateLimited");
    }
}
