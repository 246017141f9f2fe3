//! Server-Sent Events wire format.
//!
//! The relay both produces SSE (downstream fan-out streams) and consumes it
//! (upstream big-segment stream), so the encoder and the incremental parser
//! live together here.

use bytes::Bytes;

/// A single SSE event, either parsed from an incoming stream or about to be
/// written to an outgoing one.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    /// Event type (from/for the `event:` field)
    pub event_type: Option<String>,
    /// Event data (`data:` field(s); multi-line data is joined with newlines)
    pub data: String,
    /// Event ID (`id:` field)
    pub id: Option<String>,
}

impl SseEvent {
    pub fn new(event_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event_type: Some(event_type.into()),
            data: data.into(),
            id: None,
        }
    }

    /// An event with data but no type, delivered to `onmessage` handlers.
    pub fn message(data: impl Into<String>) -> Self {
        Self {
            event_type: None,
            data: data.into(),
            id: None,
        }
    }

    /// Encodes the event as a wire frame, terminated by the blank line that
    /// delimits events.
    pub fn encode(&self) -> Bytes {
        let mut out = String::new();
        if let Some(id) = &self.id {
            out.push_str("id: ");
            out.push_str(id);
            out.push('\n');
        }
        if let Some(event_type) = &self.event_type {
            out.push_str("event: ");
            out.push_str(event_type);
            out.push('\n');
        }
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        Bytes::from(out)
    }
}

/// The comment frame written as a keepalive on idle connections. Clients
/// ignore comment lines, but intermediaries see traffic.
pub fn heartbeat_frame() -> Bytes {
    Bytes::from_static(b":\n\n")
}

/// Incremental SSE parser: feed it raw bytes as they arrive, get back any
/// events completed by those bytes. State carries over between feeds, so
/// events split across chunk boundaries are handled.
#[derive(Default)]
pub struct SseParser {
    buffer: String,
    event_type: Option<String>,
    data_lines: Vec<String>,
    id: Option<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        match std::str::from_utf8(bytes) {
            Ok(s) => self.buffer.push_str(s),
            Err(_) => {
                tracing::warn!("Received invalid UTF-8 in SSE stream; dropping chunk");
                return Vec::new();
            }
        }

        let mut events = Vec::new();
        while let Some(newline_pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline_pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                // Blank line ends the current event
                if !self.data_lines.is_empty() || self.event_type.is_some() {
                    events.push(SseEvent {
                        event_type: self.event_type.take(),
                        data: self.data_lines.join("\n"),
                        id: self.id.take(),
                    });
                    self.data_lines.clear();
                }
            } else if line.starts_with(':') {
                // Comment line (keepalive)
            } else if let Some(value) = line.strip_prefix("event:") {
                self.event_type = Some(value.trim().to_string());
            } else if let Some(value) = line.strip_prefix("data:") {
                // "data: value" and "data:value" are both legal
                let value = value.strip_prefix(' ').unwrap_or(value);
                self.data_lines.push(value.to_string());
            } else if let Some(value) = line.strip_prefix("id:") {
                self.id = Some(value.trim().to_string());
            }
            // Unknown fields are ignored per the SSE spec
        }

        events
    }

    /// Discards any partial state, e.g. before reconnecting.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
