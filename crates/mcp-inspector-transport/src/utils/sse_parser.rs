use bytes::{Bytes, BytesMut};
use core::fmt;

const BUFFER_CAPACITY: usize = 1024;

/// A single Server-Sent Event.
///
/// `Display` renders the `event:` / `data:` / blank-line framing of the
/// text/event-stream grammar, so the same type serves both for parsing
/// upstream streams and for writing the broker's own event stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseEvent {
    /// The optional event type (e.g. "message").
    pub event: Option<String>,
    /// The data payload. MCP payloads are single-line JSON; multi-line data
    /// is joined with `\n` per the SSE specification.
    pub data: Option<String>,
    /// The optional event ID used for resumption.
    pub id: Option<String>,
    /// Optional reconnection retry interval (in milliseconds).
    pub retry: Option<u64>,
}

impl SseEvent {
    /// Creates a new `SseEvent` with the given string data.
    pub fn new<T: Into<String>>(data: T) -> Self {
        Self {
            data: Some(data.into()),
            ..Self::default()
        }
    }

    /// Sets the event name (e.g. "message").
    pub fn with_event<T: Into<String>>(mut self, event: T) -> Self {
        self.event = Some(event.into());
        self
    }

    /// Sets the ID of the event.
    pub fn with_id<T: Into<String>>(mut self, id: T) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn as_bytes(&self) -> Bytes {
        Bytes::from(self.to_string())
    }
}

impl fmt::Display for SseEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(retry) = self.retry {
            writeln!(f, "retry: {retry}")?;
        }
        if let Some(id) = &self.id {
            writeln!(f, "id: {id}")?;
        }
        if let Some(event) = &self.event {
            writeln!(f, "event: {event}")?;
        }
        if let Some(data) = &self.data {
            for line in data.lines() {
                writeln!(f, "data: {line}")?;
            }
        }
        // Blank line terminates the event.
        writeln!(f)
    }
}

/// Incremental parser turning byte chunks into [`SseEvent`]s.
///
/// Partial lines and partial events survive across chunks in the internal
/// buffer; comment lines (`:`) and unknown fields are skipped.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: BytesMut,
    event: Option<String>,
    id: Option<String>,
    retry: Option<u64>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(BUFFER_CAPACITY),
            ..Self::default()
        }
    }

    /// Appends a chunk and returns every event completed by it.
    pub fn process_chunk(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line = self.buffer.split_to(pos + 1);
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(event) = self.process_line(line) {
                events.push(event);
            }
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.take_event();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            // A line with no colon is a field name with an empty value.
            None => (line, ""),
        };

        match field {
            "data" => self.data_lines.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            "retry" => self.retry = value.trim().parse().ok(),
            _ => {}
        }
        None
    }

    fn take_event(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        let id = self.id.take();
        let retry = self.retry.take();
        let data_lines = std::mem::take(&mut self.data_lines);

        // An event with no data field is a no-op per the SSE grammar.
        if data_lines.is_empty() {
            return None;
        }

        Some(SseEvent {
            event,
            data: Some(data_lines.join("\n")),
            id,
            retry,
        })
    }
}
