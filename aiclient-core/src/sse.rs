//! Incremental Server-Sent Events parser.
//!
//! Bytes arrive in arbitrary network chunks; the parser buffers partial lines
//! (including UTF-8 sequences split across chunks) and yields one [`SseItem`]
//! per completed frame, comment or `retry:` directive.
//!
//! ```text
//! event: completion
//! id: 42
//! data: {"text":"a"}
//!
//! : keep-alive
//! data: [DONE]
//!
//! ```

/// Event type used when a frame carries no `event:` field.
pub const DEFAULT_EVENT_TYPE: &str = "message";

/// One complete SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseMessage {
    pub event_type: String,
    pub data: String,
    pub last_event_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseItem {
    Event(SseMessage),
    Comment(String),
    /// Server-requested reconnection time in milliseconds.
    Retry(u64),
}

#[derive(Debug, Default)]
pub struct SseParser {
    pending: Vec<u8>,
    /// Prefix of `pending` already known to hold no newline.
    scanned: usize,
    event_type: String,
    data: String,
    has_data: bool,
    last_event_id: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; returns every item completed by them, in wire order.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseItem> {
        let mut pending = std::mem::take(&mut self.pending);
        pending.extend_from_slice(bytes);
        let mut out = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;
        while let Some(offset) = pending[from..].iter().position(|b| *b == b'\n') {
            let end = from + offset;
            let mut raw = &pending[start..end];
            if let Some(stripped) = raw.strip_suffix(b"\r") {
                raw = stripped;
            }
            let line = String::from_utf8_lossy(raw);
            if let Some(item) = self.process_line(&line) {
                out.push(item);
            }
            start = end + 1;
            from = start;
        }
        pending.drain(..start);
        self.scanned = pending.len();
        self.pending = pending;
        out
    }

    /// Id of the most recent frame that carried one; survives across frames.
    pub fn last_event_id(&self) -> &str {
        &self.last_event_id
    }

    fn process_line(&mut self, line: &str) -> Option<SseItem> {
        if line.is_empty() {
            return self.dispatch();
        }
        if let Some(comment) = line.strip_prefix(':') {
            return Some(SseItem::Comment(comment.trim_start().to_string()));
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => self.event_type = value.to_string(),
            "data" => {
                if self.has_data {
                    self.data.push('\n');
                }
                self.data.push_str(value);
                self.has_data = true;
            }
            "id" if !value.contains('\0') => self.last_event_id = value.to_string(),
            "retry" => {
                if let Ok(ms) = value.trim().parse::<u64>() {
                    return Some(SseItem::Retry(ms));
                }
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseItem> {
        let event_type = std::mem::take(&mut self.event_type);
        if !self.has_data {
            return None;
        }
        self.has_data = false;
        let data = std::mem::take(&mut self.data);
        let event_type = if event_type.is_empty() {
            DEFAULT_EVENT_TYPE.to_string()
        } else {
            event_type
        };
        Some(SseItem::Event(SseMessage {
            event_type,
            data,
            last_event_id: self.last_event_id.clone(),
        }))
    }
}
