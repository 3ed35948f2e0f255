//! Incremental server-sent-event line decoder.
//!
//! Network reads are pushed as raw bytes. Only complete lines are decoded;
//! the unterminated tail stays buffered and is prefixed onto the next read,
//! so neither a `data:` line nor a multi-byte UTF-8 character is ever
//! parsed in halves.

/// A decoded SSE line that carries meaning for the completion client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// Payload of a `data:` line.
    Data(String),
    /// The `data: [DONE]` sentinel.
    Done,
}

const DONE_SENTINEL: &str = "[DONE]";

/// Buffers partial lines across reads.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one network read and return the events of every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.pending.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            if let Some(event) = decode_line(&line[..line.len() - 1]) {
                events.push(event);
            }
        }
        events
    }

    /// Decode whatever is left once the stream has closed.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if self.pending.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.pending);
        decode_line(&line)
    }

    /// Bytes waiting for their terminating newline.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

fn decode_line(raw: &[u8]) -> Option<SseEvent> {
    let line = String::from_utf8_lossy(raw);
    let line = line.strip_suffix('\r').unwrap_or(&line);

    if line.is_empty() || line.starts_with(':') {
        return None;
    }

    let payload = line.strip_prefix("data:")?;
    let payload = payload.strip_prefix(' ').unwrap_or(payload).trim_end();
    if payload == DONE_SENTINEL {
        Some(SseEvent::Done)
    } else if payload.is_empty() {
        None
    } else {
        Some(SseEvent::Data(payload.to_string()))
    }
}
