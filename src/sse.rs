//! SSE stream decoder for provider responses.
//!
//! Handles the `data: ` prefix, optional `event:` names (Anthropic tags its
//! frames), `[DONE]` termination, line buffering across TCP chunk
//! boundaries, and empty keep-alive lines.

use serde_json::Value;

/// One decoded SSE frame.
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    /// The `event:` name preceding the data line, when present.
    pub event: Option<String>,
    /// The parsed `data:` payload.
    pub data: Value,
}

/// Incremental SSE decoder.
///
/// Feed raw bytes as they arrive; complete frames come out. The decoder is
/// tolerant of frames split anywhere, including mid-line.
///
/// # Example
///
/// ```
/// use model_relay::sse::SseDecoder;
///
/// let mut decoder = SseDecoder::new();
/// let frames = decoder.decode(b"data: {\"delta\":\"hi\"}\n\ndata: [DONE]\n\n");
/// assert_eq!(frames.len(), 1);
/// assert!(decoder.finished());
/// ```
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    pending_event: Option<String>,
    finished: bool,
}

impl SseDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a `[DONE]` terminator has been observed.
    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Feed raw bytes; returns every frame completed by this chunk.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            self.consume_line(line.trim(), &mut frames);
        }
        frames
    }

    /// Flush trailing buffer content after the stream ends.
    pub fn flush(&mut self) -> Vec<SseFrame> {
        let remaining = std::mem::take(&mut self.buffer);
        let mut frames = Vec::new();
        for line in remaining.lines() {
            self.consume_line(line.trim(), &mut frames);
        }
        frames
    }

    fn consume_line(&mut self, line: &str, frames: &mut Vec<SseFrame>) {
        if line.is_empty() {
            return;
        }
        if let Some(name) = line.strip_prefix("event:") {
            self.pending_event = Some(name.trim().to_string());
            return;
        }
        let Some(data) = line
            .strip_prefix("data: ")
            .or_else(|| line.strip_prefix("data:"))
        else {
            // Comment lines (`: keep-alive`) and anything unrecognized.
            return;
        };
        let data = data.trim();
        if data == "[DONE]" {
            self.finished = true;
            self.pending_event = None;
            return;
        }
        if let Ok(value) = serde_json::from_str::<Value>(data) {
            frames.push(SseFrame {
                event: self.pending_event.take(),
                data: value,
            });
        }
    }
}
