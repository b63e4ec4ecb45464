use bytes::Bytes;
use serde_json::Value;

/// Field of a backend `data:` frame that carries the next text delta.
pub const DELTA_FIELD: &str = "data";

/// Completion sentinel used by both the backend and the chat protocol.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Splits a chunked byte stream into lines.
///
/// Bytes are buffered until a `\n` arrives, so multi-byte characters that
/// straddle chunk boundaries survive intact.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &Bytes) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }

        lines
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<String> {
        self.push_bytes(&Bytes::copy_from_slice(chunk.as_bytes()))
    }

    /// Flushes a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let mut line = std::mem::take(&mut self.buffer);
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

/// One classified backend line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendFrame {
    /// Empty line or `data:` with no payload.
    Blank,
    /// Anything not prefixed `data:` (comments, `event:` lines).
    Control,
    /// The literal completion sentinel.
    Done,
    Text(String),
    /// Valid JSON whose delta field is absent or not a string.
    NonText(String),
    /// `data:` payload that is not JSON.
    Malformed(String),
}

pub fn parse_frame(line: &str) -> BackendFrame {
    let line = line.trim_end_matches('\r');
    if line.trim().is_empty() {
        return BackendFrame::Blank;
    }
    let Some(payload) = line.strip_prefix("data:") else {
        return BackendFrame::Control;
    };
    let payload = payload.trim();
    if payload.is_empty() {
        return BackendFrame::Blank;
    }
    if payload == DONE_SENTINEL {
        return BackendFrame::Done;
    }
    match serde_json::from_str::<Value>(payload) {
        Ok(value) => match value.get(DELTA_FIELD) {
            Some(Value::String(text)) => BackendFrame::Text(text.clone()),
            _ => BackendFrame::NonText(payload.to_string()),
        },
        Err(_) => BackendFrame::Malformed(payload.to_string()),
    }
}
