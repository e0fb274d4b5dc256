//! Incremental parser for OpenAI-style server-sent events

use serde_json::Value;

/// One decoded stream event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// Text delta from `choices[0].delta.content`
    Delta(String),
    /// `data: [DONE]`
    Done,
    /// The provider stopped generation on a content filter
    ContentFilter,
    /// An error object sent in-band
    Error(String),
}

/// Line-buffered SSE decoder
///
/// Bytes may arrive split anywhere, including inside a UTF-8 sequence;
/// only complete lines are decoded.
#[derive(Debug, Default)]
pub struct SseParser {
    buf: Vec<u8>,
}

impl SseParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every event completed by them
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buf.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = parse_line(line.trim()) {
                events.push(event);
            }
        }
        events
    }

    /// Decode whatever is left once the body ends without a newline
    pub fn finish(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buf);
        let line = String::from_utf8_lossy(&rest);
        parse_line(line.trim())
    }
}

/// Decode a single trimmed line
#[must_use]
pub fn parse_line(line: &str) -> Option<SseEvent> {
    let data = line.strip_prefix("data:")?.trim_start();
    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }

    let v: Value = serde_json::from_str(data).ok()?;

    if let Some(err) = v.get("error") {
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| err.to_string(), str::to_string);
        return Some(SseEvent::Error(message));
    }

    let choice = v.get("choices")?.get(0)?;
    if choice.get("finish_reason").and_then(Value::as_str) == Some("content_filter") {
        return Some(SseEvent::ContentFilter);
    }

    choice
        .get("delta")
        .and_then(|d| d.get("content"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(|s| SseEvent::Delta(s.to_string()))
}

/// Extract the reply text from a non-streaming completion body
#[must_use]
pub fn completion_text(body: &Value) -> Option<&str> {
    body.get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()
}
