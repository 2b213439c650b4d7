//! Server-Sent Events framing.
//!
//! Frames are written as `event: <type>\ndata: <json>\n\n`. The decoder is
//! incremental: network chunks may split a frame (or a UTF-8 sequence) at any
//! byte, so bytes are buffered until a full line is available.

/// A single dispatched SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

impl SseFrame {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }

    /// Serialize to wire text. Multi-line data is split across `data:` lines.
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(self.data.len() + self.event.len() + 16);
        out.push_str("event: ");
        out.push_str(&self.event);
        out.push('\n');
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out
    }
}

/// Incremental parser for SSE byte streams.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed arbitrary bytes and drain every frame completed by them.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            if let Some(frame) = self.process_line(&line) {
                frames.push(frame);
            }
        }

        frames
    }

    /// Flush a trailing frame when the stream ends without a blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest).into_owned();
            let line = line.trim_end_matches('\r').to_string();
            self.process_line(&line);
        }
        self.dispatch()
    }

    pub fn is_idle(&self) -> bool {
        self.buffer.is_empty() && self.data.is_empty() && self.event.is_none()
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        // Comment line, used for keep-alives.
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame {
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_matches_wire_format() {
        let frame = SseFrame::new("result", r#"{"type":"result"}"#);
        assert_eq!(frame.encode(), "event: result\ndata: {\"type\":\"result\"}\n\n");
    }

    #[test]
    fn decodes_frames_split_at_every_byte() {
        let wire = format!(
            "{}{}",
            SseFrame::new("assistant", "{\"a\":1}").encode(),
            SseFrame::new("result", "{\"b\":\"é\"}").encode()
        );
        let mut decoder = SseDecoder::new();
        let mut frames = Vec::new();
        for byte in wire.as_bytes() {
            frames.extend(decoder.feed(std::slice::from_ref(byte)));
        }
        assert_eq!(
            frames,
            vec![
                SseFrame::new("assistant", "{\"a\":1}"),
                SseFrame::new("result", "{\"b\":\"é\"}"),
            ]
        );
        assert!(decoder.is_idle());
    }

    #[test]
    fn ignores_comments_and_handles_crlf() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed(b": keep-alive\r\n\r\nevent: system\r\ndata: {}\r\n\r\n");
        assert_eq!(frames, vec![SseFrame::new("system", "{}")]);
    }

    #[test]
    fn multi_line_data_is_joined() {
        let frame = SseFrame::new("error", "line one\nline two");
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed(frame.encode().as_bytes());
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn missing_event_defaults_to_message_and_finish_flushes() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: hello").is_empty());
        assert_eq!(decoder.finish(), Some(SseFrame::new("message", "hello")));
        assert!(decoder.finish().is_none());
    }
}
