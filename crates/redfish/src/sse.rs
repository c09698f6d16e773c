//! Incremental parser for server-sent-event streams.
//!
//! BMCs frame telemetry as `id:` / `event:` / `data:` records separated by a
//! blank line. Chunks arrive at arbitrary boundaries, so the parser keeps the
//! unterminated tail buffered and emits a frame only once its blank-line
//! terminator has been seen.

/// One complete SSE frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Frame {
    pub id: String,
    pub event: String,
    pub data: String,
}

#[derive(Debug, Default)]
pub struct FrameParser {
    buf: String,
    id: String,
    event: String,
    data: Vec<String>,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning every frame completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));

        let mut frames = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            self.line(line.trim_end_matches(['\r', '\n']), &mut frames);
        }
        frames
    }

    fn line(&mut self, line: &str, frames: &mut Vec<Frame>) {
        if line.is_empty() {
            if !self.data.is_empty() {
                frames.push(Frame {
                    id: std::mem::take(&mut self.id),
                    event: std::mem::take(&mut self.event),
                    data: std::mem::take(&mut self.data).join("\n"),
                });
            }
            self.id.clear();
            self.event.clear();
            return;
        }
        if line.starts_with(':') {
            // keep-alive comment
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "id" => self.id = value.to_string(),
            "event" => self.event = value.to_string(),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_complete_frame() {
        let mut parser = FrameParser::new();
        let frames = parser.push(b"id: 7\nevent: metric\ndata: {\"Id\":\"x\"}\n\n");
        assert_eq!(
            frames,
            vec![Frame {
                id: "7".into(),
                event: "metric".into(),
                data: "{\"Id\":\"x\"}".into(),
            }]
        );
    }

    #[test]
    fn frames_survive_arbitrary_chunk_boundaries() {
        let raw = b"id: 1\ndata: {\"a\":1}\n\nid: 2\ndata: {\"b\":2}\n\n";
        for split in 1..raw.len() - 1 {
            let mut parser = FrameParser::new();
            let mut frames = parser.push(&raw[..split]);
            frames.extend(parser.push(&raw[split..]));
            assert_eq!(frames.len(), 2, "split at {split}");
            assert_eq!(frames[0].data, "{\"a\":1}");
            assert_eq!(frames[1].data, "{\"b\":2}");
        }
    }

    #[test]
    fn multi_line_data_is_joined() {
        let mut parser = FrameParser::new();
        let frames = parser.push(b"data: line one\ndata: line two\n\n");
        assert_eq!(frames[0].data, "line one\nline two");
    }

    #[test]
    fn crlf_endings_and_comments_are_tolerated() {
        let mut parser = FrameParser::new();
        let frames = parser.push(b": keep-alive\r\nid: 3\r\ndata: body\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id, "3");
        assert_eq!(frames[0].data, "body");
    }

    #[test]
    fn blank_lines_without_data_emit_nothing() {
        let mut parser = FrameParser::new();
        assert!(parser.push(b"\n\n\n").is_empty());
        assert!(parser.push(b"id: lone\n\n").is_empty());
    }

    #[test]
    fn incomplete_tail_is_held_back() {
        let mut parser = FrameParser::new();
        assert!(parser.push(b"data: partial").is_empty());
        let frames = parser.push(b" body\n\n");
        assert_eq!(frames[0].data, "partial body");
    }
}
