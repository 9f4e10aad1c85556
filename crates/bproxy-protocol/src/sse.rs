use bytes::Bytes;

/// Incremental parser for `data:`-only server-sent-event streams, the framing
/// Gemini uses for `streamGenerateContent?alt=sse`. Event names and comments
/// are skipped; each completed event yields its joined data payload.
#[derive(Debug, Default)]
pub struct SseDataParser {
    buffer: String,
    data_lines: Vec<String>,
}

impl SseDataParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut payloads = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let mut line = self.buffer[..pos].to_string();
            self.buffer.drain(..=pos);
            if line.ends_with('\r') {
                line.pop();
            }

            if line.is_empty() {
                self.flush_event(&mut payloads);
            } else if let Some(value) = strip_data_prefix(&line) {
                self.data_lines.push(value.to_string());
            }
        }

        payloads
    }

    /// Drain whatever is buffered, treating a trailing unterminated line as a
    /// final data line. Streams cut off mid-event still surface their payload.
    pub fn finish(&mut self) -> Vec<String> {
        if !self.buffer.is_empty() {
            let mut line = std::mem::take(&mut self.buffer);
            if line.ends_with('\r') {
                line.pop();
            }
            if let Some(value) = strip_data_prefix(&line) {
                self.data_lines.push(value.to_string());
            }
        }
        let mut payloads = Vec::new();
        self.flush_event(&mut payloads);
        payloads
    }

    fn flush_event(&mut self, payloads: &mut Vec<String>) {
        if self.data_lines.is_empty() {
            return;
        }
        payloads.push(self.data_lines.join("\n"));
        self.data_lines.clear();
    }
}

fn strip_data_prefix(line: &str) -> Option<&str> {
    if line.starts_with(':') {
        return None;
    }
    let value = line.strip_prefix("data:")?;
    Some(value.strip_prefix(' ').unwrap_or(value))
}

/// Strip a leading `data: ` prefix from a single already-framed SSE payload.
/// Relay chunks usually arrive one frame at a time; this covers the common
/// case without a stateful parse.
pub fn strip_sse_frame(frame: &str) -> &str {
    let trimmed = frame.trim();
    trimmed
        .strip_prefix("data:")
        .map(|rest| rest.trim_start())
        .unwrap_or(trimmed)
}

/// Encode one `data:` SSE frame. Multi-line payloads get one `data:` line per
/// input line, per the SSE framing rules.
pub fn encode_data_frame(payload: &str) -> Bytes {
    let mut out = String::with_capacity(payload.len() + 16);
    for line in payload.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    Bytes::from(out)
}

pub fn done_frame() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}

pub fn keep_alive_frame() -> Bytes {
    Bytes::from_static(b": keep-alive\n\n")
}
