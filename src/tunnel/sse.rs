//! Event-stream line splitting.
//!
//! The local server's `text/event-stream` body arrives as arbitrary byte
//! chunks. [`LineDecoder`] reassembles them into lines so that each relay
//! `sse_event` carries exactly one line (`data: ...`, `event: ...`, `id: ...`).
//! Blank separator lines are not forwarded; the relay re-frames events.

/// Whether a `content-type` value denotes a Server-Sent-Events stream.
pub fn is_event_stream(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("text/event-stream"))
}

/// Incremental splitter for `\n` / `\r\n` terminated lines.
#[derive(Debug, Default)]
pub struct LineDecoder {
    pending: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(pos) = self.pending[start..].iter().position(|b| *b == b'\n') {
            let end = start + pos;
            if let Some(line) = Self::render(&self.pending[start..end]) {
                lines.push(line);
            }
            start = end + 1;
        }
        self.pending.drain(..start);
        lines
    }

    /// Return the unterminated tail, if any, once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        let tail = std::mem::take(&mut self.pending);
        Self::render(&tail)
    }

    fn render(raw: &[u8]) -> Option<String> {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        if raw.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(raw).into_owned())
        }
    }
}
