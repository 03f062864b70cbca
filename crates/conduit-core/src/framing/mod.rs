//! Line framing for chunked subprocess output.
//!
//! Pipes deliver output in arbitrary chunks; [`LineFramer`] turns them into
//! whole lines. Splitting happens on the `\n` byte, so a multi-byte UTF-8
//! sequence is never cut in half by a line boundary.

/// Accumulates chunks and yields complete lines.
///
/// Lines are split on `\n` with a trailing `\r` removed. The unterminated
/// tail of the last chunk is kept and prepended to the next one; at process
/// end, [`LineFramer::flush`] hands it back. Whitespace-only lines are
/// returned as-is; filtering them is the caller's job.
#[derive(Debug, Default)]
pub struct LineFramer {
    /// Bytes after the last newline seen. Never contains `\n`.
    pending: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and return every line it completes, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        // `pending` holds no newline, so only the new bytes need scanning.
        let mut search_from = self.pending.len();
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.pending[search_from..].iter().position(|&b| b == b'\n') {
            let end = search_from + offset;
            lines.push(decode_line(&self.pending[start..end]));
            start = end + 1;
            search_from = start;
        }
        self.pending.drain(..start);
        lines
    }

    /// Take the unterminated remainder, if it holds anything but whitespace.
    pub fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let line = decode_line(&rest);
        if line.trim().is_empty() { None } else { Some(line) }
    }

    /// Number of buffered bytes not yet returned as a line.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}
