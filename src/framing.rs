// ABOUTME: Byte-to-line framer shared by the log reader and the process channel.
// ABOUTME: Buffers partial writes and yields complete newline-terminated lines.

use std::io::Read;

/// Accumulates raw bytes and splits out complete lines at `\n` boundaries.
///
/// Bytes after the last newline are buffered until more data arrives (or
/// [`LineFramer::finish`] is called), so a half-written JSON object is never
/// handed to a parser. Trailing `\r` is stripped; invalid UTF-8 is replaced
/// rather than dropped.
#[derive(Debug, Default)]
pub struct LineFramer {
    buf: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning every line completed by it.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop(); // the \n itself
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Drain whatever is buffered as a final, unterminated line.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let mut line = std::mem::take(&mut self.buf);
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

/// Read `reader` to end-of-stream, invoking `handler` once per line.
///
/// The final line is delivered even without a trailing newline. Returns the
/// number of bytes consumed.
pub fn decode_lines<R: Read>(
    mut reader: R,
    mut handler: impl FnMut(&str),
) -> std::io::Result<u64> {
    let mut framer = LineFramer::new();
    let mut chunk = [0u8; 8192];
    let mut consumed: u64 = 0;

    loop {
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        consumed += n as u64;
        for line in framer.push(&chunk[..n]) {
            handler(&line);
        }
    }
    if let Some(last) = framer.finish() {
        handler(&last);
    }
    Ok(consumed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framer_splits_complete_lines() {
        let mut framer = LineFramer::new();
        let lines = framer.push(b"one\ntwo\n");
        assert_eq!(lines, vec!["one", "two"]);
        assert!(framer.finish().is_none());
    }

    #[test]
    fn framer_buffers_partial_line_across_pushes() {
        let mut framer = LineFramer::new();
        assert!(framer.push(b"hel").is_empty());
        let lines = framer.push(b"lo\nwor");
        assert_eq!(lines, vec!["hello"]);
        assert_eq!(framer.push(b"ld\n"), vec!["world"]);
    }

    #[test]
    fn framer_strips_carriage_return() {
        let mut framer = LineFramer::new();
        assert_eq!(framer.push(b"a\r\nb\n"), vec!["a", "b"]);
    }

    #[test]
    fn framer_finish_yields_unterminated_tail() {
        let mut framer = LineFramer::new();
        assert!(framer.push(b"tail without newline").is_empty());
        assert_eq!(framer.finish().as_deref(), Some("tail without newline"));
        assert!(framer.finish().is_none());
    }

    #[test]
    fn decode_lines_handles_missing_trailing_newline() {
        let input = b"{\"a\":1}\n{\"b\":2}";
        let mut seen = Vec::new();
        let consumed = decode_lines(&input[..], |line| seen.push(line.to_string())).unwrap();
        assert_eq!(seen, vec!["{\"a\":1}", "{\"b\":2}"]);
        assert_eq!(consumed, input.len() as u64);
    }

    #[test]
    fn decode_lines_empty_input() {
        let mut seen = Vec::new();
        let consumed = decode_lines(&b""[..], |line| seen.push(line.to_string())).unwrap();
        assert!(seen.is_empty());
        assert_eq!(consumed, 0);
    }
}
