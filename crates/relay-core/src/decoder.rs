//! Incremental line decoder for upstream event streams.
//!
//! Raw chunks arrive split at arbitrary byte offsets (including inside a
//! multi-byte character). The decoder buffers bytes, not text, so a line is
//! only converted once its terminating `\n` has been seen.

use std::borrow::Cow;

use tracing::debug;

use crate::errors::DecodeError;

/// Prefix that marks payload-bearing lines. Every other line (`event:`,
/// `: keep-alive`, blank separators) is transport noise.
pub const DATA_PREFIX: &str = "data:";

/// One complete payload-bearing line, prefix included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedLine(String);

impl DecodedLine {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Line contents after the `data:` prefix and any leading whitespace.
    pub fn payload(&self) -> &str {
        self.0
            .strip_prefix(DATA_PREFIX)
            .unwrap_or(&self.0)
            .trim_start()
    }
}

/// Per-session line buffer.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Prefix of `buf` already known to hold no `\n`.
    scanned: usize,
    max_line_bytes: usize,
}

impl FrameDecoder {
    /// Creates a decoder that refuses to buffer a partial line longer than
    /// `max_line_bytes`.
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            max_line_bytes,
        }
    }

    /// Appends `chunk` and returns every payload line it completed, in order.
    ///
    /// An oversized partial line is reported on the first call that has no
    /// completed lines to hand back, so lines finished by the same chunk are
    /// never lost. The buffer stays within `max_line_bytes` plus one chunk.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<DecodedLine>, DecodeError> {
        if self.buf.len() > self.max_line_bytes {
            return Err(self.too_long());
        }
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        let mut search_from = self.scanned;
        while let Some(offset) = self.buf[search_from..].iter().position(|b| *b == b'\n') {
            let end = search_from + offset;
            if let Some(line) = decode_line(&self.buf[start..end]) {
                lines.push(line);
            }
            start = end + 1;
            search_from = start;
        }
        if start > 0 {
            self.buf.drain(..start);
        }
        self.scanned = self.buf.len();

        if lines.is_empty() && self.buf.len() > self.max_line_bytes {
            return Err(self.too_long());
        }
        Ok(lines)
    }

    /// Ends the stream. A trailing unterminated line carries no reliable
    /// payload and is discarded; returns how many bytes were dropped.
    pub fn flush(&mut self) -> usize {
        let dropped = self.buf.len();
        self.buf.clear();
        self.scanned = 0;
        dropped
    }

    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }

    fn too_long(&self) -> DecodeError {
        DecodeError::LineTooLong {
            limit: self.max_line_bytes,
        }
    }
}

fn decode_line(bytes: &[u8]) -> Option<DecodedLine> {
    let text = String::from_utf8_lossy(bytes);
    if let Cow::Owned(_) = text {
        debug!(bytes = bytes.len(), "replaced invalid UTF-8 in upstream line");
    }
    let line = text.trim_end_matches('\r');
    if line.is_empty() || !line.starts_with(DATA_PREFIX) {
        return None;
    }
    Some(DecodedLine(line.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: usize = 1024;

    fn feed_all(chunks: &[&[u8]]) -> Vec<String> {
        let mut decoder = FrameDecoder::new(LIMIT);
        let mut out = Vec::new();
        for chunk in chunks {
            for line in decoder.feed(chunk).expect("within limit") {
                out.push(line.payload().to_string());
            }
        }
        out
    }

    #[test]
    fn partial_line_is_held_until_newline() {
        let mut decoder = FrameDecoder::new(LIMIT);
        assert!(decoder.feed(b"data: {\"a\":").expect("feed").is_empty());
        assert_eq!(decoder.pending_bytes(), 11);
        let lines = decoder.feed(b"1}\n\n").expect("feed");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].payload(), "{\"a\":1}");
        assert_eq!(decoder.pending_bytes(), 0);
    }

    #[test]
    fn output_is_independent_of_chunk_boundaries() {
        let stream = "event: message\ndata: one\n\n: keep-alive\ndata: two\r\n\r\ndata: three\n\n";
        let bytes = stream.as_bytes();
        let whole = feed_all(&[bytes]);
        assert_eq!(whole, vec!["one", "two", "three"]);

        for split in 0..=bytes.len() {
            let (a, b) = bytes.split_at(split);
            assert_eq!(feed_all(&[a, b]), whole, "split at {split}");
        }
        let single_bytes: Vec<&[u8]> = bytes.chunks(1).collect();
        assert_eq!(feed_all(&single_bytes), whole);
    }

    #[test]
    fn multibyte_characters_survive_any_split() {
        let bytes = "data: héllo ✓\n".as_bytes();
        for split in 0..=bytes.len() {
            let (a, b) = bytes.split_at(split);
            assert_eq!(feed_all(&[a, b]), vec!["héllo ✓"], "split at {split}");
        }
    }

    #[test]
    fn noise_lines_are_filtered() {
        let lines = feed_all(&[b"\n\n: ping\nevent: delta\nid: 7\nretry: 10\ndata:[DONE]\n"]);
        assert_eq!(lines, vec!["[DONE]"]);
    }

    #[test]
    fn flush_discards_truncated_tail() {
        let mut decoder = FrameDecoder::new(LIMIT);
        let lines = decoder.feed(b"data: ok\ndata: {\"trunc").expect("feed");
        assert_eq!(lines.len(), 1);
        assert_eq!(decoder.flush(), 13);
        assert_eq!(decoder.pending_bytes(), 0);
    }

    #[test]
    fn oversized_partial_line_is_rejected() {
        let mut decoder = FrameDecoder::new(8);
        let err = decoder.feed(b"data: 0123456789").expect_err("over limit");
        assert_eq!(err, DecodeError::LineTooLong { limit: 8 });
    }

    #[test]
    fn complete_long_lines_are_not_limited() {
        let mut decoder = FrameDecoder::new(8);
        let lines = decoder.feed(b"data: 0123456789\n").expect("complete line");
        assert_eq!(lines.len(), 1);
    }

    #[test]
    fn lines_finished_before_an_oversized_tail_are_kept() {
        let mut decoder = FrameDecoder::new(8);
        let lines = decoder.feed(b"data: a\ndata: 0123456789").expect("completed line");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].payload(), "a");
        let err = decoder.feed(b"x").expect_err("tail still over limit");
        assert_eq!(err, DecodeError::LineTooLong { limit: 8 });
    }

    #[test]
    fn long_line_fed_byte_by_byte_is_scanned_once() {
        const LEN: usize = 1024 * 1024;
        let mut decoder = FrameDecoder::new(2 * LEN);
        let started = std::time::Instant::now();
        assert!(decoder.feed(b"data: ").expect("prefix").is_empty());
        for _ in 0..LEN {
            assert!(decoder.feed(b"x").expect("within limit").is_empty());
        }
        let lines = decoder.feed(b"\n").expect("terminated");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].payload().len(), LEN);
        assert!(
            started.elapsed() < std::time::Duration::from_secs(10),
            "took {:?}",
            started.elapsed()
        );
    }

    #[test]
    fn invalid_utf8_is_replaced_not_dropped() {
        let lines = feed_all(&[b"data: ok\xff\n"]);
        assert_eq!(lines, vec!["ok\u{fffd}"]);
    }
}
