// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! SSE framing (§4.B "SSE framing rule").
//!
//! A byte-oriented framer, independent of the HTTP client: feed it raw bytes
//! as they arrive off the wire, and it hands back complete `data:` payloads
//! as soon as a blank-line block boundary is seen. The caller is
//! responsible for parsing each payload as JSON into a [`crate::ResponseChunk`].

/// Incremental SSE block framer.
///
/// Buffers partial input across `feed` calls and extracts payloads using the
/// exact rule in §4.B: normalise CRLF to LF, split on `\n\n`, within a block
/// keep only `data:` lines, join with LF, trim. A trailing block with no
/// terminating blank line is returned by `flush` at end-of-stream.
#[derive(Debug, Default)]
pub struct SseFramer {
    buf: String,
}

/// The result of framing one `data:` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A non-empty, non-`[DONE]` payload ready to be parsed as JSON.
    Payload(String),
    /// An empty payload or the `[DONE]` sentinel — caller should skip it.
    Skip,
}

impl SseFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed newly received bytes and return every complete block framed so
    /// far (in order). Incomplete trailing data is retained for the next
    /// call or for `flush`.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Frame> {
        let text = String::from_utf8_lossy(bytes);
        self.buf.push_str(&text);
        self.buf = normalize_crlf(&self.buf);

        let mut frames = Vec::new();
        loop {
            match self.buf.find("\n\n") {
                Some(idx) => {
                    let block: String = self.buf.drain(..idx + 2).collect();
                    let block = block.trim_end_matches('\n');
                    frames.push(frame_block(block));
                }
                None => break,
            }
        }
        frames
    }

    /// Flush a trailing block that was never terminated by a blank line
    /// (end-of-stream). Returns `None` if the remaining buffer is empty.
    pub fn flush(&mut self) -> Option<Frame> {
        let rest = std::mem::take(&mut self.buf);
        let rest = rest.trim();
        if rest.is_empty() {
            None
        } else {
            Some(frame_block(rest))
        }
    }
}

fn normalize_crlf(s: &str) -> String {
    s.replace("\r\n", "\n")
}

fn frame_block(block: &str) -> Frame {
    let payload: String = block
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|line| line.trim())
        .collect::<Vec<_>>()
        .join("\n");

    if payload.is_empty() || payload == "[DONE]" {
        Frame::Skip
    } else {
        Frame::Payload(payload)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_complete_block_is_framed() {
        let mut f = SseFramer::new();
        let frames = f.feed(b"data: {\"a\":1}\n\n");
        assert_eq!(frames, vec![Frame::Payload("{\"a\":1}".into())]);
    }

    #[test]
    fn crlf_is_normalised_before_splitting() {
        let mut f = SseFramer::new();
        let frames = f.feed(b"data: {\"a\":1}\r\n\r\n");
        assert_eq!(frames, vec![Frame::Payload("{\"a\":1}".into())]);
    }

    #[test]
    fn multiple_data_lines_are_joined_with_lf() {
        let mut f = SseFramer::new();
        let frames = f.feed(b"data: {\"a\":\ndata: 1}\n\n");
        assert_eq!(frames, vec![Frame::Payload("{\"a\":\n1}".into())]);
    }

    #[test]
    fn non_data_lines_in_block_are_ignored() {
        let mut f = SseFramer::new();
        let frames = f.feed(b"event: message\ndata: {\"a\":1}\nid: 7\n\n");
        assert_eq!(frames, vec![Frame::Payload("{\"a\":1}".into())]);
    }

    #[test]
    fn done_sentinel_is_skipped() {
        let mut f = SseFramer::new();
        let frames = f.feed(b"data: [DONE]\n\n");
        assert_eq!(frames, vec![Frame::Skip]);
    }

    #[test]
    fn empty_block_is_skipped() {
        let mut f = SseFramer::new();
        let frames = f.feed(b"\n\n");
        assert_eq!(frames, vec![Frame::Skip]);
    }

    #[test]
    fn partial_block_across_two_feeds_is_buffered() {
        let mut f = SseFramer::new();
        assert!(f.feed(b"data: {\"a\":").is_empty());
        let frames = f.feed(b"1}\n\n");
        assert_eq!(frames, vec![Frame::Payload("{\"a\":1}".into())]);
    }

    #[test]
    fn multiple_blocks_in_one_feed_yield_multiple_frames() {
        let mut f = SseFramer::new();
        let frames = f.feed(b"data: 1\n\ndata: 2\n\n");
        assert_eq!(frames, vec![Frame::Payload("1".into()), Frame::Payload("2".into())]);
    }

    #[test]
    fn trailing_block_without_blank_line_requires_flush() {
        let mut f = SseFramer::new();
        assert!(f.feed(b"data: trailing").is_empty());
        assert_eq!(f.flush(), Some(Frame::Payload("trailing".into())));
    }

    #[test]
    fn flush_on_empty_buffer_returns_none() {
        let mut f = SseFramer::new();
        f.feed(b"data: 1\n\n");
        assert_eq!(f.flush(), None);
    }
}
