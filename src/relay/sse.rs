//! Incremental SSE frame parsing for upstream streams.
//!
//! Frames are separated by a blank line; a frame's payload is its `data:`
//! lines joined with newlines. Event names are not surfaced: every
//! supported provider carries the discriminator inside the data JSON. A
//! frame larger than the configured cap is a reader failure.

use bytes::BytesMut;

use crate::core::error::{AppError, Result};

/// Incremental parser fed raw bytes from the upstream body.
pub struct SseParser {
    buffer: BytesMut,
    max_event_size: usize,
}

impl SseParser {
    pub fn new(max_event_size: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_event_size,
        }
    }

    /// Append raw bytes from the wire.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Pop the next complete frame's data payload, if one is buffered.
    /// Frames without data lines (comments, bare event names) yield `None`
    /// here but are consumed; call again until the buffer runs dry.
    pub fn next_event(&mut self) -> Result<Option<String>> {
        loop {
            let Some(frame_end) = find_frame_boundary(&self.buffer) else {
                if self.buffer.len() > self.max_event_size {
                    return Err(AppError::Internal(format!(
                        "SSE event exceeds maximum size of {} bytes",
                        self.max_event_size
                    )));
                }
                return Ok(None);
            };

            let frame = self.buffer.split_to(frame_end.consumed);
            let frame = &frame[..frame_end.content];
            if frame.len() > self.max_event_size {
                return Err(AppError::Internal(format!(
                    "SSE event exceeds maximum size of {} bytes",
                    self.max_event_size
                )));
            }

            let text = String::from_utf8_lossy(frame);
            let mut data_lines: Vec<&str> = Vec::new();
            for line in text.lines() {
                if let Some(rest) = line.strip_prefix("data:") {
                    data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
                }
            }
            if data_lines.is_empty() {
                // Comment or name-only frame; skip it.
                continue;
            }
            return Ok(Some(data_lines.join("\n")));
        }
    }
}

struct FrameBoundary {
    /// Frame bytes excluding the separator
    content: usize,
    /// Bytes to consume including the separator
    consumed: usize,
}

fn find_frame_boundary(buffer: &[u8]) -> Option<FrameBoundary> {
    // Accept \n\n and \r\n\r\n separators.
    let mut i = 0;
    while i + 1 < buffer.len() {
        if buffer[i] == b'\n' && buffer[i + 1] == b'\n' {
            return Some(FrameBoundary {
                content: i,
                consumed: i + 2,
            });
        }
        if i + 3 < buffer.len() && &buffer[i..i + 4] == b"\r\n\r\n" {
            return Some(FrameBoundary {
                content: i,
                consumed: i + 4,
            });
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_event() {
        let mut parser = SseParser::new(1024);
        parser.push(b"data: {\"x\":1}\n\n");
        assert_eq!(parser.next_event().unwrap().unwrap(), "{\"x\":1}");
        assert!(parser.next_event().unwrap().is_none());
    }

    #[test]
    fn test_partial_then_complete() {
        let mut parser = SseParser::new(1024);
        parser.push(b"data: {\"x\"");
        assert!(parser.next_event().unwrap().is_none());
        parser.push(b":1}\n\n");
        assert_eq!(parser.next_event().unwrap().unwrap(), "{\"x\":1}");
    }

    #[test]
    fn test_named_event_data_extracted() {
        let mut parser = SseParser::new(1024);
        parser.push(b"event:message_start\ndata:{\"type\":\"message_start\"}\n\n");
        assert_eq!(
            parser.next_event().unwrap().unwrap(),
            "{\"type\":\"message_start\"}"
        );
    }

    #[test]
    fn test_multi_line_data_joined() {
        let mut parser = SseParser::new(1024);
        parser.push(b"data: line1\ndata: line2\n\n");
        assert_eq!(parser.next_event().unwrap().unwrap(), "line1\nline2");
    }

    #[test]
    fn test_comment_frames_skipped() {
        let mut parser = SseParser::new(1024);
        parser.push(b": keep-alive\n\ndata: real\n\n");
        assert_eq!(parser.next_event().unwrap().unwrap(), "real");
    }

    #[test]
    fn test_crlf_separators() {
        let mut parser = SseParser::new(1024);
        parser.push(b"data: a\r\n\r\ndata: b\r\n\r\n");
        assert_eq!(parser.next_event().unwrap().unwrap(), "a");
        assert_eq!(parser.next_event().unwrap().unwrap(), "b");
    }

    #[test]
    fn test_done_marker() {
        let mut parser = SseParser::new(1024);
        parser.push(b"data: [DONE]\n\n");
        assert_eq!(parser.next_event().unwrap().unwrap(), "[DONE]");
    }

    #[test]
    fn test_oversized_event_errors() {
        let mut parser = SseParser::new(16);
        parser.push(b"data: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        assert!(parser.next_event().is_err());
    }

    #[test]
    fn test_multiple_events_in_one_push() {
        let mut parser = SseParser::new(1024);
        parser.push(b"data: 1\n\ndata: 2\n\ndata: 3\n\n");
        assert_eq!(parser.next_event().unwrap().unwrap(), "1");
        assert_eq!(parser.next_event().unwrap().unwrap(), "2");
        assert_eq!(parser.next_event().unwrap().unwrap(), "3");
    }
}
