//! Line framing layer
//!
//! Splits a raw byte stream into `\n`-terminated UTF-8 lines, the unit of
//! the resolver wire protocol. Partial reads are buffered until their
//! terminator arrives, and bytes left unterminated at end of stream are
//! flushed as a final line.
//!
//! Use [`LineFramer`] with [`tokio_util::codec::FramedRead`] (inbound) and
//! [`tokio_util::codec::FramedWrite`] (outbound).

use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// Default maximum line length: 1 MiB
pub const DEFAULT_MAX_LINE_BYTES: usize = 1_048_576;

/// Error types for line framing
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("Line too long: exceeded {max} bytes")]
    LineTooLong { max: usize },

    #[error("Invalid UTF-8 in line: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("Line contains an embedded newline")]
    EmbeddedNewline,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FramingError {
    /// Whether the stream can keep being read after this error
    ///
    /// The offending line has already been consumed in these cases.
    pub fn is_line_error(&self) -> bool {
        matches!(self, Self::LineTooLong { .. } | Self::InvalidUtf8(_))
    }
}

/// Newline-delimited framing codec
///
/// Decoding strips the `\n` terminator and a preceding `\r`. Lines are
/// emitted exactly in stream order and never merged. A line over the limit
/// is reported once and then skipped through its terminator.
#[derive(Debug, Clone)]
pub struct LineFramer {
    /// Maximum accepted line length in bytes (terminator excluded)
    max_line_bytes: usize,

    /// Index already scanned for a newline, so rescans start where the last one stopped
    next_index: usize,

    /// Dropping the remainder of an over-long line
    discarding: bool,
}

impl LineFramer {
    /// Create a framer with [`DEFAULT_MAX_LINE_BYTES`]
    pub fn new() -> Self {
        Self::with_max_line_bytes(DEFAULT_MAX_LINE_BYTES)
    }

    /// Create a framer with a custom line limit
    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            max_line_bytes,
            next_index: 0,
            discarding: false,
        }
    }

    fn into_line(bytes: &[u8]) -> Result<String, FramingError> {
        let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
        Ok(String::from_utf8(bytes.to_vec())?)
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineFramer {
    type Item = String;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, FramingError> {
        loop {
            let read_to = src.len();
            let newline_index = src[self.next_index..read_to]
                .iter()
                .position(|byte| *byte == b'\n')
                .map(|offset| self.next_index + offset);

            match (self.discarding, newline_index) {
                (true, Some(newline_index)) => {
                    trace!("LineFramer: Dropped tail of over-long line");
                    src.advance(newline_index + 1);
                    self.discarding = false;
                    self.next_index = 0;
                }
                (true, None) => {
                    src.advance(read_to);
                    self.next_index = 0;
                    return Ok(None);
                }
                (false, Some(newline_index)) if newline_index > self.max_line_bytes => {
                    src.advance(newline_index + 1);
                    self.next_index = 0;
                    return Err(FramingError::LineTooLong {
                        max: self.max_line_bytes,
                    });
                }
                (false, Some(newline_index)) => {
                    self.next_index = 0;
                    let frame = src.split_to(newline_index + 1);
                    let line = Self::into_line(&frame[..newline_index])?;
                    trace!("LineFramer: Decoded line ({} bytes)", newline_index);
                    return Ok(Some(line));
                }
                (false, None) if read_to > self.max_line_bytes => {
                    // Skip everything up to the next terminator
                    src.advance(read_to);
                    self.next_index = 0;
                    self.discarding = true;
                    return Err(FramingError::LineTooLong {
                        max: self.max_line_bytes,
                    });
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>, FramingError> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }

        self.next_index = 0;
        if self.discarding {
            self.discarding = false;
            src.clear();
        }
        if src.is_empty() {
            return Ok(None);
        }

        // Trailing bytes without a terminator become the final line
        let remainder = src.split_to(src.len());
        trace!(
            "LineFramer: Flushing unterminated final line ({} bytes)",
            remainder.len()
        );
        Self::into_line(&remainder).map(Some)
    }
}

impl Encoder<String> for LineFramer {
    type Error = FramingError;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<(), FramingError> {
        if line.contains('\n') {
            return Err(FramingError::EmbeddedNewline);
        }

        dst.reserve(line.len() + 1);
        dst.put_slice(line.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    fn decode_all(framer: &mut LineFramer, buffer: &mut BytesMut) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = framer.decode(buffer).unwrap() {
            lines.push(line);
        }
        lines
    }

    #[test]
    fn test_partial_reads_are_buffered() {
        let mut framer = LineFramer::new();
        let mut buffer = BytesMut::new();

        buffer.extend_from_slice(b"MAYBE {\"id\"");
        assert!(decode_all(&mut framer, &mut buffer).is_empty());

        buffer.extend_from_slice(b":1}\nLOG ");
        assert_eq!(
            decode_all(&mut framer, &mut buffer),
            vec!["MAYBE {\"id\":1}".to_string()]
        );

        buffer.extend_from_slice(b"\"hi\"\n");
        assert_eq!(
            decode_all(&mut framer, &mut buffer),
            vec!["LOG \"hi\"".to_string()]
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_multiple_lines_in_one_chunk_keep_order() {
        let mut framer = LineFramer::new();
        let mut buffer = BytesMut::from(&b"one\ntwo\n\nthree\n"[..]);

        assert_eq!(
            decode_all(&mut framer, &mut buffer),
            vec!["one", "two", "", "three"]
        );
    }

    #[test]
    fn test_crlf_terminators_are_stripped() {
        let mut framer = LineFramer::new();
        let mut buffer = BytesMut::from(&b"END null\r\n"[..]);

        assert_eq!(decode_all(&mut framer, &mut buffer), vec!["END null"]);
    }

    #[test]
    fn test_unterminated_tail_is_flushed_at_eof() {
        let mut framer = LineFramer::new();
        let mut buffer = BytesMut::from(&b"first\nlast"[..]);

        assert_eq!(framer.decode_eof(&mut buffer).unwrap(), Some("first".to_string()));
        assert_eq!(framer.decode_eof(&mut buffer).unwrap(), Some("last".to_string()));
        assert_eq!(framer.decode_eof(&mut buffer).unwrap(), None);
    }

    #[test]
    fn test_line_too_long() {
        let mut framer = LineFramer::with_max_line_bytes(8);
        let mut buffer = BytesMut::from(&b"0123456789"[..]);

        let result = framer.decode(&mut buffer);
        assert!(matches!(result, Err(FramingError::LineTooLong { max: 8 })));
    }

    #[test]
    fn test_decoding_resumes_after_over_long_line() {
        let mut framer = LineFramer::with_max_line_bytes(8);
        let mut buffer = BytesMut::from(&b"0123456789"[..]);

        assert!(framer.decode(&mut buffer).is_err());
        assert!(buffer.is_empty());

        buffer.extend_from_slice(b"abcdef
ok
0123456789ab
next
");
        assert_eq!(framer.decode(&mut buffer).unwrap(), Some("ok".to_string()));
        assert!(matches!(
            framer.decode(&mut buffer),
            Err(FramingError::LineTooLong { max: 8 })
        ));
        assert_eq!(framer.decode(&mut buffer).unwrap(), Some("next".to_string()));

        buffer.extend_from_slice(b"0123456789 never terminated");
        assert!(framer.decode(&mut buffer).is_err());
        assert_eq!(framer.decode_eof(&mut buffer).unwrap(), None);
    }

    #[test]
    fn test_invalid_utf8() {
        let mut framer = LineFramer::new();
        let mut buffer = BytesMut::from(&b"\xff\xfe\n"[..]);

        let result = framer.decode(&mut buffer);
        assert!(matches!(result, Err(FramingError::InvalidUtf8(_))));
        assert!(result.unwrap_err().is_line_error());
        assert!(buffer.is_empty());

        let io_error = FramingError::from(io::Error::other("broken pipe"));
        assert!(!io_error.is_line_error());
    }

    #[test]
    fn test_encode_appends_terminator_and_rejects_newlines() {
        let mut framer = LineFramer::new();
        let mut buffer = BytesMut::new();

        framer.encode("MATCH {}".to_string(), &mut buffer).unwrap();
        assert_eq!(&buffer[..], b"MATCH {}\n");

        let result = framer.encode("MATCH\n{}".to_string(), &mut buffer);
        assert!(matches!(result, Err(FramingError::EmbeddedNewline)));
        assert_eq!(&buffer[..], b"MATCH {}\n");
    }

    #[tokio::test]
    async fn test_framed_read_over_byte_stream() {
        let input: &[u8] = b"RESOLVE {}\nMAYBE {\"id\":2}\nLOG \"done\"";
        let mut framed = FramedRead::new(input, LineFramer::new());

        let mut lines = Vec::new();
        while let Some(line) = framed.next().await {
            lines.push(line.unwrap());
        }

        assert_eq!(lines, vec!["RESOLVE {}", "MAYBE {\"id\":2}", "LOG \"done\""]);
    }
}
