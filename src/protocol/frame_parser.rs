//! Frame recovery for the SSE-like text transport.
//!
//! Uses `bytes::BytesMut` to accumulate chunks as they arrive. A frame is a
//! block of `field: value` lines terminated by a blank line (`\n\n` or
//! `\r\n\r\n`). Only `data:` lines carry payload; every other field is
//! ignored. Several `data:` lines in one frame are joined with `\n`.
//!
//! Works on raw bytes, so a chunk boundary inside a multi-byte character or
//! inside a separator does not matter.
//!
//! # Example
//!
//! ```ignore
//! use wiremux::protocol::FrameParser;
//!
//! let mut parser = FrameParser::new();
//!
//! for data in parser.push(b"event: message\ndata: AQID\n\n") {
//!     println!("payload: {:?}", data);
//! }
//!
//! // End of response: anything left over is a malformed frame.
//! parser.finish()?;
//! ```

use bytes::{Bytes, BytesMut};

use crate::error::{Result, WiremuxError};

/// Error message for data left after the last separator.
pub const MALFORMED_TRAILING_FRAME: &str = "Malformed stream response frame";

const DATA_FIELD: &[u8] = b"data:";

/// Incremental parser turning text chunks into frame payloads.
pub struct FrameParser {
    /// Bytes received but not yet terminated by a separator.
    pending: BytesMut,
    /// Offset where the next separator search starts. Everything before it
    /// is known to contain no complete separator.
    scan_from: usize,
}

impl FrameParser {
    /// Create a new parser with default capacity (8KB).
    pub fn new() -> Self {
        Self::with_capacity(8 * 1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pending: BytesMut::with_capacity(capacity),
            scan_from: 0,
        }
    }

    /// Append a chunk and extract the payload of every completed frame.
    ///
    /// Frames without `data:` lines, or whose joined data is empty, produce
    /// nothing.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.pending.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some((index, len)) = find_separator(&self.pending, self.scan_from) {
            let frame = self.pending.split_to(index + len);
            self.scan_from = 0;
            if let Some(data) = frame_data(&frame[..index]) {
                frames.push(data);
            }
        }

        // A separator may straddle the next chunk boundary: rescan the tail.
        self.scan_from = self.pending.len().saturating_sub(3);
        frames
    }

    /// Signal end of input.
    ///
    /// Fails with a framing error if non-whitespace bytes were never
    /// terminated by a separator. The parser is empty afterwards either way.
    pub fn finish(&mut self) -> Result<()> {
        let leftover = self.pending.split();
        self.scan_from = 0;
        if leftover.iter().all(u8::is_ascii_whitespace) {
            Ok(())
        } else {
            Err(WiremuxError::Framing(MALFORMED_TRAILING_FRAME.to_string()))
        }
    }

    /// Number of buffered bytes not yet part of a complete frame.
    #[inline]
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Earliest `\n\n` or `\r\n\r\n` at or after `from`, as `(index, length)`.
/// On a tie the shorter separator wins.
fn find_separator(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let haystack = buf.get(from..)?;
    let lf = haystack.windows(2).position(|w| w == b"\n\n");
    let crlf = haystack.windows(4).position(|w| w == b"\r\n\r\n");
    let found = match (lf, crlf) {
        (None, None) => return None,
        (Some(lf), None) => (lf, 2),
        (None, Some(crlf)) => (crlf, 4),
        (Some(lf), Some(crlf)) if lf <= crlf => (lf, 2),
        (Some(_), Some(crlf)) => (crlf, 4),
    };
    Some((from + found.0, found.1))
}

/// Join the `data:` lines of one frame.
fn frame_data(frame: &[u8]) -> Option<Bytes> {
    let mut data = BytesMut::new();
    let mut seen = false;

    for line in frame.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some(value) = line.strip_prefix(DATA_FIELD) else {
            continue;
        };
        let start = value
            .iter()
            .position(|&b| b != b' ' && b != b'\t')
            .unwrap_or(value.len());
        if seen {
            data.extend_from_slice(b"\n");
        }
        data.extend_from_slice(&value[start..]);
        seen = true;
    }

    if data.is_empty() {
        None
    } else {
        Some(data.freeze())
    }
}
