//! Base64 framing of binary messages for the HTTP text transport.
//!
//! Each protocol message travels as one `data:` frame whose value is the
//! standard-alphabet base64 of the binary message.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;

use crate::error::{Result, WiremuxError};

/// Wrap one binary message as a text frame: `data: <base64>\n\n`.
pub fn encode_text_frame(message: &[u8]) -> Bytes {
    let mut frame = String::with_capacity(8 + message.len() * 4 / 3);
    frame.push_str("data: ");
    STANDARD.encode_string(message, &mut frame);
    frame.push_str("\n\n");
    Bytes::from(frame)
}

/// Decode the `data:` payload of one frame back into a binary message.
///
/// A payload split over several `data:` lines arrives joined with `\n`;
/// line breaks and other ASCII whitespace are not part of the base64.
pub fn decode_text_payload(data: &[u8]) -> Result<Bytes> {
    let compact: Vec<u8> = data
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    STANDARD
        .decode(compact)
        .map(Bytes::from)
        .map_err(|e| WiremuxError::decode(format!("invalid base64 frame: {}", e)))
}
