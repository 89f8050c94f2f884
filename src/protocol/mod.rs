//! Protocol module - message tags, bodies, and text framing.
//!
//! This module implements the wire layer of a connection:
//! - One tag byte followed by a body ([`Message`])
//! - Typed bodies for every tag ([`body`])
//! - Frame recovery for the SSE-like text transport ([`FrameParser`])
//! - Base64 `data:` frames carrying binary messages over that transport

pub mod body;
mod frame_parser;
mod message;
mod text;

pub use frame_parser::{FrameParser, MALFORMED_TRAILING_FRAME};
pub use message::{decode, encode, Message, MessageTag, Role, StreamTags};
pub use text::{decode_text_payload, encode_text_frame};
