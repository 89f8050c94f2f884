//! MsgPack format using `rmp-serde`.
//!
//! **CRITICAL**: Always use `to_vec_named`, NEVER `to_vec`!
//! Peers written against `@msgpack/msgpack` expect structs encoded as maps.

use serde_json::Value;

use super::Format;
use crate::error::{Result, WiremuxError};

/// MessagePack format for structured payloads.
///
/// Uses `rmp_serde::to_vec_named` so structs are serialized as maps
/// (with field names) rather than arrays (positional).
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackFormat;

impl MsgPackFormat {
    pub const CONTENT_TYPE: &'static str = "application/x-wiremux-msgpack";
}

impl Format for MsgPackFormat {
    fn content_type(&self) -> &'static str {
        Self::CONTENT_TYPE
    }

    fn accept(&self) -> &'static [&'static str] {
        &[Self::CONTENT_TYPE]
    }

    #[inline]
    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        // CRITICAL: to_vec_named, NOT to_vec!
        Ok(rmp_serde::to_vec_named(value)?)
    }

    #[inline]
    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| WiremuxError::decode(format!("invalid MsgPack payload: {}", e)))
    }
}
