//! JSON format using `serde_json`.

use serde_json::Value;

use super::Format;
use crate::error::{Result, WiremuxError};

/// JSON format for structured payloads.
///
/// Decodes both its own content type and plain `application/json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFormat;

impl JsonFormat {
    pub const CONTENT_TYPE: &'static str = "application/x-wiremux-json";
}

impl Format for JsonFormat {
    fn content_type(&self) -> &'static str {
        Self::CONTENT_TYPE
    }

    fn accept(&self) -> &'static [&'static str] {
        &[Self::CONTENT_TYPE, "application/json"]
    }

    #[inline]
    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    #[inline]
    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        serde_json::from_slice(bytes)
            .map_err(|e| WiremuxError::decode(format!("invalid JSON payload: {}", e)))
    }
}
