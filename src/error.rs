//! Error types for wiremux.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::protocol::Role;

/// Main error type for all wiremux operations.
#[derive(Debug, Error)]
pub enum WiremuxError {
    /// I/O error reported by a transport or a stream producer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Malformed text framing. Fatal to the receive path of a connection.
    #[error("{0}")]
    Framing(String),

    /// A message body did not match the shape expected for its tag.
    #[error("Decode error: {0}")]
    Decode(String),

    /// A message carried a tag outside the known set.
    #[error("Unknown message tag: {0}")]
    UnknownTag(u8),

    /// An operation referenced a stream id that is not registered.
    #[error("Stream not found: {0}")]
    StreamNotFound(u32),

    /// The stream was aborted by the peer, the producer or teardown.
    #[error("Stream aborted: {0}")]
    StreamAborted(String),

    /// Blob metadata failed validation.
    #[error("Invalid blob metadata: {0}")]
    InvalidBlobMetadata(String),

    /// The call's timeout fired before a result arrived.
    #[error("Call timed out")]
    CallTimeout,

    /// The call was aborted by connection shutdown or by the peer.
    #[error("Call aborted: {0}")]
    CallAborted(String),

    /// The caller cancelled the call.
    #[error("Call cancelled: {0}")]
    CallCancelled(String),

    /// The peer answered the call with an error payload.
    #[error("{0}")]
    Remote(RpcError),

    /// Operation only available on the other side of the connection.
    #[error("Operation not available to the {0:?} side")]
    WrongRole(Role),

    /// Operation attempted while the connection is not open.
    #[error("Connection is not open")]
    ConnectionNotOpen,

    /// Connection closed while the operation was in flight.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Content-type negotiation found no matching format.
    #[error("No supported format found: {0}")]
    UnsupportedFormat(String),

    /// Backpressure timeout - write queue full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,
}

impl WiremuxError {
    /// Build a decode error from anything printable.
    pub(crate) fn decode(message: impl fmt::Display) -> Self {
        Self::Decode(message.to_string())
    }

    /// Convert into the error payload sent back to a caller.
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            Self::Remote(err) => err.clone(),
            Self::Decode(_) | Self::InvalidBlobMetadata(_) => {
                RpcError::new(ErrorCode::BadRequest, self.to_string())
            }
            Self::CallTimeout => RpcError::new(ErrorCode::RequestTimeout, self.to_string()),
            Self::CallCancelled(_) | Self::CallAborted(_) => {
                RpcError::new(ErrorCode::ClientRequestError, self.to_string())
            }
            Self::ConnectionClosed | Self::ConnectionNotOpen => {
                RpcError::new(ErrorCode::ConnectionError, self.to_string())
            }
            _ => RpcError::new(ErrorCode::InternalServerError, self.to_string()),
        }
    }
}

/// Result type alias using WiremuxError.
pub type Result<T> = std::result::Result<T, WiremuxError>;

/// Error codes carried by RPC error payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    ValidationError,
    BadRequest,
    NotFound,
    Forbidden,
    Unauthorized,
    InternalServerError,
    NotAcceptable,
    RequestTimeout,
    GatewayTimeout,
    ServiceUnavailable,
    ClientRequestError,
    ConnectionError,
}

impl ErrorCode {
    /// Wire name of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "ValidationError",
            Self::BadRequest => "BadRequest",
            Self::NotFound => "NotFound",
            Self::Forbidden => "Forbidden",
            Self::Unauthorized => "Unauthorized",
            Self::InternalServerError => "InternalServerError",
            Self::NotAcceptable => "NotAcceptable",
            Self::RequestTimeout => "RequestTimeout",
            Self::GatewayTimeout => "GatewayTimeout",
            Self::ServiceUnavailable => "ServiceUnavailable",
            Self::ClientRequestError => "ClientRequestError",
            Self::ConnectionError => "ConnectionError",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error payload exchanged when a procedure fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Create an error payload without extra data.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured data to the error.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

impl From<RpcError> for WiremuxError {
    fn from(err: RpcError) -> Self {
        Self::Remote(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_not_found_message() {
        let err = WiremuxError::StreamNotFound(1);
        assert!(err.to_string().starts_with("Stream not found"));
    }

    #[test]
    fn test_error_code_serializes_as_name() {
        let err = RpcError::new(ErrorCode::NotFound, "missing");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "NotFound");
        assert!(json.get("data").is_none());
    }

    #[test]
    fn test_to_rpc_error_keeps_remote_payload() {
        let remote = RpcError::new(ErrorCode::Forbidden, "nope");
        let err = WiremuxError::Remote(remote.clone());
        assert_eq!(err.to_rpc_error(), remote);
        assert_eq!(
            WiremuxError::CallTimeout.to_rpc_error().code,
            ErrorCode::RequestTimeout
        );
    }
}
