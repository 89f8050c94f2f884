//! Incoming call context.
//!
//! Everything a handler needs about the call it serves: id, procedure,
//! payload, the readers of any blobs sent with it, and an abort signal that
//! fires when the caller cancels or the connection shuts down.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::abort::AbortSignal;
use crate::codec::parse_stream_token;
use crate::engine::ConnectionId;
use crate::error::{ErrorCode, RpcError};
use crate::streams::InboundStream;

/// A call being served.
#[derive(Debug)]
pub struct IncomingCall {
    call_id: u32,
    procedure: String,
    payload: Value,
    streams: BTreeMap<u32, InboundStream>,
    signal: AbortSignal,
    connection_id: Option<ConnectionId>,
}

impl IncomingCall {
    /// Create a call context (for testing without a connection).
    pub fn new(call_id: u32, procedure: impl Into<String>, payload: Value) -> Self {
        Self {
            call_id,
            procedure: procedure.into(),
            payload,
            streams: BTreeMap::new(),
            signal: AbortSignal::never(),
            connection_id: None,
        }
    }

    pub(crate) fn with_connection(
        mut self,
        connection_id: ConnectionId,
        streams: BTreeMap<u32, InboundStream>,
        signal: AbortSignal,
    ) -> Self {
        self.connection_id = Some(connection_id);
        self.streams = streams;
        self.signal = signal;
        self
    }

    #[inline]
    pub fn call_id(&self) -> u32 {
        self.call_id
    }

    #[inline]
    pub fn procedure(&self) -> &str {
        &self.procedure
    }

    #[inline]
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Connection the call arrived on, if any.
    #[inline]
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection_id
    }

    /// Fires when the caller cancels or the connection shuts down.
    #[inline]
    pub fn signal(&self) -> &AbortSignal {
        &self.signal
    }

    /// Deserialize the payload. A mismatch is the caller's fault and maps to
    /// `ValidationError`.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, RpcError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| RpcError::new(ErrorCode::ValidationError, e.to_string()))
    }

    /// Reader for the blob referenced at JSON pointer `pointer`.
    pub fn blob(&self, pointer: &str) -> Option<InboundStream> {
        let id = parse_stream_token(self.payload.pointer(pointer)?)?;
        self.streams.get(&id).cloned()
    }

    /// Readers of every blob sent with the call, by stream id.
    pub fn streams(&self) -> &BTreeMap<u32, InboundStream> {
        &self.streams
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use serde::Deserialize;
    use serde_json::json;

    use crate::codec::{stream_token, BlobMetadata};
    use crate::streams::InboundStreams;

    #[test]
    fn test_call_creation() {
        let call = IncomingCall::new(42, "users.get", json!({"id": 1}));
        assert_eq!(call.call_id(), 42);
        assert_eq!(call.procedure(), "users.get");
        assert!(call.connection_id().is_none());
        assert!(!call.signal().is_aborted());
    }

    #[test]
    fn test_deserialize_validation_error() {
        #[derive(Debug, Deserialize)]
        struct Args {
            #[allow(dead_code)]
            id: u32,
        }

        let call = IncomingCall::new(1, "get", json!({"id": "nope"}));
        let err = call.deserialize::<Args>().unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationError);
    }

    #[tokio::test]
    async fn test_blob_lookup() {
        let inbound = InboundStreams::new();
        let reader = inbound
            .add(7, Some(BlobMetadata::new("text/plain")))
            .unwrap();
        inbound.push(7, Bytes::from_static(b"hello")).unwrap();
        inbound.end(7).unwrap();

        let mut streams = BTreeMap::new();
        streams.insert(7, reader);
        let call = IncomingCall::new(1, "upload", json!({"file": stream_token(7)}))
            .with_connection(ConnectionId::next(), streams, AbortSignal::never());

        let blob = call.blob("/file").unwrap();
        assert_eq!(blob.metadata().unwrap().content_type, "text/plain");
        assert_eq!(&blob.read_to_end().await.unwrap()[..], b"hello");
        assert!(call.blob("/missing").is_none());
    }
}
