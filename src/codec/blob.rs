//! Blobs and payloads that reference them.

use std::fmt;

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{EncodeRpcContext, StreamsMetadata};
use crate::error::{Result, WiremuxError};

/// Placeholder prefix marking a stream reference inside a structured payload.
const STREAM_TOKEN_PREFIX: &str = "%wiremux:stream:%\u{c}";

/// A producer of binary chunks.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Build the placeholder token for stream `id`.
pub fn stream_token(id: u32) -> String {
    format!("{}{}", STREAM_TOKEN_PREFIX, id)
}

/// Extract the stream id from a placeholder token.
pub fn parse_stream_token(value: &Value) -> Option<u32> {
    value
        .as_str()?
        .strip_prefix(STREAM_TOKEN_PREFIX)?
        .parse()
        .ok()
}

/// Describes the content of a binary stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMetadata {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl BlobMetadata {
    pub fn new(content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            size: None,
            filename: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    /// Reject metadata announcing a zero size.
    pub fn validate(&self) -> Result<()> {
        if self.size == Some(0) {
            return Err(WiremuxError::InvalidBlobMetadata(
                "size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Binary data attached to a payload and transferred as a stream.
pub struct Blob {
    metadata: BlobMetadata,
    source: ByteStream,
}

impl Blob {
    /// A blob backed by bytes already in memory.
    pub fn from_bytes(bytes: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        let bytes = bytes.into();
        let mut metadata = BlobMetadata::new(content_type);
        if !bytes.is_empty() {
            metadata.size = Some(bytes.len() as u64);
        }
        Self {
            metadata,
            source: stream::iter([Ok(bytes)]).boxed(),
        }
    }

    /// A blob backed by an arbitrary chunk producer.
    pub fn from_stream<S>(source: S, metadata: BlobMetadata) -> Result<Self>
    where
        S: futures::Stream<Item = std::io::Result<Bytes>> + Send + 'static,
    {
        metadata.validate()?;
        Ok(Self {
            metadata,
            source: source.boxed(),
        })
    }

    #[inline]
    pub fn metadata(&self) -> &BlobMetadata {
        &self.metadata
    }

    pub fn into_parts(self) -> (BlobMetadata, ByteStream) {
        (self.metadata, self.source)
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// A structured value plus the blobs placed inside it.
///
/// Blobs are placed with JSON pointers (RFC 6901). The target's parent must
/// exist; the last segment is inserted or replaced.
///
/// ```ignore
/// let payload = Payload::new(json!({"name": "photo.png"}))
///     .with_blob("/file", Blob::from_bytes(png, "image/png"));
/// ```
#[derive(Debug, Default)]
pub struct Payload {
    value: Value,
    blobs: Vec<(String, Blob)>,
}

impl Payload {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            blobs: Vec::new(),
        }
    }

    /// Build a payload from any serializable value.
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::new(serde_json::to_value(value)?))
    }

    /// Place `blob` at `pointer` inside the value.
    pub fn with_blob(mut self, pointer: impl Into<String>, blob: Blob) -> Self {
        self.blobs.push((pointer.into(), blob));
        self
    }

    #[inline]
    pub fn value(&self) -> &Value {
        &self.value
    }

    #[inline]
    pub fn has_blobs(&self) -> bool {
        !self.blobs.is_empty()
    }

    /// Register each blob as a stream and swap it for a placeholder token.
    pub(crate) fn into_wire(
        self,
        ctx: &mut dyn EncodeRpcContext,
    ) -> Result<(Value, StreamsMetadata)> {
        let Payload { mut value, blobs } = self;
        let mut streams = StreamsMetadata::new();
        for (pointer, blob) in blobs {
            let metadata = blob.metadata().clone();
            metadata.validate()?;
            let id = ctx.add_stream(blob)?;
            set_pointer(&mut value, &pointer, Value::String(stream_token(id)))?;
            streams.insert(id.to_string(), metadata);
        }
        Ok((value, streams))
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

fn set_pointer(root: &mut Value, pointer: &str, replacement: Value) -> Result<()> {
    if pointer.is_empty() {
        *root = replacement;
        return Ok(());
    }
    let invalid = || WiremuxError::Decode(format!("cannot place blob at {:?}", pointer));
    let (parent, last) = pointer.rsplit_once('/').ok_or_else(invalid)?;
    let key = last.replace("~1", "/").replace("~0", "~");
    match root.pointer_mut(parent).ok_or_else(invalid)? {
        Value::Object(map) => {
            map.insert(key, replacement);
        }
        Value::Array(items) => {
            let index: usize = key.parse().map_err(|_| invalid())?;
            match index.cmp(&items.len()) {
                std::cmp::Ordering::Less => items[index] = replacement,
                std::cmp::Ordering::Equal => items.push(replacement),
                std::cmp::Ordering::Greater => return Err(invalid()),
            }
        }
        _ => return Err(invalid()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Counter(u32);

    impl EncodeRpcContext for Counter {
        fn add_stream(&mut self, _blob: Blob) -> Result<u32> {
            self.0 += 1;
            Ok(self.0)
        }
    }

    #[test]
    fn test_stream_token() {
        let token = Value::String(stream_token(42));
        assert_eq!(parse_stream_token(&token), Some(42));
        assert_eq!(parse_stream_token(&json!("42")), None);
        assert_eq!(parse_stream_token(&json!(42)), None);
    }

    #[test]
    fn test_metadata_validation() {
        assert!(BlobMetadata::new("text/plain").validate().is_ok());
        assert!(BlobMetadata::new("text/plain").with_size(0).validate().is_err());

        let err = Blob::from_stream(
            stream::empty::<std::io::Result<Bytes>>(),
            BlobMetadata::new("text/plain").with_size(0),
        )
        .err()
        .unwrap();
        assert!(matches!(err, WiremuxError::InvalidBlobMetadata(_)));
    }

    #[test]
    fn test_metadata_wire_names() {
        let metadata = BlobMetadata::new("image/png")
            .with_size(10)
            .with_filename("a.png");
        let json = serde_json::to_value(&metadata).unwrap();
        assert_eq!(json, json!({"type": "image/png", "size": 10, "filename": "a.png"}));
    }

    #[test]
    fn test_into_wire_places_tokens() {
        let payload = Payload::new(json!({"files": [], "meta": {}}))
            .with_blob("/files/0", Blob::from_bytes(&b"a"[..], "text/plain"))
            .with_blob("/meta/thumb", Blob::from_bytes(&b"b"[..], "image/png"));

        let (value, streams) = payload.into_wire(&mut Counter(0)).unwrap();
        assert_eq!(value["files"][0], json!(stream_token(1)));
        assert_eq!(value["meta"]["thumb"], json!(stream_token(2)));
        assert_eq!(streams.len(), 2);
        assert_eq!(streams["2"].content_type, "image/png");
    }

    #[test]
    fn test_into_wire_rejects_missing_parent() {
        let payload = Payload::new(json!({}))
            .with_blob("/missing/file", Blob::from_bytes(&b"a"[..], "text/plain"));
        assert!(payload.into_wire(&mut Counter(0)).is_err());
    }
}
