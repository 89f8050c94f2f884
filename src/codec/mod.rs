//! Codec module - pluggable payload formats.
//!
//! A [`Format`] turns structured payloads ([`serde_json::Value`]) into bytes
//! and back. Two formats ship with the crate:
//!
//! - [`JsonFormat`] - JSON via `serde_json`
//! - [`MsgPackFormat`] - MessagePack via `rmp-serde` (`to_vec_named`)
//!
//! Besides plain `encode`/`decode`, a format knows how to frame RPC calls and
//! responses. Blob arguments inside a [`Payload`] are registered as streams
//! through an [`EncodeRpcContext`] and replaced by a placeholder token. On
//! the receiving side every declared stream is handed to a
//! [`DecodeRpcContext`] before the payload is returned.
//!
//! The format of a connection is picked once, at connect time, by matching
//! the peer's content type against a [`FormatRegistry`].
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use wiremux::codec::{FormatRegistry, JsonFormat, MsgPackFormat};
//!
//! let formats = FormatRegistry::new(vec![Arc::new(JsonFormat), Arc::new(MsgPackFormat)]);
//! let format = formats.supports_decoder("application/x-wiremux-msgpack, */*;q=0.1")?;
//! ```

mod blob;
mod json;
mod msgpack;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, RpcError, WiremuxError};

pub use blob::{parse_stream_token, stream_token, Blob, BlobMetadata, ByteStream, Payload};
pub use json::JsonFormat;
pub use msgpack::MsgPackFormat;

/// Stream metadata declared alongside an RPC payload, keyed by stream id.
pub type StreamsMetadata = BTreeMap<String, BlobMetadata>;

/// Registers outbound streams while a payload is being encoded.
pub trait EncodeRpcContext {
    /// Register `blob` as a new outbound stream and return its id.
    fn add_stream(&mut self, blob: Blob) -> Result<u32>;
}

/// Registers inbound streams while a payload is being decoded.
pub trait DecodeRpcContext {
    /// Register an inbound stream announced by the peer.
    fn add_stream(&mut self, id: u32, metadata: BlobMetadata) -> Result<()>;
}

/// Outcome of a procedure, as sent back to the caller.
pub enum RpcOutcome {
    /// Single result value, possibly carrying blobs.
    Value(Payload),
    /// The procedure failed.
    Error(RpcError),
    /// The result is a stream of items delivered through `RpcStream` messages.
    Stream,
}

/// A decoded RPC call.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcCallFrame {
    pub call_id: u32,
    pub procedure: String,
    pub payload: Value,
}

/// Body of a decoded RPC response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Value(Value),
    Error(RpcError),
    Stream,
}

/// A decoded RPC response.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcResponseFrame {
    pub call_id: u32,
    pub body: ResponseBody,
}

#[derive(Serialize, Deserialize)]
struct CallEnvelope(u32, String, StreamsMetadata, Value);

#[derive(Serialize, Deserialize)]
struct ResponseEnvelope(u32, Option<RpcError>, StreamsMetadata, Value, bool);

/// Serialization format for structured payloads.
///
/// Implementations must be stateless: one instance is shared by every
/// connection that negotiated it.
pub trait Format: Send + Sync + 'static {
    /// Content type this format produces.
    fn content_type(&self) -> &'static str;

    /// Content type patterns this format can decode. `*` matches any run of
    /// characters.
    fn accept(&self) -> &'static [&'static str];

    /// Encode a structured value.
    fn encode(&self, value: &Value) -> Result<Vec<u8>>;

    /// Decode a structured value.
    fn decode(&self, bytes: &[u8]) -> Result<Value>;

    /// Encode an RPC call as `[callId, procedure, streams, payload]`.
    fn encode_rpc(
        &self,
        call_id: u32,
        procedure: &str,
        payload: Payload,
        ctx: &mut dyn EncodeRpcContext,
    ) -> Result<Vec<u8>> {
        let envelope = call_envelope(call_id, procedure, payload, ctx)?;
        self.encode(&serde_json::to_value(envelope)?)
    }

    /// Decode an RPC call, registering the streams it declares.
    fn decode_rpc(&self, bytes: &[u8], ctx: &mut dyn DecodeRpcContext) -> Result<RpcCallFrame> {
        open_call_envelope(self.decode(bytes)?, ctx)
    }

    /// Encode several calls sent as one batch.
    fn encode_rpc_batch(
        &self,
        calls: Vec<(u32, String, Payload)>,
        ctx: &mut dyn EncodeRpcContext,
    ) -> Result<Vec<u8>> {
        let mut envelopes = Vec::with_capacity(calls.len());
        for (call_id, procedure, payload) in calls {
            let envelope = call_envelope(call_id, &procedure, payload, ctx)?;
            envelopes.push(serde_json::to_value(envelope)?);
        }
        self.encode(&Value::Array(envelopes))
    }

    /// Decode a batch of calls.
    fn decode_rpc_batch(
        &self,
        bytes: &[u8],
        ctx: &mut dyn DecodeRpcContext,
    ) -> Result<Vec<RpcCallFrame>> {
        match self.decode(bytes)? {
            Value::Array(items) => items
                .into_iter()
                .map(|item| open_call_envelope(item, ctx))
                .collect(),
            other => Err(WiremuxError::decode(format!(
                "expected an array of calls, got {}",
                other
            ))),
        }
    }

    /// Encode a response as `[callId, error, streams, payload, isStream]`.
    fn encode_rpc_response(
        &self,
        call_id: u32,
        outcome: RpcOutcome,
        ctx: &mut dyn EncodeRpcContext,
    ) -> Result<Vec<u8>> {
        let envelope = match outcome {
            RpcOutcome::Value(payload) => {
                let (value, streams) = payload.into_wire(ctx)?;
                ResponseEnvelope(call_id, None, streams, value, false)
            }
            RpcOutcome::Error(error) => {
                ResponseEnvelope(call_id, Some(error), StreamsMetadata::new(), Value::Null, false)
            }
            RpcOutcome::Stream => {
                ResponseEnvelope(call_id, None, StreamsMetadata::new(), Value::Null, true)
            }
        };
        self.encode(&serde_json::to_value(envelope)?)
    }

    /// Decode a response, registering the streams it declares.
    fn decode_rpc_response(
        &self,
        bytes: &[u8],
        ctx: &mut dyn DecodeRpcContext,
    ) -> Result<RpcResponseFrame> {
        let ResponseEnvelope(call_id, error, streams, payload, is_stream) =
            serde_json::from_value(self.decode(bytes)?).map_err(WiremuxError::decode)?;
        let body = match (error, is_stream) {
            (Some(error), _) => ResponseBody::Error(error),
            (None, true) => ResponseBody::Stream,
            (None, false) => {
                bind_streams(&payload, streams, ctx)?;
                ResponseBody::Value(payload)
            }
        };
        Ok(RpcResponseFrame { call_id, body })
    }
}

fn call_envelope(
    call_id: u32,
    procedure: &str,
    payload: Payload,
    ctx: &mut dyn EncodeRpcContext,
) -> Result<CallEnvelope> {
    let (value, streams) = payload.into_wire(ctx)?;
    Ok(CallEnvelope(call_id, procedure.to_string(), streams, value))
}

fn open_call_envelope(value: Value, ctx: &mut dyn DecodeRpcContext) -> Result<RpcCallFrame> {
    let CallEnvelope(call_id, procedure, streams, payload) =
        serde_json::from_value(value).map_err(WiremuxError::decode)?;
    bind_streams(&payload, streams, ctx)?;
    Ok(RpcCallFrame {
        call_id,
        procedure,
        payload,
    })
}

/// Register every declared stream, then check that each token in the
/// payload refers to one of them.
fn bind_streams(
    payload: &Value,
    streams: StreamsMetadata,
    ctx: &mut dyn DecodeRpcContext,
) -> Result<()> {
    let mut declared = Vec::with_capacity(streams.len());
    for (key, metadata) in streams {
        let id: u32 = key
            .parse()
            .map_err(|_| WiremuxError::decode(format!("invalid stream id {:?}", key)))?;
        metadata.validate()?;
        ctx.add_stream(id, metadata)?;
        declared.push(id);
    }
    check_tokens(payload, &declared)
}

fn check_tokens(value: &Value, declared: &[u32]) -> Result<()> {
    match value {
        Value::String(_) => match parse_stream_token(value) {
            Some(id) if !declared.contains(&id) => Err(WiremuxError::decode(format!(
                "payload references undeclared stream {}",
                id
            ))),
            _ => Ok(()),
        },
        Value::Array(items) => items.iter().try_for_each(|v| check_tokens(v, declared)),
        Value::Object(map) => map.values().try_for_each(|v| check_tokens(v, declared)),
        _ => Ok(()),
    }
}

/// Split an `Accept`/`Content-Type` header into types ordered by preference.
///
/// Entries are sorted by their `q` parameter (default 1, highest first);
/// `*/*` always sorts last.
pub fn parse_content_types(types: &str) -> Vec<String> {
    let normalized = types.trim();
    if normalized == "*/*" {
        return vec!["*/*".to_string()];
    }

    let mut parsed: Vec<(String, f32)> = normalized
        .split(',')
        .map(|entry| {
            let mut parts = entry.split(';');
            let media = parts.next().unwrap_or_default().trim().to_string();
            let q = parts
                .filter_map(|param| {
                    let (name, value) = param.split_once('=')?;
                    (name.trim() == "q").then(|| value.trim().parse::<f32>().ok())?
                })
                .next()
                .unwrap_or(1.0);
            (media, q)
        })
        .filter(|(media, _)| !media.is_empty())
        .collect();

    // Stable sort keeps header order among equal weights.
    parsed.sort_by(|(a, qa), (b, qb)| match (a == "*/*", b == "*/*") {
        (true, false) => std::cmp::Ordering::Greater,
        (false, true) => std::cmp::Ordering::Less,
        _ => qb.partial_cmp(qa).unwrap_or(std::cmp::Ordering::Equal),
    });

    parsed.into_iter().map(|(media, _)| media).collect()
}

/// Glob-style match where `*` stands for any run of characters.
fn pattern_matches(pattern: &str, value: &str) -> bool {
    let mut segments = pattern.split('*');
    let first = segments.next().unwrap_or_default();
    let Some(mut rest) = value.strip_prefix(first) else {
        return false;
    };
    let segments: Vec<&str> = segments.collect();
    let Some((last, middle)) = segments.split_last() else {
        // No `*` in the pattern.
        return rest.is_empty();
    };
    for segment in middle {
        match rest.find(segment) {
            Some(index) => rest = &rest[index + segment.len()..],
            None => return false,
        }
    }
    rest.ends_with(last)
}

/// The set of formats a server or client is willing to speak.
#[derive(Clone, Default)]
pub struct FormatRegistry {
    formats: Vec<Arc<dyn Format>>,
}

impl FormatRegistry {
    pub fn new(formats: Vec<Arc<dyn Format>>) -> Self {
        Self { formats }
    }

    /// Register another format. Earlier registrations win ties.
    pub fn register(&mut self, format: Arc<dyn Format>) {
        self.formats.push(format);
    }

    /// Pick the format able to decode bodies of `content_type`.
    pub fn supports_decoder(&self, content_type: &str) -> Result<Arc<dyn Format>> {
        self.find(content_type, |format, media| {
            format
                .accept()
                .iter()
                .any(|pattern| pattern_matches(pattern, media))
        })
    }

    /// Pick the format that produces one of the types in `accept`.
    pub fn supports_encoder(&self, accept: &str) -> Result<Arc<dyn Format>> {
        self.find(accept, |format, media| {
            pattern_matches(media, format.content_type())
        })
    }

    fn find<F>(&self, header: &str, matches: F) -> Result<Arc<dyn Format>>
    where
        F: Fn(&dyn Format, &str) -> bool,
    {
        for media in parse_content_types(header) {
            for format in &self.formats {
                if media == "*/*" || matches(format.as_ref(), &media) {
                    return Ok(format.clone());
                }
            }
        }
        Err(WiremuxError::UnsupportedFormat(header.to_string()))
    }
}
