//! Typed message bodies.
//!
//! Binary bodies (stream and abort control) use fixed little-endian layouts:
//! ```text
//! StreamPush   [u32 streamId][chunk ...]
//! StreamPull   [u32 streamId][u32 size]
//! StreamEnd    [u32 streamId]
//! StreamAbort  [u32 streamId][utf8 reason ...]   (reason optional)
//! RpcAbort     [u32 callId][utf8 reason ...]     (reason optional)
//! RpcStream    [u32 callId]                      (client: pull one item)
//! RpcStream    [u32 callId][u8 kind][tail ...]   (server: 0 chunk, 1 end, 2 abort)
//! ```
//!
//! Structured bodies are serde tuples encoded by the connection format.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, WiremuxError};

fn take_u32(body: &mut Bytes, field: &str) -> Result<u32> {
    if body.remaining() < 4 {
        return Err(WiremuxError::decode(format!("missing {}", field)));
    }
    Ok(body.get_u32_le())
}

fn take_reason(body: Bytes) -> Result<Option<String>> {
    if body.is_empty() {
        return Ok(None);
    }
    String::from_utf8(body.to_vec())
        .map(Some)
        .map_err(|_| WiremuxError::decode("abort reason is not valid UTF-8"))
}

fn with_reason(id: u32, reason: Option<&str>) -> Bytes {
    let reason = reason.unwrap_or_default();
    let mut buf = BytesMut::with_capacity(4 + reason.len());
    buf.put_u32_le(id);
    buf.put_slice(reason.as_bytes());
    buf.freeze()
}

fn expect_consumed(body: &Bytes, what: &str) -> Result<()> {
    if body.has_remaining() {
        return Err(WiremuxError::decode(format!(
            "{} has {} trailing bytes",
            what,
            body.remaining()
        )));
    }
    Ok(())
}

/// A chunk of stream data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPush {
    pub stream_id: u32,
    pub chunk: Bytes,
}

impl StreamPush {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.chunk.len());
        buf.put_u32_le(self.stream_id);
        buf.put_slice(&self.chunk);
        buf.freeze()
    }

    pub fn decode(mut body: Bytes) -> Result<Self> {
        let stream_id = take_u32(&mut body, "stream id")?;
        Ok(Self {
            stream_id,
            chunk: body,
        })
    }
}

/// Pull credit granted to a stream producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPull {
    pub stream_id: u32,
    pub size: u32,
}

impl StreamPull {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u32_le(self.stream_id);
        buf.put_u32_le(self.size);
        buf.freeze()
    }

    pub fn decode(mut body: Bytes) -> Result<Self> {
        let stream_id = take_u32(&mut body, "stream id")?;
        let size = take_u32(&mut body, "pull size")?;
        expect_consumed(&body, "stream pull")?;
        Ok(Self { stream_id, size })
    }
}

/// Natural end of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamEnd {
    pub stream_id: u32,
}

impl StreamEnd {
    pub fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&self.stream_id.to_le_bytes())
    }

    pub fn decode(mut body: Bytes) -> Result<Self> {
        let stream_id = take_u32(&mut body, "stream id")?;
        expect_consumed(&body, "stream end")?;
        Ok(Self { stream_id })
    }
}

/// Abnormal termination of a stream, from either side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamAbort {
    pub stream_id: u32,
    pub reason: Option<String>,
}

impl StreamAbort {
    pub fn encode(&self) -> Bytes {
        with_reason(self.stream_id, self.reason.as_deref())
    }

    pub fn decode(mut body: Bytes) -> Result<Self> {
        let stream_id = take_u32(&mut body, "stream id")?;
        Ok(Self {
            stream_id,
            reason: take_reason(body)?,
        })
    }
}

/// Cancellation of a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcAbort {
    pub call_id: u32,
    pub reason: Option<String>,
}

impl RpcAbort {
    pub fn encode(&self) -> Bytes {
        with_reason(self.call_id, self.reason.as_deref())
    }

    pub fn decode(mut body: Bytes) -> Result<Self> {
        let call_id = take_u32(&mut body, "call id")?;
        Ok(Self {
            call_id,
            reason: take_reason(body)?,
        })
    }
}

/// Client request for the next item of a streaming result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcStreamPull {
    pub call_id: u32,
}

impl RpcStreamPull {
    pub fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&self.call_id.to_le_bytes())
    }

    pub fn decode(mut body: Bytes) -> Result<Self> {
        let call_id = take_u32(&mut body, "call id")?;
        expect_consumed(&body, "rpc stream pull")?;
        Ok(Self { call_id })
    }
}

const RPC_STREAM_CHUNK: u8 = 0;
const RPC_STREAM_END: u8 = 1;
const RPC_STREAM_ABORT: u8 = 2;

/// Server-side frame of a streaming result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcStreamFrame {
    /// One format-encoded item.
    Chunk { call_id: u32, data: Bytes },
    End { call_id: u32 },
    Abort { call_id: u32, reason: Option<String> },
}

impl RpcStreamFrame {
    #[inline]
    pub fn call_id(&self) -> u32 {
        match self {
            Self::Chunk { call_id, .. } | Self::End { call_id } | Self::Abort { call_id, .. } => {
                *call_id
            }
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5);
        buf.put_u32_le(self.call_id());
        match self {
            Self::Chunk { data, .. } => {
                buf.put_u8(RPC_STREAM_CHUNK);
                buf.put_slice(data);
            }
            Self::End { .. } => buf.put_u8(RPC_STREAM_END),
            Self::Abort { reason, .. } => {
                buf.put_u8(RPC_STREAM_ABORT);
                buf.put_slice(reason.as_deref().unwrap_or_default().as_bytes());
            }
        }
        buf.freeze()
    }

    pub fn decode(mut body: Bytes) -> Result<Self> {
        let call_id = take_u32(&mut body, "call id")?;
        if !body.has_remaining() {
            return Err(WiremuxError::decode("missing rpc stream kind"));
        }
        match body.get_u8() {
            RPC_STREAM_CHUNK => Ok(Self::Chunk {
                call_id,
                data: body,
            }),
            RPC_STREAM_END => {
                expect_consumed(&body, "rpc stream end")?;
                Ok(Self::End { call_id })
            }
            RPC_STREAM_ABORT => Ok(Self::Abort {
                call_id,
                reason: take_reason(body)?,
            }),
            kind => Err(WiremuxError::decode(format!(
                "unknown rpc stream kind {}",
                kind
            ))),
        }
    }
}

/// `Event`: `[event, payload]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBody(pub String, pub Value);

/// `Subscription`: `[channelKey, payload]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeBody(pub String, pub Value);

/// `ClientUnsubscribe` / `ServerUnsubscribe`: the channel key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsubscribeBody(pub String);

/// `ServerSubscriptionEvent`: `[channelKey, event, payload]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionEventBody(pub String, pub String, pub Value);
