//! Tagged messages.
//!
//! Every message on the wire is:
//! ```text
//! ┌─────────┬──────────────────────────────┐
//! │ Tag     │ Body                         │
//! │ 1 byte  │ tag-specific, rest of frame  │
//! └─────────┴──────────────────────────────┘
//! ```
//!
//! Bodies are either fixed binary layouts (ids little-endian) or values
//! serialized by the connection's [`Format`].

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::Format;
use crate::error::{Result, WiremuxError};

/// Side of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    /// The role of the other end.
    #[inline]
    pub fn peer(self) -> Role {
        match self {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        }
    }
}

/// Message discriminant, first byte of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageTag {
    Event = 10,
    Rpc = 11,
    RpcBatch = 12,
    RpcStream = 13,
    RpcAbort = 14,
    Subscription = 15,

    ClientStreamAbort = 30,
    ClientStreamPush = 31,
    ClientStreamPull = 32,
    ClientStreamEnd = 33,
    ClientUnsubscribe = 34,

    ServerStreamAbort = 50,
    ServerStreamPull = 51,
    ServerStreamPush = 52,
    ServerStreamEnd = 53,
    ServerUnsubscribe = 54,
    ServerSubscriptionEvent = 55,
}

impl MessageTag {
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageTag {
    type Error = WiremuxError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            10 => Self::Event,
            11 => Self::Rpc,
            12 => Self::RpcBatch,
            13 => Self::RpcStream,
            14 => Self::RpcAbort,
            15 => Self::Subscription,
            30 => Self::ClientStreamAbort,
            31 => Self::ClientStreamPush,
            32 => Self::ClientStreamPull,
            33 => Self::ClientStreamEnd,
            34 => Self::ClientUnsubscribe,
            50 => Self::ServerStreamAbort,
            51 => Self::ServerStreamPull,
            52 => Self::ServerStreamPush,
            53 => Self::ServerStreamEnd,
            54 => Self::ServerUnsubscribe,
            55 => Self::ServerSubscriptionEvent,
            other => return Err(WiremuxError::UnknownTag(other)),
        })
    }
}

/// The four tags describing a binary stream, picked by which side owns
/// (produces) the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamTags {
    pub push: MessageTag,
    pub pull: MessageTag,
    pub end: MessageTag,
    pub abort: MessageTag,
}

impl StreamTags {
    pub fn owned_by(role: Role) -> Self {
        match role {
            Role::Client => Self {
                push: MessageTag::ClientStreamPush,
                pull: MessageTag::ClientStreamPull,
                end: MessageTag::ClientStreamEnd,
                abort: MessageTag::ClientStreamAbort,
            },
            Role::Server => Self {
                push: MessageTag::ServerStreamPush,
                pull: MessageTag::ServerStreamPull,
                end: MessageTag::ServerStreamEnd,
                abort: MessageTag::ServerStreamAbort,
            },
        }
    }
}

/// A single protocol message: tag plus raw body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub tag: MessageTag,
    pub body: Bytes,
}

impl Message {
    pub fn new(tag: MessageTag, body: impl Into<Bytes>) -> Self {
        Self {
            tag,
            body: body.into(),
        }
    }

    /// Serialize the frame: tag byte followed by the body.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.body.len());
        buf.put_u8(self.tag.as_u8());
        buf.put_slice(&self.body);
        buf.freeze()
    }

    /// Parse a frame. The body is shared with `frame`, not copied.
    pub fn from_bytes(mut frame: Bytes) -> Result<Self> {
        if frame.is_empty() {
            return Err(WiremuxError::decode("empty message"));
        }
        let tag = MessageTag::try_from(frame[0])?;
        let body = frame.split_off(1);
        Ok(Self { tag, body })
    }

    /// Decode the body with `format` into `T`.
    pub fn body_value<T: DeserializeOwned>(&self, format: &dyn Format) -> Result<T> {
        serde_json::from_value(format.decode(&self.body)?).map_err(WiremuxError::decode)
    }
}

/// Encode `payload` with `format` and prefix it with `tag`.
pub fn encode<T: Serialize>(tag: MessageTag, payload: &T, format: &dyn Format) -> Result<Bytes> {
    let body = format.encode(&serde_json::to_value(payload)?)?;
    Ok(Message::new(tag, body).to_bytes())
}

/// Split a frame into tag and body.
///
/// Unknown tags fail with [`WiremuxError::UnknownTag`].
pub fn decode(frame: Bytes) -> Result<Message> {
    Message::from_bytes(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{JsonFormat, MsgPackFormat};
    use serde_json::{json, Value};

    #[test]
    fn test_tag_values() {
        assert_eq!(MessageTag::Event.as_u8(), 10);
        assert_eq!(MessageTag::RpcStream.as_u8(), 13);
        assert_eq!(MessageTag::ClientUnsubscribe.as_u8(), 34);
        assert_eq!(MessageTag::ServerSubscriptionEvent.as_u8(), 55);

        for value in 0..=u8::MAX {
            if let Ok(tag) = MessageTag::try_from(value) {
                assert_eq!(tag.as_u8(), value);
            }
        }
    }

    #[test]
    fn test_unknown_tag() {
        let err = decode(Bytes::from_static(&[99, 1, 2])).unwrap_err();
        assert!(matches!(err, WiremuxError::UnknownTag(99)));
    }

    #[test]
    fn test_empty_frame() {
        let err = decode(Bytes::new()).unwrap_err();
        assert!(matches!(err, WiremuxError::Decode(_)));
    }

    #[test]
    fn test_encode_prefixes_tag() {
        let bytes = encode(MessageTag::Event, &json!(["tick", 1]), &JsonFormat).unwrap();
        assert_eq!(bytes[0], 10);
        assert_eq!(&bytes[1..], br#"["tick",1]"#);

        let message = decode(bytes).unwrap();
        assert_eq!(message.tag, MessageTag::Event);
        let value: Value = message.body_value(&JsonFormat).unwrap();
        assert_eq!(value, json!(["tick", 1]));
    }

    #[test]
    fn test_body_value_shape_mismatch() {
        let bytes = encode(MessageTag::Subscription, &json!({"a": 1}), &MsgPackFormat).unwrap();
        let message = decode(bytes).unwrap();
        let err = message
            .body_value::<(String, Value)>(&MsgPackFormat)
            .unwrap_err();
        assert!(matches!(err, WiremuxError::Decode(_)));
    }

    #[test]
    fn test_stream_tags_by_owner() {
        let client = StreamTags::owned_by(Role::Client);
        assert_eq!(client.push, MessageTag::ClientStreamPush);
        assert_eq!(client.pull, MessageTag::ClientStreamPull);

        let server = StreamTags::owned_by(Role::Server);
        assert_eq!(server.end, MessageTag::ServerStreamEnd);
        assert_eq!(server.abort, MessageTag::ServerStreamAbort);
        assert_eq!(Role::Client.peer(), Role::Server);
    }
}
