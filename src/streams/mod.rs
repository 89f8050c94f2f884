//! Stream registries.
//!
//! Two registries per connection, opposite in data direction:
//!
//! - [`InboundStreams`] - streams the peer is sending. Consumers pull bytes;
//!   pull credit is requested from the peer as the buffer runs dry.
//! - [`OutboundStreams`] - streams this side produces. A pump task per stream
//!   waits for pull credit, then hands out chunks no larger than the credit.
//!
//! Both registries are keyed by a numeric id, fail fast with
//! [`StreamNotFound`](crate::error::WiremuxError::StreamNotFound) on ids they
//! do not hold, and drop entries as soon as a stream ends or aborts.
//!
//! The same registries carry streaming RPC results. In that mode
//! ([`WireKind::RpcItems`]) the id is the call id, one credit is one item, and
//! chunks travel in `RpcStream` messages.

mod inbound;
mod outbound;

use bytes::Bytes;

use crate::error::Result;
use crate::protocol::body::{
    RpcAbort, RpcStreamFrame, RpcStreamPull, StreamAbort, StreamEnd, StreamPull, StreamPush,
};
use crate::protocol::{MessageTag, Role, StreamTags};
use crate::writer::WriterHandle;

pub use inbound::{InboundStream, InboundStreams};
pub use outbound::{ChunkProducer, OutboundStreams};

/// Default pull credit requested per round trip (bytes).
pub const DEFAULT_PULL_SIZE: u32 = 65535;

/// How a stream maps onto messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireKind {
    /// Binary blob stream using the tag group of the owning side.
    Blob(StreamTags),
    /// Streaming RPC result keyed by call id.
    RpcItems,
}

/// Sends the control and data messages of one registry's streams.
#[derive(Clone)]
pub struct StreamWire {
    writer: WriterHandle,
    kind: WireKind,
}

impl StreamWire {
    /// Blob streams produced by `owner`.
    pub fn blob(writer: WriterHandle, owner: Role) -> Self {
        Self {
            writer,
            kind: WireKind::Blob(StreamTags::owned_by(owner)),
        }
    }

    /// Streaming RPC results.
    pub fn rpc_items(writer: WriterHandle) -> Self {
        Self {
            writer,
            kind: WireKind::RpcItems,
        }
    }

    #[inline]
    pub fn kind(&self) -> WireKind {
        self.kind
    }

    /// Producer side: deliver a chunk.
    pub(crate) async fn send_push(&self, id: u32, chunk: Bytes) -> Result<()> {
        let (tag, body) = match self.kind {
            WireKind::Blob(tags) => (tags.push, StreamPush { stream_id: id, chunk }.encode()),
            WireKind::RpcItems => (
                MessageTag::RpcStream,
                RpcStreamFrame::Chunk {
                    call_id: id,
                    data: chunk,
                }
                .encode(),
            ),
        };
        self.writer.send_message(tag, body).await
    }

    /// Producer side: the stream is complete.
    pub(crate) async fn send_end(&self, id: u32) -> Result<()> {
        let (tag, body) = match self.kind {
            WireKind::Blob(tags) => (tags.end, StreamEnd { stream_id: id }.encode()),
            WireKind::RpcItems => (
                MessageTag::RpcStream,
                RpcStreamFrame::End { call_id: id }.encode(),
            ),
        };
        self.writer.send_message(tag, body).await
    }

    /// Producer side: the stream failed.
    pub(crate) async fn send_abort(&self, id: u32, reason: &str) -> Result<()> {
        let reason = Some(reason.to_string());
        let (tag, body) = match self.kind {
            WireKind::Blob(tags) => (
                tags.abort,
                StreamAbort {
                    stream_id: id,
                    reason,
                }
                .encode(),
            ),
            WireKind::RpcItems => (
                MessageTag::RpcStream,
                RpcStreamFrame::Abort {
                    call_id: id,
                    reason,
                }
                .encode(),
            ),
        };
        self.writer.send_message(tag, body).await
    }

    /// Consumer side: grant `size` bytes (or one item) of credit.
    pub(crate) fn request_credit(&self, id: u32, size: u32) -> Result<()> {
        let (tag, body) = match self.kind {
            WireKind::Blob(tags) => (tags.pull, StreamPull { stream_id: id, size }.encode()),
            WireKind::RpcItems => (MessageTag::RpcStream, RpcStreamPull { call_id: id }.encode()),
        };
        self.writer.send_control(tag, body)
    }

    /// Consumer side: stop the producer.
    pub(crate) fn cancel(&self, id: u32, reason: &str) -> Result<()> {
        let reason = Some(reason.to_string());
        let (tag, body) = match self.kind {
            WireKind::Blob(tags) => (
                tags.abort,
                StreamAbort {
                    stream_id: id,
                    reason,
                }
                .encode(),
            ),
            WireKind::RpcItems => (
                MessageTag::RpcAbort,
                RpcAbort {
                    call_id: id,
                    reason,
                }
                .encode(),
            ),
        };
        self.writer.send_control(tag, body)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use bytes::Bytes;
    use futures::channel::mpsc::{unbounded, UnboundedReceiver};

    use crate::protocol::{decode, Message};
    use crate::writer::{spawn_writer_task, WriterConfig, WriterHandle};

    /// A writer whose frames land in a channel the test can read.
    pub fn capture_writer() -> (WriterHandle, UnboundedReceiver<Bytes>) {
        let (sink, frames) = unbounded::<Bytes>();
        let (writer, _task) = spawn_writer_task(sink, WriterConfig::default());
        (writer, frames)
    }

    /// Like [`capture_writer`], but with no room for ordinary frames: every
    /// non-blocking send fails with backpressure.
    pub fn saturated_writer() -> (WriterHandle, UnboundedReceiver<Bytes>) {
        let (sink, frames) = unbounded::<Bytes>();
        let config = WriterConfig {
            max_pending_frames: 0,
            ..WriterConfig::default()
        };
        let (writer, _task) = spawn_writer_task(sink, config);
        (writer, frames)
    }

    pub async fn next_message(frames: &mut UnboundedReceiver<Bytes>) -> Message {
        use futures::StreamExt;
        let frame = frames.next().await.expect("writer closed");
        decode(frame).expect("valid frame")
    }
}
