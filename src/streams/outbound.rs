//! Registry of streams this side produces.
//!
//! Each registered producer is driven by its own pump task. The pump waits
//! for pull credit granted by the remote consumer, takes the next chunk from
//! the producer, and never sends more than the credit allows: a blob chunk
//! larger than the credit is split and the rest held back until the next
//! grant. Aborting a stream drops its producer, which cancels whatever work
//! feeds it.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{StreamWire, WireKind};
use crate::abort::{AbortController, AbortReason};
use crate::codec::BlobMetadata;
use crate::error::{Result, WiremuxError};

/// Source of chunks for an outbound stream. For streaming results each
/// item is one already-encoded chunk.
pub type ChunkProducer = BoxStream<'static, Result<Bytes>>;

struct Entry {
    id: u32,
    metadata: Option<BlobMetadata>,
    /// Bytes (or items) the consumer asked for and has not received yet.
    credit: Mutex<u64>,
    credit_changed: Notify,
    abort: AbortController,
}

impl Entry {
    async fn wait_for_credit(&self) -> u64 {
        loop {
            let changed = self.credit_changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();
            let credit = *self.credit.lock();
            if credit > 0 {
                return credit;
            }
            changed.await;
        }
    }

    fn consume(&self, units: u64) {
        let mut credit = self.credit.lock();
        *credit = credit.saturating_sub(units);
    }
}

struct Shared {
    entries: Mutex<HashMap<u32, Arc<Entry>>>,
    wire: StreamWire,
}

impl Shared {
    fn entry(&self, id: u32) -> Result<Arc<Entry>> {
        self.entries
            .lock()
            .get(&id)
            .cloned()
            .ok_or(WiremuxError::StreamNotFound(id))
    }

    fn detach(&self, id: u32) -> Option<Arc<Entry>> {
        self.entries.lock().remove(&id)
    }

    async fn push(&self, id: u32, chunk: Bytes) -> Result<()> {
        self.entry(id)?;
        self.wire.send_push(id, chunk).await
    }

    /// Take as much of `chunk` as `credit` covers and charge the entry for
    /// it. Returns the part to send now and the part held back.
    fn take_within_credit(
        &self,
        entry: &Entry,
        credit: u64,
        mut chunk: Bytes,
    ) -> (Bytes, Option<Bytes>) {
        let mut rest = None;
        let units = match self.wire.kind() {
            WireKind::Blob(_) => {
                if chunk.len() as u64 > credit {
                    rest = Some(chunk.split_off(credit as usize));
                }
                chunk.len() as u64
            }
            WireKind::RpcItems => 1,
        };
        entry.consume(units);
        (chunk, rest)
    }
}

/// Registry of outbound streams for one connection.
#[derive(Clone)]
pub struct OutboundStreams {
    shared: Arc<Shared>,
}

impl OutboundStreams {
    pub fn new(wire: StreamWire) -> Self {
        Self {
            shared: Arc::new(Shared {
                entries: Mutex::new(HashMap::new()),
                wire,
            }),
        }
    }

    /// Register a producer and start pumping it as credit arrives.
    pub fn add(
        &self,
        id: u32,
        metadata: Option<BlobMetadata>,
        producer: ChunkProducer,
    ) -> Result<()> {
        let entry = Arc::new(Entry {
            id,
            metadata,
            credit: Mutex::new(0),
            credit_changed: Notify::new(),
            abort: AbortController::new(),
        });

        {
            let mut entries = self.shared.entries.lock();
            if entries.contains_key(&id) {
                return Err(WiremuxError::decode(format!(
                    "outbound stream {} is already registered",
                    id
                )));
            }
            entries.insert(id, entry.clone());
        }

        tracing::debug!(stream_id = id, "Outbound stream registered");
        tokio::spawn(pump(self.shared.clone(), entry, producer));
        Ok(())
    }

    /// Record pull credit from the consumer. In item mode every grant is
    /// worth one item whatever `size` says.
    pub fn grant(&self, id: u32, size: u32) -> Result<()> {
        let entry = self.shared.entry(id)?;
        let units = match self.shared.wire.kind() {
            WireKind::Blob(_) => u64::from(size),
            WireKind::RpcItems => 1,
        };
        *entry.credit.lock() += units;
        entry.credit_changed.notify_waiters();
        Ok(())
    }

    /// Send one chunk of a registered stream to the peer, alongside its
    /// producer. Waits for pull credit like the pump does: a blob chunk
    /// larger than the credit goes out in pieces as grants arrive.
    pub async fn push(&self, id: u32, chunk: Bytes) -> Result<()> {
        let entry = self.shared.entry(id)?;
        let signal = entry.abort.signal();
        let mut remaining = Some(chunk);

        while let Some(chunk) = remaining.take() {
            let credit = tokio::select! {
                _ = signal.aborted() => return Err(WiremuxError::StreamNotFound(id)),
                credit = entry.wait_for_credit() => credit,
            };
            let (now, rest) = self.shared.take_within_credit(&entry, credit, chunk);
            self.shared.push(id, now).await?;
            remaining = rest;
        }
        Ok(())
    }

    /// Stop a stream at the consumer's request: cancel the producer and
    /// drop the entry. Nothing is sent back.
    pub fn abort(&self, id: u32) -> Result<()> {
        let entry = self
            .shared
            .detach(id)
            .ok_or(WiremuxError::StreamNotFound(id))?;
        entry.abort.abort(AbortReason::cancelled("Stream aborted by peer"));
        tracing::debug!(stream_id = id, "Outbound stream aborted");
        Ok(())
    }

    /// Cancel every producer. Used on teardown, so nothing is sent.
    pub fn clear(&self, reason: &str) {
        let entries: Vec<_> = self
            .shared
            .entries
            .lock()
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in entries {
            entry.abort.abort(AbortReason::shutdown(reason));
        }
    }

    pub fn metadata(&self, id: u32) -> Result<Option<BlobMetadata>> {
        Ok(self.shared.entry(id)?.metadata.clone())
    }

    #[inline]
    pub fn contains(&self, id: u32) -> bool {
        self.shared.entries.lock().contains_key(&id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.shared.entries.lock().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.shared.entries.lock().is_empty()
    }
}

async fn pump(shared: Arc<Shared>, entry: Arc<Entry>, mut producer: ChunkProducer) {
    let id = entry.id;
    let signal = entry.abort.signal();
    let mut held_back: Option<Bytes> = None;

    loop {
        let credit = tokio::select! {
            _ = signal.aborted() => return,
            credit = entry.wait_for_credit() => credit,
        };

        let chunk = match held_back.take() {
            Some(chunk) => chunk,
            None => {
                let next = tokio::select! {
                    _ = signal.aborted() => return,
                    next = producer.next() => next,
                };
                match next {
                    Some(Ok(chunk)) if chunk.is_empty() => continue,
                    Some(Ok(chunk)) => chunk,
                    Some(Err(e)) => {
                        if shared.detach(id).is_some() {
                            tracing::debug!(stream_id = id, "Outbound stream failed: {}", e);
                            let reason = e.to_string();
                            if let Err(e) = shared.wire.send_abort(id, &reason).await {
                                tracing::warn!(stream_id = id, "Failed to send stream abort: {}", e);
                            }
                        }
                        return;
                    }
                    None => {
                        if shared.detach(id).is_some() {
                            if let Err(e) = shared.wire.send_end(id).await {
                                tracing::warn!(stream_id = id, "Failed to send stream end: {}", e);
                            }
                        }
                        return;
                    }
                }
            }
        };

        let (chunk, rest) = shared.take_within_credit(&entry, credit, chunk);
        held_back = rest;

        match shared.push(id, chunk).await {
            Ok(()) => {}
            // Aborted while the chunk was in hand.
            Err(WiremuxError::StreamNotFound(_)) => return,
            Err(e) => {
                tracing::warn!(stream_id = id, "Failed to send stream chunk: {}", e);
                if shared.detach(id).is_some() {
                    entry.abort.abort(AbortReason::shutdown(e.to_string()));
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures::stream;

    use crate::protocol::body::{RpcStreamFrame, StreamAbort, StreamEnd, StreamPush};
    use crate::protocol::{MessageTag, Role};
    use crate::streams::test_support::{capture_writer, next_message};

    fn producer(chunks: &[&'static [u8]]) -> ChunkProducer {
        let items: Vec<Result<Bytes>> = chunks.iter().map(|c| Ok(Bytes::from_static(c))).collect();
        stream::iter(items).boxed()
    }

    #[tokio::test]
    async fn test_chunks_respect_credit() {
        let (writer, mut frames) = capture_writer();
        let streams = OutboundStreams::new(StreamWire::blob(writer, Role::Server));
        streams.add(1, None, producer(&[b"abcdef"])).unwrap();

        // Nothing moves without credit.
        let idle = tokio::time::timeout(Duration::from_millis(20), next_message(&mut frames)).await;
        assert!(idle.is_err());

        streams.grant(1, 4).unwrap();
        let message = next_message(&mut frames).await;
        assert_eq!(message.tag, MessageTag::ServerStreamPush);
        let push = StreamPush::decode(message.body).unwrap();
        assert_eq!(&push.chunk[..], b"abcd");

        streams.grant(1, 10).unwrap();
        let message = next_message(&mut frames).await;
        assert_eq!(&StreamPush::decode(message.body).unwrap().chunk[..], b"ef");

        let message = next_message(&mut frames).await;
        assert_eq!(message.tag, MessageTag::ServerStreamEnd);
        assert_eq!(StreamEnd::decode(message.body).unwrap().stream_id, 1);
        assert!(!streams.contains(1));
    }

    #[tokio::test]
    async fn test_client_owned_stream_uses_client_tags() {
        let (writer, mut frames) = capture_writer();
        let streams = OutboundStreams::new(StreamWire::blob(writer, Role::Client));
        streams.add(3, None, producer(&[b"x"])).unwrap();
        streams.grant(3, 1).unwrap();

        assert_eq!(next_message(&mut frames).await.tag, MessageTag::ClientStreamPush);
        assert_eq!(next_message(&mut frames).await.tag, MessageTag::ClientStreamEnd);
    }

    #[tokio::test]
    async fn test_producer_error_sends_abort() {
        let (writer, mut frames) = capture_writer();
        let streams = OutboundStreams::new(StreamWire::blob(writer, Role::Server));
        let failing = stream::iter(vec![Err(WiremuxError::StreamAborted("disk gone".into()))]);
        streams.add(2, None, failing.boxed()).unwrap();
        streams.grant(2, 100).unwrap();

        let message = next_message(&mut frames).await;
        assert_eq!(message.tag, MessageTag::ServerStreamAbort);
        let abort = StreamAbort::decode(message.body).unwrap();
        assert!(abort.reason.unwrap().contains("disk gone"));
        assert!(!streams.contains(2));
    }

    #[tokio::test]
    async fn test_abort_cancels_producer() {
        let (writer, _frames) = capture_writer();
        let streams = OutboundStreams::new(StreamWire::blob(writer, Role::Server));

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let guarded = stream::pending::<Result<Bytes>>().map(move |item| {
            let _keep = &tx;
            item
        });
        streams.add(5, None, guarded.boxed()).unwrap();
        streams.grant(5, 1).unwrap();

        streams.abort(5).unwrap();
        // The producer is dropped, which drops the sender it captured.
        assert!(tokio::time::timeout(Duration::from_secs(1), rx).await.unwrap().is_err());

        assert!(matches!(streams.abort(5), Err(WiremuxError::StreamNotFound(5))));
        assert!(matches!(streams.grant(5, 1), Err(WiremuxError::StreamNotFound(5))));
        assert!(matches!(
            streams.push(5, Bytes::from_static(b"late")).await,
            Err(WiremuxError::StreamNotFound(5))
        ));
    }

    #[tokio::test]
    async fn test_direct_push_waits_for_credit() {
        let (writer, mut frames) = capture_writer();
        let streams = OutboundStreams::new(StreamWire::blob(writer, Role::Server));
        streams.add(6, None, stream::pending().boxed()).unwrap();

        let task = {
            let streams = streams.clone();
            tokio::spawn(async move { streams.push(6, Bytes::from_static(b"hello")).await })
        };

        let idle = tokio::time::timeout(Duration::from_millis(20), next_message(&mut frames)).await;
        assert!(idle.is_err());

        streams.grant(6, 3).unwrap();
        let push = StreamPush::decode(next_message(&mut frames).await.body).unwrap();
        assert_eq!(&push.chunk[..], b"hel");

        streams.grant(6, 8).unwrap();
        let push = StreamPush::decode(next_message(&mut frames).await.body).unwrap();
        assert_eq!(&push.chunk[..], b"lo");
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_item_mode_counts_items() {
        let (writer, mut frames) = capture_writer();
        let streams = OutboundStreams::new(StreamWire::rpc_items(writer));
        streams.add(9, None, producer(&[b"[1]", b"[2]"])).unwrap();

        streams.grant(9, 1).unwrap();
        let first = RpcStreamFrame::decode(next_message(&mut frames).await.body).unwrap();
        assert_eq!(
            first,
            RpcStreamFrame::Chunk {
                call_id: 9,
                data: Bytes::from_static(b"[1]")
            }
        );

        let idle = tokio::time::timeout(Duration::from_millis(20), next_message(&mut frames)).await;
        assert!(idle.is_err());

        streams.grant(9, 1).unwrap();
        let second = RpcStreamFrame::decode(next_message(&mut frames).await.body).unwrap();
        assert_eq!(second.call_id(), 9);
        streams.grant(9, 1).unwrap();
        let end = RpcStreamFrame::decode(next_message(&mut frames).await.body).unwrap();
        assert_eq!(end, RpcStreamFrame::End { call_id: 9 });
    }

    #[tokio::test]
    async fn test_clear_removes_all() {
        let (writer, _frames) = capture_writer();
        let streams = OutboundStreams::new(StreamWire::blob(writer, Role::Server));
        streams.add(7, None, stream::pending().boxed()).unwrap();
        streams.add(8, None, stream::pending().boxed()).unwrap();
        assert_eq!(streams.len(), 2);

        streams.clear("connection closed");
        assert!(streams.is_empty());
        assert!(matches!(streams.abort(7), Err(WiremuxError::StreamNotFound(7))));
    }
}
