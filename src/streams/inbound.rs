//! Registry of streams the peer is sending.
//!
//! Each stream is a slot holding a FIFO of received chunks and a FIFO of
//! pending demands. A push satisfies queued demands in order or buffers; a
//! pull is satisfied from the buffer or enqueues a demand. Demands are
//! `oneshot` senders, so a reader that gives up (drops its future) releases
//! its place immediately.
//!
//! The slot is shared between the registry and every [`InboundStream`]
//! handle. Ending a stream removes it from the registry, but handles can
//! still drain what was buffered before they observe the end.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::{StreamWire, WireKind, DEFAULT_PULL_SIZE};
use crate::codec::BlobMetadata;
use crate::error::{Result, WiremuxError};

type SlotMap = Mutex<HashMap<u32, Arc<Slot>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Active,
    Ended,
    Aborted,
}

#[derive(Debug, Clone, Copy)]
enum Demand {
    /// Exactly `n` bytes, fewer only at end of stream.
    Exact(usize),
    /// Whatever the front chunk holds, up to `n` bytes.
    Any(usize),
}

struct Waiter {
    demand: Demand,
    tx: oneshot::Sender<Result<Bytes>>,
}

struct SlotState {
    status: Status,
    chunks: VecDeque<Bytes>,
    buffered: usize,
    waiters: VecDeque<Waiter>,
    /// Abort reason not yet reported to any reader.
    pending_error: Option<String>,
    /// Credit granted to the producer and not yet used.
    credit: u64,
    bytes_transferred: u64,
}

impl SlotState {
    fn take_exact(&mut self, size: usize) -> Bytes {
        let size = size.min(self.buffered);
        self.buffered -= size;
        match self.chunks.front_mut() {
            Some(front) if front.len() >= size => {
                let out = front.split_to(size);
                if front.is_empty() {
                    self.chunks.pop_front();
                }
                out
            }
            _ => {
                let mut out = BytesMut::with_capacity(size);
                while out.len() < size {
                    let Some(front) = self.chunks.front_mut() else {
                        break;
                    };
                    let wanted = size - out.len();
                    if front.len() <= wanted {
                        out.extend_from_slice(front);
                        self.chunks.pop_front();
                    } else {
                        out.extend_from_slice(&front.split_to(wanted));
                    }
                }
                out.freeze()
            }
        }
    }

    fn take_front(&mut self, max: usize) -> Bytes {
        match self.chunks.front_mut() {
            Some(front) if front.len() > max => {
                self.buffered -= max;
                front.split_to(max)
            }
            Some(_) => {
                let chunk = self.chunks.pop_front().unwrap_or_default();
                self.buffered -= chunk.len();
                chunk
            }
            None => Bytes::new(),
        }
    }

    /// Satisfy `demand` now if the buffer or the stream status allows it.
    fn try_take(&mut self, demand: Demand) -> Option<Result<Bytes>> {
        match (demand, self.status) {
            (Demand::Exact(size), Status::Active) if self.buffered >= size => {
                Some(Ok(self.take_exact(size)))
            }
            (Demand::Any(max), Status::Active) if self.buffered > 0 => {
                Some(Ok(self.take_front(max)))
            }
            (_, Status::Active) => None,
            (Demand::Exact(size), Status::Ended) => Some(Ok(self.take_exact(size))),
            (Demand::Any(max), Status::Ended) => Some(Ok(self.take_front(max))),
            (_, Status::Aborted) => match self.pending_error.take() {
                Some(reason) => Some(Err(WiremuxError::StreamAborted(reason))),
                None => Some(Ok(Bytes::new())),
            },
        }
    }

    /// Resolve queued demands in FIFO order until one cannot be satisfied.
    fn wake_waiters(&mut self) {
        while let Some(waiter) = self.waiters.front() {
            if waiter.tx.is_closed() {
                self.waiters.pop_front();
                continue;
            }
            let Some(result) = self.try_take(waiter.demand) else {
                break;
            };
            if let Some(waiter) = self.waiters.pop_front() {
                // Receiver checked above; a race here only drops the bytes of
                // a reader that already gave up.
                let _ = waiter.tx.send(result);
            }
        }
    }

    fn live_waiters(&self) -> usize {
        self.waiters.iter().filter(|w| !w.tx.is_closed()).count()
    }
}

struct Slot {
    id: u32,
    metadata: Option<BlobMetadata>,
    state: Mutex<SlotState>,
    wire: Option<StreamWire>,
    pull_size: u32,
}

impl Slot {
    fn push(&self, chunk: Bytes) {
        let mut state = self.state.lock();
        if state.status != Status::Active || chunk.is_empty() {
            return;
        }
        let units = match self.wire.as_ref().map(StreamWire::kind) {
            Some(WireKind::RpcItems) => 1,
            _ => chunk.len() as u64,
        };
        state.credit = state.credit.saturating_sub(units);
        state.bytes_transferred += chunk.len() as u64;
        state.buffered += chunk.len();
        state.chunks.push_back(chunk);
        state.wake_waiters();
        self.request_credit_locked(&mut state);
    }

    fn end(&self) {
        let mut state = self.state.lock();
        if state.status == Status::Active {
            state.status = Status::Ended;
        }
        state.wake_waiters();
    }

    fn abort(&self, reason: &str) {
        let mut state = self.state.lock();
        if state.status != Status::Active {
            return;
        }
        state.status = Status::Aborted;
        state.chunks.clear();
        state.buffered = 0;
        if state.live_waiters() == 0 {
            state.waiters.clear();
            state.pending_error = Some(reason.to_string());
            return;
        }
        for waiter in state.waiters.drain(..) {
            let _ = waiter
                .tx
                .send(Err(WiremuxError::StreamAborted(reason.to_string())));
        }
    }

    /// Ask the producer for more data when readers are starved and no credit
    /// is outstanding.
    fn request_credit_locked(&self, state: &mut SlotState) {
        let Some(wire) = &self.wire else {
            return;
        };
        if state.status != Status::Active || state.credit > 0 || state.live_waiters() == 0 {
            return;
        }
        let granted = match wire.kind() {
            WireKind::RpcItems => 1,
            WireKind::Blob(_) => u64::from(self.pull_size),
        };
        match wire.request_credit(self.id, self.pull_size) {
            Ok(()) => state.credit = granted,
            Err(e) => tracing::warn!(stream_id = self.id, "Failed to request pull credit: {}", e),
        }
    }

    async fn read(&self, demand: Demand) -> Result<Bytes> {
        let rx = {
            let mut state = self.state.lock();
            if state.waiters.is_empty() {
                if let Some(result) = state.try_take(demand) {
                    return result;
                }
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter { demand, tx });
            // Earlier readers may have given up; their demands no longer block.
            state.wake_waiters();
            self.request_credit_locked(&mut state);
            rx
        };
        rx.await
            .unwrap_or_else(|_| Err(WiremuxError::StreamAborted("stream dropped".to_string())))
    }
}

/// Registry of inbound streams for one connection.
pub struct InboundStreams {
    slots: Arc<SlotMap>,
    wire: Option<StreamWire>,
    pull_size: u32,
}

impl InboundStreams {
    /// A registry that never talks to a peer. Readers only see data pushed
    /// locally.
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            wire: None,
            pull_size: DEFAULT_PULL_SIZE,
        }
    }

    /// A registry that requests pull credit from the producer through `wire`.
    pub fn with_wire(wire: StreamWire, pull_size: u32) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            wire: Some(wire),
            pull_size: pull_size.max(1),
        }
    }

    /// Register a new active stream.
    pub fn add(&self, id: u32, metadata: Option<BlobMetadata>) -> Result<InboundStream> {
        let slot = Arc::new(Slot {
            id,
            metadata,
            state: Mutex::new(SlotState {
                status: Status::Active,
                chunks: VecDeque::new(),
                buffered: 0,
                waiters: VecDeque::new(),
                pending_error: None,
                credit: 0,
                bytes_transferred: 0,
            }),
            wire: self.wire.clone(),
            pull_size: self.pull_size,
        });

        let mut slots = self.slots.lock();
        if slots.contains_key(&id) {
            return Err(WiremuxError::decode(format!(
                "stream {} is already registered",
                id
            )));
        }
        slots.insert(id, slot.clone());
        Ok(InboundStream {
            slot,
            registry: Arc::downgrade(&self.slots),
        })
    }

    fn slot(&self, id: u32) -> Result<Arc<Slot>> {
        self.slots
            .lock()
            .get(&id)
            .cloned()
            .ok_or(WiremuxError::StreamNotFound(id))
    }

    fn detach(&self, id: u32) -> Result<Arc<Slot>> {
        self.slots
            .lock()
            .remove(&id)
            .ok_or(WiremuxError::StreamNotFound(id))
    }

    /// Handle to a registered stream.
    pub fn get(&self, id: u32) -> Result<InboundStream> {
        Ok(InboundStream {
            slot: self.slot(id)?,
            registry: Arc::downgrade(&self.slots),
        })
    }

    #[inline]
    pub fn contains(&self, id: u32) -> bool {
        self.slots.lock().contains_key(&id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Read exactly `size` bytes (fewer only once the stream ended).
    pub async fn pull(&self, id: u32, size: usize) -> Result<Bytes> {
        let slot = self.slot(id)?;
        slot.read(Demand::Exact(size)).await
    }

    /// Append a chunk received from the wire.
    pub fn push(&self, id: u32, chunk: Bytes) -> Result<()> {
        self.slot(id)?.push(chunk);
        Ok(())
    }

    /// Mark the stream ended and remove it.
    pub fn end(&self, id: u32) -> Result<()> {
        self.detach(id)?.end();
        Ok(())
    }

    /// Mark the stream aborted, fail its readers, and remove it.
    pub fn abort(&self, id: u32, reason: &str) -> Result<()> {
        self.detach(id)?.abort(reason);
        Ok(())
    }

    /// Remove the stream. Readers still waiting see it aborted.
    pub fn remove(&self, id: u32) -> Result<()> {
        self.detach(id)?.abort("Stream removed");
        Ok(())
    }

    /// Abort every registered stream.
    pub fn clear(&self, reason: &str) {
        let slots: Vec<_> = self.slots.lock().drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            slot.abort(reason);
        }
    }
}

impl Default for InboundStreams {
    fn default() -> Self {
        Self::new()
    }
}

/// Reader for one inbound stream.
#[derive(Clone)]
pub struct InboundStream {
    slot: Arc<Slot>,
    registry: Weak<SlotMap>,
}

impl InboundStream {
    #[inline]
    pub fn id(&self) -> u32 {
        self.slot.id
    }

    pub fn metadata(&self) -> Option<&BlobMetadata> {
        self.slot.metadata.as_ref()
    }

    /// Total bytes received so far.
    pub fn bytes_transferred(&self) -> u64 {
        self.slot.state.lock().bytes_transferred
    }

    /// Read exactly `size` bytes, or whatever remains once the stream ended.
    ///
    /// An empty result means end of stream.
    pub async fn read(&self, size: usize) -> Result<Bytes> {
        self.slot.read(Demand::Exact(size)).await
    }

    /// Next received chunk as it arrived on the wire, `None` at end of stream.
    pub async fn next_chunk(&self) -> Result<Option<Bytes>> {
        let chunk = self.slot.read(Demand::Any(usize::MAX)).await?;
        Ok(if chunk.is_empty() { None } else { Some(chunk) })
    }

    /// Read until the stream ends.
    pub async fn read_to_end(&self) -> Result<Bytes> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    /// Stop receiving: tell the producer, fail local readers, and drop the
    /// registry entry.
    pub fn abort(&self, reason: &str) {
        let id = self.slot.id;
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().remove(&id);
        }
        if self.slot.state.lock().status == Status::Active {
            if let Some(wire) = &self.slot.wire {
                if let Err(e) = wire.cancel(id, reason) {
                    tracing::warn!(stream_id = id, "Failed to send stream abort: {}", e);
                }
            }
        }
        self.slot.abort(reason);
    }

    /// Whether the stream ended or aborted.
    pub fn is_finished(&self) -> bool {
        self.slot.state.lock().status != Status::Active
    }

    /// Adapt into a `futures::Stream` of chunks.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes>> + Send + 'static {
        futures::stream::unfold(Some(self), |reader| async move {
            let reader = reader?;
            match reader.next_chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(reader))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

impl std::fmt::Debug for InboundStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundStream")
            .field("id", &self.slot.id)
            .field("metadata", &self.slot.metadata)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::protocol::body::StreamPull;
    use crate::protocol::{MessageTag, Role};
    use crate::streams::test_support::{capture_writer, next_message, saturated_writer};

    fn meta() -> Option<BlobMetadata> {
        Some(BlobMetadata::new("application/octet-stream"))
    }

    #[tokio::test]
    async fn test_push_pull_remove_get() {
        let streams = InboundStreams::new();
        streams.add(1, meta()).unwrap();
        streams.push(1, Bytes::from_static(&[1, 2, 3])).unwrap();

        let bytes = streams.pull(1, 2).await.unwrap();
        assert_eq!(&bytes[..], &[1, 2]);

        streams.remove(1).unwrap();
        let err = streams.get(1).unwrap_err();
        assert!(err.to_string().contains("Stream not found"));
    }

    #[tokio::test]
    async fn test_fifo_across_chunks() {
        let streams = InboundStreams::new();
        let reader = streams.add(5, meta()).unwrap();
        streams.push(5, Bytes::from_static(b"AAA")).unwrap();
        streams.push(5, Bytes::from_static(b"BB")).unwrap();
        streams.push(5, Bytes::from_static(b"C")).unwrap();

        assert_eq!(&streams.pull(5, 5).await.unwrap()[..], b"AAABB");

        // Not enough bytes: must wait.
        let pending = tokio::time::timeout(Duration::from_millis(20), reader.read(2)).await;
        assert!(pending.is_err());

        streams.end(5).unwrap();
        assert_eq!(&reader.read(2).await.unwrap()[..], b"C");
        assert!(reader.read(2).await.unwrap().is_empty());
        assert_eq!(reader.bytes_transferred(), 6);
    }

    #[tokio::test]
    async fn test_waiter_unblocks_on_push() {
        let streams = Arc::new(InboundStreams::new());
        let reader = streams.add(2, meta()).unwrap();

        let task = tokio::spawn(async move { reader.read(4).await });
        tokio::task::yield_now().await;

        streams.push(2, Bytes::from_static(b"ab")).unwrap();
        streams.push(2, Bytes::from_static(b"cdef")).unwrap();

        let bytes = task.await.unwrap().unwrap();
        assert_eq!(&bytes[..], b"abcd");
        assert_eq!(&streams.pull(2, 2).await.unwrap()[..], b"ef");
    }

    #[tokio::test]
    async fn test_end_resolves_pending_with_remainder() {
        let streams = InboundStreams::new();
        let reader = streams.add(3, meta()).unwrap();
        streams.push(3, Bytes::from_static(b"xy")).unwrap();

        let first = {
            let reader = reader.clone();
            tokio::spawn(async move { reader.read(10).await })
        };
        let second = {
            let reader = reader.clone();
            tokio::spawn(async move { reader.read(10).await })
        };
        tokio::task::yield_now().await;

        streams.end(3).unwrap();
        let mut results = vec![
            first.await.unwrap().unwrap(),
            second.await.unwrap().unwrap(),
        ];
        results.sort_by_key(|b| std::cmp::Reverse(b.len()));
        assert_eq!(&results[0][..], b"xy");
        assert!(results[1].is_empty());
    }

    #[tokio::test]
    async fn test_not_found_after_end_or_abort() {
        let streams = InboundStreams::new();
        streams.add(1, meta()).unwrap();
        streams.add(2, meta()).unwrap();

        streams.end(1).unwrap();
        streams.abort(2, "gone").unwrap();

        for id in [1, 2] {
            assert!(matches!(streams.get(id), Err(WiremuxError::StreamNotFound(i)) if i == id));
            assert!(matches!(
                streams.push(id, Bytes::from_static(b"x")),
                Err(WiremuxError::StreamNotFound(_))
            ));
            assert!(matches!(
                streams.abort(id, "again"),
                Err(WiremuxError::StreamNotFound(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_clear_aborts_everything() {
        let streams = InboundStreams::new();
        let seven = streams.add(7, meta()).unwrap();
        let eight = streams.add(8, meta()).unwrap();

        let waiting = {
            let seven = seven.clone();
            tokio::spawn(async move { seven.read(1).await })
        };
        tokio::task::yield_now().await;

        streams.clear("connection closed");

        let err = waiting.await.unwrap().unwrap_err();
        assert!(matches!(err, WiremuxError::StreamAborted(ref r) if r == "connection closed"));

        // No waiter on 8: the reason goes to the next read only.
        let err = eight.read(1).await.unwrap_err();
        assert!(matches!(err, WiremuxError::StreamAborted(_)));
        assert!(eight.read(1).await.unwrap().is_empty());

        assert!(streams.get(7).is_err());
        assert!(streams.get(8).is_err());
        assert!(streams.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_read_releases_waiter() {
        let streams = InboundStreams::new();
        let reader = streams.add(9, meta()).unwrap();

        let cancelled = tokio::time::timeout(Duration::from_millis(5), reader.read(3)).await;
        assert!(cancelled.is_err());

        streams.push(9, Bytes::from_static(b"abc")).unwrap();
        // The dropped demand must not swallow the bytes.
        assert_eq!(&reader.read(3).await.unwrap()[..], b"abc");
    }

    #[tokio::test]
    async fn test_requests_credit_when_starved() {
        let (writer, mut frames) = capture_writer();
        let streams = InboundStreams::with_wire(StreamWire::blob(writer, Role::Client), 4);
        let reader = streams.add(11, meta()).unwrap();

        let task = {
            let reader = reader.clone();
            tokio::spawn(async move { reader.read(6).await })
        };

        let message = next_message(&mut frames).await;
        assert_eq!(message.tag, MessageTag::ClientStreamPull);
        assert_eq!(
            StreamPull::decode(message.body).unwrap(),
            StreamPull {
                stream_id: 11,
                size: 4
            }
        );

        // Credit used up with the waiter still short: ask again.
        streams.push(11, Bytes::from_static(b"1234")).unwrap();
        let message = next_message(&mut frames).await;
        assert_eq!(message.tag, MessageTag::ClientStreamPull);

        streams.push(11, Bytes::from_static(b"56")).unwrap();
        assert_eq!(&task.await.unwrap().unwrap()[..], b"123456");
    }

    #[tokio::test]
    async fn test_credit_request_survives_backpressure() {
        let (writer, mut frames) = saturated_writer();
        assert!(writer.is_backpressure_active());
        let streams = InboundStreams::with_wire(StreamWire::blob(writer, Role::Client), 8);
        let reader = streams.add(12, meta()).unwrap();

        let task = {
            let reader = reader.clone();
            tokio::spawn(async move { reader.read(1).await })
        };

        let message = next_message(&mut frames).await;
        assert_eq!(message.tag, MessageTag::ClientStreamPull);
        assert_eq!(StreamPull::decode(message.body).unwrap().stream_id, 12);

        streams.push(12, Bytes::from_static(b"z")).unwrap();
        let read = tokio::time::timeout(Duration::from_secs(1), task).await;
        assert_eq!(&read.unwrap().unwrap().unwrap()[..], b"z");
    }

    #[tokio::test]
    async fn test_reader_abort_notifies_producer() {
        let (writer, mut frames) = capture_writer();
        let streams = InboundStreams::with_wire(StreamWire::blob(writer, Role::Server), 16);
        let reader = streams.add(4, meta()).unwrap();

        reader.abort("not needed");
        let message = next_message(&mut frames).await;
        assert_eq!(message.tag, MessageTag::ServerStreamAbort);
        assert!(!streams.contains(4));
        assert!(reader.is_finished());
    }
}
