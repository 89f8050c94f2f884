//! Dedicated writer task for outbound messages.
//!
//! Every producer on a connection (dispatch loop, handler tasks, stream
//! pumps, callers) hands encoded frames to one writer task through an mpsc
//! channel. The task feeds them into the transport sink in batches and
//! flushes once per batch.
//!
//! # Architecture
//!
//! ```text
//! Call issue    ─┐
//! Handler task  ─┼─► mpsc::Sender<Bytes> ─► Writer Task ─► Sink<Bytes> (transport)
//! Stream pump   ─┘
//! ```
//!
//! A frame is one complete message (tag byte + body). The transport is
//! expected to keep message boundaries (a WebSocket binary message, or one
//! base64 `data:` block for the HTTP text transport).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{Sink, SinkExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::error::{Result, WiremuxError};
use crate::protocol::{Message, MessageTag};

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frames fed to the sink before a flush.
const MAX_BATCH_SIZE: usize = 64;

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum pending frames before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for frame queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// State shared between every handle and the writer task.
struct Shared {
    /// Frames queued but not yet handed to the sink.
    pending: AtomicUsize,
    max_pending: usize,
    timeout: Duration,
    /// Asks the writer task to drain and close the sink.
    shutdown: Notify,
    /// Signalled each time the writer task hands a batch to the sink.
    drained: Notify,
}

impl Shared {
    fn new(max_pending: usize, timeout: Duration) -> Self {
        Self {
            pending: AtomicUsize::new(0),
            max_pending,
            timeout,
            shutdown: Notify::new(),
            drained: Notify::new(),
        }
    }

    fn release(&self, frames: usize) {
        self.pending.fetch_sub(frames, Ordering::AcqRel);
        self.drained.notify_waiters();
    }

    #[inline]
    fn at_capacity(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }
}

/// Handle for sending frames to the writer task.
///
/// This is cheaply cloneable and shared by everything that writes to one
/// connection.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<Bytes>,
    shared: Arc<Shared>,
}

impl WriterHandle {
    fn new(tx: mpsc::Sender<Bytes>, shared: Arc<Shared>) -> Self {
        Self { tx, shared }
    }

    /// Queue a message built from `tag` and `body`.
    pub async fn send_message(&self, tag: MessageTag, body: Bytes) -> Result<()> {
        self.send(Message::new(tag, body).to_bytes()).await
    }

    /// Queue a message without waiting. Used from synchronous paths such as
    /// the dispatch loop and `Drop` impls.
    pub fn try_send_message(&self, tag: MessageTag, body: Bytes) -> Result<()> {
        self.try_send(Message::new(tag, body).to_bytes())
    }

    /// Queue a control message (pull credit, abort) from a synchronous path.
    ///
    /// Control messages are never dropped for backpressure: they ignore the
    /// pending limit, and when the channel itself is full the frame is handed
    /// to a task that waits for room. Such a frame may land after frames
    /// queued later. Fails only once the writer has stopped.
    pub fn send_control(&self, tag: MessageTag, body: Bytes) -> Result<()> {
        let frame = Message::new(tag, body).to_bytes();
        self.shared.pending.fetch_add(1, Ordering::AcqRel);

        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.shared.release(1);
                Err(WiremuxError::ConnectionClosed)
            }
            Err(mpsc::error::TrySendError::Full(frame)) => {
                let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                    self.shared.release(1);
                    return Err(WiremuxError::BackpressureTimeout);
                };
                let tx = self.tx.clone();
                let shared = self.shared.clone();
                runtime.spawn(async move {
                    if tx.send(frame).await.is_err() {
                        shared.release(1);
                    }
                });
                Ok(())
            }
        }
    }

    /// Send an encoded frame to the writer task.
    ///
    /// Waits while backpressure is active, timing out after the configured
    /// duration.
    pub async fn send(&self, frame: Bytes) -> Result<()> {
        if self.shared.at_capacity() {
            self.wait_for_backpressure().await?;
        }

        self.shared.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.send(frame).await.map_err(|_| {
            self.shared.release(1);
            WiremuxError::ConnectionClosed
        })
    }

    /// Try to send a frame without waiting for backpressure.
    ///
    /// Returns `Err(BackpressureTimeout)` immediately if at capacity.
    pub fn try_send(&self, frame: Bytes) -> Result<()> {
        if self.shared.at_capacity() {
            return Err(WiremuxError::BackpressureTimeout);
        }

        self.shared.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.try_send(frame).map_err(|e| {
            self.shared.release(1);
            match e {
                mpsc::error::TrySendError::Full(_) => WiremuxError::BackpressureTimeout,
                mpsc::error::TrySendError::Closed(_) => WiremuxError::ConnectionClosed,
            }
        })
    }

    /// Wait until the writer task drains below the pending limit. Returns
    /// early if the writer stops so the caller sees `ConnectionClosed`.
    async fn wait_for_backpressure(&self) -> Result<()> {
        let wait = async {
            loop {
                let drained = self.shared.drained.notified();
                tokio::pin!(drained);
                // Register before checking so a release in between is seen.
                drained.as_mut().enable();
                if !self.shared.at_capacity() {
                    return;
                }
                tokio::select! {
                    _ = drained => {}
                    _ = self.tx.closed() => return,
                }
            }
        };

        tokio::time::timeout(self.shared.timeout, wait)
            .await
            .map_err(|_| WiremuxError::BackpressureTimeout)
    }

    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.shared.at_capacity()
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// Whether the writer task has stopped accepting frames.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Stop accepting frames. Frames already queued are still written, then
    /// the sink is closed. Later sends fail with `ConnectionClosed`.
    pub fn close(&self) {
        self.shared.shutdown.notify_one();
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task ends after flushing and closing the sink once every
/// [`WriterHandle`] is dropped or [`WriterHandle::close`] is called. It also
/// ends when the sink fails.
pub fn spawn_writer_task<S>(sink: S, config: WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    S: Sink<Bytes> + Unpin + Send + 'static,
    S::Error: std::fmt::Display,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let shared = Arc::new(Shared::new(
        config.max_pending_frames,
        config.backpressure_timeout,
    ));

    let handle = WriterHandle::new(tx, shared.clone());
    let task = tokio::spawn(writer_loop(rx, sink, shared));

    (handle, task)
}

async fn writer_loop<S>(
    mut rx: mpsc::Receiver<Bytes>,
    mut sink: S,
    shared: Arc<Shared>,
) -> Result<()>
where
    S: Sink<Bytes> + Unpin,
    S::Error: std::fmt::Display,
{
    let sink_error = |e: S::Error| {
        tracing::error!("Transport sink error: {}", e);
        WiremuxError::ConnectionClosed
    };

    let mut closing = false;

    loop {
        let next = if closing {
            rx.recv().await
        } else {
            tokio::select! {
                frame = rx.recv() => frame,
                _ = shared.shutdown.notified() => {
                    // Refuse new frames but drain what is queued.
                    rx.close();
                    closing = true;
                    continue;
                }
            }
        };

        let Some(first) = next else {
            // All handles dropped or closed, clean shutdown
            return sink.close().await.map_err(sink_error);
        };

        let mut batch_size = 1;
        sink.feed(first).await.map_err(sink_error)?;

        while batch_size < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => {
                    sink.feed(frame).await.map_err(sink_error)?;
                    batch_size += 1;
                }
                Err(_) => break,
            }
        }

        sink.flush().await.map_err(sink_error)?;
        shared.release(batch_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;
    use futures::StreamExt;

    #[test]
    fn test_writer_config_default() {
        let config = WriterConfig::default();
        assert_eq!(config.max_pending_frames, DEFAULT_MAX_PENDING_FRAMES);
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(config.backpressure_timeout, DEFAULT_BACKPRESSURE_TIMEOUT);
    }

    #[tokio::test]
    async fn test_writer_delivers_in_order() {
        let (sink, mut frames) = fmpsc::unbounded::<Bytes>();
        let (handle, _task) = spawn_writer_task(sink, WriterConfig::default());

        for i in 0..10u32 {
            handle
                .send_message(MessageTag::RpcAbort, Bytes::copy_from_slice(&i.to_le_bytes()))
                .await
                .unwrap();
        }

        for i in 0..10u32 {
            let frame = frames.next().await.unwrap();
            assert_eq!(frame[0], MessageTag::RpcAbort.as_u8());
            assert_eq!(&frame[1..], &i.to_le_bytes());
        }
    }

    #[tokio::test]
    async fn test_writer_closes_sink_when_handles_drop() {
        let (sink, mut frames) = fmpsc::unbounded::<Bytes>();
        let (handle, task) = spawn_writer_task(sink, WriterConfig::default());

        handle.try_send(Bytes::from_static(&[10])).unwrap();
        drop(handle);

        assert_eq!(frames.next().await.unwrap(), Bytes::from_static(&[10]));
        assert!(frames.next().await.is_none());
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_close_drains_then_closes_sink() {
        let (sink, mut frames) = fmpsc::unbounded::<Bytes>();
        let (handle, task) = spawn_writer_task(sink, WriterConfig::default());
        let keep_alive = handle.clone();

        handle.try_send(Bytes::from_static(&[1])).unwrap();
        handle.close();

        assert_eq!(frames.next().await.unwrap(), Bytes::from_static(&[1]));
        assert!(frames.next().await.is_none());
        assert!(task.await.unwrap().is_ok());

        assert!(matches!(
            keep_alive.send(Bytes::from_static(&[2])).await,
            Err(WiremuxError::ConnectionClosed)
        ));
    }

    fn detached_handle(capacity: usize, max_pending: usize) -> (WriterHandle, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel::<Bytes>(capacity);
        let shared = Arc::new(Shared::new(max_pending, Duration::from_secs(1)));
        (WriterHandle::new(tx, shared), rx)
    }

    #[tokio::test]
    async fn test_try_send_at_capacity() {
        let (handle, _rx) = detached_handle(10, 100);
        handle.shared.pending.store(100, Ordering::Release);

        let result = handle.try_send(Bytes::new());
        assert!(matches!(result, Err(WiremuxError::BackpressureTimeout)));
        assert!(handle.is_backpressure_active());
    }

    #[tokio::test]
    async fn test_send_after_writer_stopped() {
        let (handle, rx) = detached_handle(10, 10);
        drop(rx);

        let result = handle.send(Bytes::new()).await;
        assert!(matches!(result, Err(WiremuxError::ConnectionClosed)));
        assert_eq!(handle.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_times_out_under_backpressure() {
        let (handle, _rx) = detached_handle(10, 2);
        handle.shared.pending.store(2, Ordering::Release);

        let result = handle.send(Bytes::from_static(&[1])).await;
        assert!(matches!(result, Err(WiremuxError::BackpressureTimeout)));
        assert_eq!(handle.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_send_resumes_when_drained() {
        let (handle, mut rx) = detached_handle(10, 1);
        handle.shared.pending.store(1, Ordering::Release);

        let sender = handle.clone();
        let blocked = tokio::spawn(async move { sender.send(Bytes::from_static(&[7])).await });
        tokio::task::yield_now().await;
        assert!(!blocked.is_finished());

        handle.shared.release(1);
        blocked.await.unwrap().unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(&[7]));
    }

    #[tokio::test]
    async fn test_control_frames_bypass_backpressure() {
        let (handle, mut rx) = detached_handle(1, 1);
        handle.shared.pending.store(1, Ordering::Release);

        assert!(matches!(
            handle.try_send_message(MessageTag::RpcAbort, Bytes::from_static(&[1])),
            Err(WiremuxError::BackpressureTimeout)
        ));

        // The first fits the channel, the second waits for room.
        handle.send_control(MessageTag::RpcAbort, Bytes::from_static(&[2])).unwrap();
        handle.send_control(MessageTag::RpcAbort, Bytes::from_static(&[3])).unwrap();
        assert_eq!(handle.pending_count(), 3);

        assert_eq!(&rx.recv().await.unwrap()[1..], &[2]);
        assert_eq!(&rx.recv().await.unwrap()[1..], &[3]);
    }

    #[tokio::test]
    async fn test_control_frame_after_writer_stopped() {
        let (handle, rx) = detached_handle(1, 1);
        drop(rx);

        assert!(matches!(
            handle.send_control(MessageTag::RpcAbort, Bytes::new()),
            Err(WiremuxError::ConnectionClosed)
        ));
        assert_eq!(handle.pending_count(), 0);
    }
}
