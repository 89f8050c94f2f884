//! Call registry.
//!
//! Correlates outbound calls with their responses. Every call gets a fresh
//! id, a pending entry holding a `oneshot` sender, and a combined abort
//! signal (caller token, per-call timeout, connection shutdown; first one
//! wins). A small watcher task per call rejects the entry and forwards an
//! `RpcAbort` to the peer as soon as that signal fires.
//!
//! Settlement is idempotent: a late response racing a local timeout is
//! expected, so settling an unknown or already settled id is a no-op.
//!
//! The server side keeps [`ServedCalls`]: one abort controller per call in
//! flight, fired when the client sends `RpcAbort`.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::abort::{AbortController, AbortReason, AbortSignal};
use crate::codec::{parse_stream_token, Format};
use crate::error::{Result, WiremuxError};
use crate::protocol::body::RpcAbort;
use crate::protocol::MessageTag;
use crate::streams::InboundStream;
use crate::writer::WriterHandle;

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Overrides the engine's default call timeout. `Some(Duration::ZERO)`
    /// disables the timeout for this call.
    pub timeout: Option<Duration>,
    /// Caller-supplied cancellation.
    pub signal: Option<AbortSignal>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// Successful outcome of a call.
#[derive(Debug)]
pub enum CallResult {
    /// A single value, possibly with blob streams attached.
    Value(CallResponse),
    /// A stream of items.
    Stream(ResultStream),
}

impl CallResult {
    /// The single value, failing if the procedure answered with a stream.
    pub fn into_response(self) -> Result<CallResponse> {
        match self {
            Self::Value(response) => Ok(response),
            Self::Stream(_) => Err(WiremuxError::decode("expected a value, got a stream")),
        }
    }

    /// The item stream, failing if the procedure answered with a value.
    pub fn into_stream(self) -> Result<ResultStream> {
        match self {
            Self::Stream(stream) => Ok(stream),
            Self::Value(_) => Err(WiremuxError::decode("expected a stream, got a value")),
        }
    }
}

/// A single-value response.
///
/// Blobs in the value appear as stream tokens; [`CallResponse::blob`]
/// resolves a token to its reader.
#[derive(Debug)]
pub struct CallResponse {
    pub value: Value,
    pub streams: BTreeMap<u32, InboundStream>,
}

impl CallResponse {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            streams: BTreeMap::new(),
        }
    }

    /// Deserialize the value.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.value.clone())?)
    }

    /// Reader for the blob referenced at JSON pointer `pointer`.
    pub fn blob(&self, pointer: &str) -> Option<InboundStream> {
        let id = parse_stream_token(self.value.pointer(pointer)?)?;
        self.streams.get(&id).cloned()
    }
}

/// Items of a streaming result.
///
/// Each item is requested from the server as the previous one is consumed.
/// Dropping the stream before it finished tells the server to stop.
pub struct ResultStream {
    reader: InboundStream,
    format: Arc<dyn Format>,
}

impl ResultStream {
    pub(crate) fn new(reader: InboundStream, format: Arc<dyn Format>) -> Self {
        Self { reader, format }
    }

    #[inline]
    pub fn call_id(&self) -> u32 {
        self.reader.id()
    }

    /// Next item, `None` once the server ended the stream.
    pub async fn next_item(&mut self) -> Option<Result<Value>> {
        match self.reader.next_chunk().await {
            Ok(Some(chunk)) => Some(self.format.decode(&chunk)),
            Ok(None) => None,
            Err(WiremuxError::StreamAborted(reason)) => Some(Err(WiremuxError::CallAborted(reason))),
            Err(e) => Some(Err(e)),
        }
    }

    /// Stop the stream and tell the server.
    pub fn abort(&self, reason: &str) {
        if !self.reader.is_finished() {
            self.reader.abort(reason);
        }
    }

    /// Adapt into a `futures::Stream`.
    pub fn into_stream(self) -> impl Stream<Item = Result<Value>> + Send + 'static {
        futures::stream::unfold(self, |mut items| async move {
            let item = items.next_item().await?;
            Some((item, items))
        })
    }
}

impl Drop for ResultStream {
    fn drop(&mut self) {
        self.abort("Result stream dropped");
    }
}

impl std::fmt::Debug for ResultStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultStream")
            .field("call_id", &self.reader.id())
            .finish_non_exhaustive()
    }
}

struct Pending {
    tx: oneshot::Sender<Result<CallResult>>,
    /// Dropped on settlement, which stops the call's watcher task.
    _settled: oneshot::Sender<()>,
}

struct State {
    next_id: u32,
    pending: HashMap<u32, Pending>,
}

struct Inner {
    state: Mutex<State>,
    writer: WriterHandle,
}

impl Inner {
    fn settle(&self, call_id: u32, result: Result<CallResult>) -> bool {
        let Some(pending) = self.state.lock().pending.remove(&call_id) else {
            return false;
        };
        // The caller may have stopped waiting; the result is simply dropped.
        let _ = pending.tx.send(result);
        true
    }

    fn abort(&self, call_id: u32, error: WiremuxError, reason: &str) -> bool {
        if !self.settle(call_id, Err(error)) {
            return false;
        }
        let body = RpcAbort {
            call_id,
            reason: Some(reason.to_string()),
        }
        .encode();
        if let Err(e) = self.writer.send_control(MessageTag::RpcAbort, body) {
            tracing::warn!(call_id, "Failed to send call abort: {}", e);
        }
        true
    }
}

/// A call registered with the registry.
pub struct IssuedCall {
    pub call_id: u32,
    /// Combined signal of the call.
    pub signal: AbortSignal,
    pub response: PendingCall,
}

/// Future resolving to the result of a call.
///
/// Dropping it before the call settled aborts the call.
pub struct PendingCall {
    call_id: u32,
    rx: oneshot::Receiver<Result<CallResult>>,
    registry: Weak<Inner>,
    done: bool,
}

impl PendingCall {
    #[inline]
    pub fn call_id(&self) -> u32 {
        self.call_id
    }
}

impl Future for PendingCall {
    type Output = Result<CallResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let result = match Pin::new(&mut self.rx).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Ok(result)) => result,
            Poll::Ready(Err(_)) => Err(WiremuxError::ConnectionClosed),
        };
        self.done = true;
        Poll::Ready(result)
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.abort(
                self.call_id,
                WiremuxError::CallCancelled("Call dropped".to_string()),
                "Call dropped",
            );
        }
    }
}

/// Registry of outbound calls for one connection.
#[derive(Clone)]
pub struct CallRegistry {
    inner: Arc<Inner>,
}

impl CallRegistry {
    pub fn new(writer: WriterHandle) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    next_id: 0,
                    pending: HashMap::new(),
                }),
                writer,
            }),
        }
    }

    /// Register a new call.
    ///
    /// `timeout` of `None` or zero means no timeout. When the combined signal
    /// fires the call is rejected and `RpcAbort` is sent to the peer. A
    /// signal that already fired rejects the call at once.
    pub fn issue(
        &self,
        timeout: Option<Duration>,
        caller: Option<AbortSignal>,
        connection: AbortSignal,
    ) -> IssuedCall {
        let mut sources = vec![connection];
        sources.extend(caller);
        if let Some(timeout) = timeout.filter(|t| !t.is_zero()) {
            sources.push(AbortSignal::timeout(timeout));
        }
        let signal = AbortSignal::any(sources);

        let (tx, rx) = oneshot::channel();
        let (settled_tx, settled_rx) = oneshot::channel::<()>();

        let call_id = {
            let mut state = self.inner.state.lock();
            let mut call_id = state.next_id;
            while state.pending.contains_key(&call_id) {
                call_id = call_id.wrapping_add(1);
            }
            state.next_id = call_id.wrapping_add(1);
            state.pending.insert(
                call_id,
                Pending {
                    tx,
                    _settled: settled_tx,
                },
            );
            call_id
        };

        let response = PendingCall {
            call_id,
            rx,
            registry: Arc::downgrade(&self.inner),
            done: false,
        };

        if let Some(reason) = signal.reason() {
            self.inner.settle(call_id, Err(reason.into_call_error()));
        } else {
            let registry = Arc::downgrade(&self.inner);
            let watched = signal.clone();
            tokio::spawn(async move {
                tokio::select! {
                    reason = watched.aborted() => {
                        if let Some(registry) = registry.upgrade() {
                            let message = reason.message.clone();
                            if registry.abort(call_id, reason.into_call_error(), &message) {
                                tracing::debug!(call_id, "Call aborted: {}", message);
                            }
                        }
                    }
                    _ = settled_rx => {}
                }
            });
        }

        IssuedCall {
            call_id,
            signal,
            response,
        }
    }

    /// Settle a call with its result. Returns `false` if it was not pending.
    pub fn resolve(&self, call_id: u32, result: CallResult) -> bool {
        self.inner.settle(call_id, Ok(result))
    }

    /// Settle a call with an error. Returns `false` if it was not pending.
    pub fn reject(&self, call_id: u32, error: WiremuxError) -> bool {
        self.inner.settle(call_id, Err(error))
    }

    /// Cancel a pending call: reject it locally and send `RpcAbort`.
    pub fn abort(&self, call_id: u32, reason: &str) -> bool {
        self.inner.abort(
            call_id,
            WiremuxError::CallCancelled(reason.to_string()),
            reason,
        )
    }

    /// Drop a call that never reached the peer, without settling it.
    pub(crate) fn forget(&self, call_id: u32) {
        self.inner.state.lock().pending.remove(&call_id);
    }

    /// Reject every pending call with [`WiremuxError::ConnectionClosed`].
    /// Nothing is sent to the peer.
    pub fn clear(&self) {
        let drained: Vec<_> = self.inner.state.lock().pending.drain().collect();
        for (_, pending) in drained {
            let _ = pending.tx.send(Err(WiremuxError::ConnectionClosed));
        }
    }

    #[inline]
    pub fn is_pending(&self, call_id: u32) -> bool {
        self.inner.state.lock().pending.contains_key(&call_id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Calls being served, each with its own abort controller.
#[derive(Default)]
pub struct ServedCalls {
    calls: Mutex<HashMap<u32, AbortController>>,
}

impl ServedCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new call. Returns `None` if the id is already being served.
    pub fn register(&self, call_id: u32) -> Option<AbortController> {
        let mut calls = self.calls.lock();
        if calls.contains_key(&call_id) {
            return None;
        }
        let controller = AbortController::new();
        calls.insert(call_id, controller.clone());
        Some(controller)
    }

    /// Fire the call's controller. Returns `false` if it is not in flight.
    pub fn abort(&self, call_id: u32, reason: AbortReason) -> bool {
        match self.calls.lock().remove(&call_id) {
            Some(controller) => {
                controller.abort(reason);
                true
            }
            None => false,
        }
    }

    /// Forget a call that finished.
    pub fn finish(&self, call_id: u32) {
        self.calls.lock().remove(&call_id);
    }

    #[inline]
    pub fn contains(&self, call_id: u32) -> bool {
        self.calls.lock().contains_key(&call_id)
    }

    /// Abort every call in flight.
    pub fn clear(&self, reason: &str) {
        let drained: Vec<_> = self.calls.lock().drain().collect();
        for (_, controller) in drained {
            controller.abort(AbortReason::shutdown(reason));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::time::Instant;

    use crate::abort::AbortKind;
    use crate::protocol::MessageTag;
    use crate::streams::test_support::{capture_writer, next_message, saturated_writer};

    fn registry() -> (
        CallRegistry,
        futures::channel::mpsc::UnboundedReceiver<bytes::Bytes>,
    ) {
        let (writer, frames) = capture_writer();
        (CallRegistry::new(writer), frames)
    }

    #[tokio::test]
    async fn test_resolve_delivers_result() {
        let (calls, _frames) = registry();
        let call = calls.issue(None, None, AbortSignal::never());

        assert!(calls.resolve(call.call_id, CallResult::Value(CallResponse::new(json!(42)))));
        let response = call.response.await.unwrap().into_response().unwrap();
        assert_eq!(response.value, json!(42));
        assert!(calls.is_empty());
    }

    #[tokio::test]
    async fn test_settlement_is_idempotent() {
        let (calls, _frames) = registry();
        let call = calls.issue(None, None, AbortSignal::never());
        let id = call.call_id;

        assert!(calls.resolve(id, CallResult::Value(CallResponse::new(json!("first")))));
        assert!(!calls.resolve(id, CallResult::Value(CallResponse::new(json!("second")))));
        assert!(!calls.reject(id, WiremuxError::CallTimeout));
        assert!(!calls.abort(id, "late"));

        let response = call.response.await.unwrap().into_response().unwrap();
        assert_eq!(response.value, json!("first"));

        // Unknown ids are no-ops too.
        assert!(!calls.resolve(999, CallResult::Value(CallResponse::new(Value::Null))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_abort_wins() {
        let (calls, mut frames) = registry();
        let caller = AbortController::new();
        let start = Instant::now();

        let call = calls.issue(
            Some(Duration::from_millis(50)),
            Some(caller.signal()),
            AbortSignal::never(),
        );
        let id = call.call_id;

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            caller.abort(AbortReason::cancelled("user cancelled"));
        });

        let err = call.response.await.unwrap_err();
        assert!(matches!(err, WiremuxError::CallCancelled(ref r) if r == "user cancelled"));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(10));
        assert!(elapsed < Duration::from_millis(50));

        let reason = call.signal.reason().unwrap();
        assert_eq!(reason.kind, AbortKind::Cancelled);

        // The peer is told to stop.
        let message = next_message(&mut frames).await;
        assert_eq!(message.tag, MessageTag::RpcAbort);
        assert_eq!(RpcAbort::decode(message.body).unwrap().call_id, id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_rejects() {
        let (calls, _frames) = registry();
        let call = calls.issue(Some(Duration::from_millis(30)), None, AbortSignal::never());

        let err = call.response.await.unwrap_err();
        assert!(matches!(err, WiremuxError::CallTimeout));
    }

    #[tokio::test]
    async fn test_already_aborted_rejects_immediately() {
        let (calls, _frames) = registry();
        let shutdown = AbortController::new();
        shutdown.abort(AbortReason::shutdown("closing"));

        let call = calls.issue(None, None, shutdown.signal());
        let err = call.response.await.unwrap_err();
        assert!(matches!(err, WiremuxError::CallAborted(ref r) if r == "closing"));
    }

    #[tokio::test]
    async fn test_clear_rejects_with_connection_closed() {
        let (calls, _frames) = registry();
        let first = calls.issue(None, None, AbortSignal::never());
        let second = calls.issue(None, None, AbortSignal::never());
        assert_eq!(calls.len(), 2);

        calls.clear();
        assert!(matches!(first.response.await, Err(WiremuxError::ConnectionClosed)));
        assert!(matches!(second.response.await, Err(WiremuxError::ConnectionClosed)));
        assert!(calls.is_empty());
    }

    #[tokio::test]
    async fn test_ids_skip_pending() {
        let (calls, _frames) = registry();
        calls.inner.state.lock().next_id = u32::MAX;

        let last = calls.issue(None, None, AbortSignal::never());
        assert_eq!(last.call_id, u32::MAX);
        let wrapped = calls.issue(None, None, AbortSignal::never());
        assert_eq!(wrapped.call_id, 0);

        // u32::MAX and 0 are still pending.
        calls.inner.state.lock().next_id = u32::MAX;
        let skipped = calls.issue(None, None, AbortSignal::never());
        assert_eq!(skipped.call_id, 1);
    }

    #[tokio::test]
    async fn test_dropped_call_is_aborted() {
        let (calls, mut frames) = registry();
        let call = calls.issue(None, None, AbortSignal::never());
        let id = call.call_id;
        drop(call);

        assert!(!calls.is_pending(id));
        let message = next_message(&mut frames).await;
        assert_eq!(message.tag, MessageTag::RpcAbort);
    }

    #[tokio::test]
    async fn test_abort_reaches_peer_under_backpressure() {
        let (writer, mut frames) = saturated_writer();
        let calls = CallRegistry::new(writer);
        let call = calls.issue(None, None, AbortSignal::never());
        let id = call.call_id;

        assert!(calls.abort(id, "gave up"));
        let message = next_message(&mut frames).await;
        assert_eq!(message.tag, MessageTag::RpcAbort);
        let abort = RpcAbort::decode(message.body).unwrap();
        assert_eq!(abort.call_id, id);
        assert_eq!(abort.reason.as_deref(), Some("gave up"));
    }

    #[tokio::test]
    async fn test_served_calls() {
        let served = ServedCalls::new();
        let controller = served.register(3).unwrap();
        assert!(served.register(3).is_none());

        assert!(served.abort(3, AbortReason::cancelled("client gone")));
        assert!(controller.is_aborted());
        assert!(!served.abort(3, AbortReason::cancelled("again")));

        let other = served.register(4).unwrap();
        served.clear("shutdown");
        assert_eq!(other.reason().unwrap().kind, AbortKind::Shutdown);
    }
}
