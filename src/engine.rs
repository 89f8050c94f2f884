//! Protocol engine - one per connection.
//!
//! The [`EngineBuilder`] configures role, format, handler and limits, then
//! builds a [`ProtocolEngine`] around a transport sink. The engine owns every
//! registry of the connection and manages its lifecycle:
//!
//! 1. `Connecting` after build
//! 2. `Open` after [`ProtocolEngine::open`]; only now can calls, streams and
//!    subscriptions be created or messages be received
//! 3. `Closing` then `Closed` on [`ProtocolEngine::close`], which clears every
//!    registry exactly once
//!
//! Inbound messages go through one sequential dispatch path
//! ([`ProtocolEngine::receive`]). Dispatch never waits: registry updates are
//! synchronous and handlers run on spawned tasks.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use serde_json::json;
//! use wiremux::{EngineBuilder, JsonFormat};
//!
//! let engine = EngineBuilder::client()
//!     .format(Arc::new(JsonFormat))
//!     .call_timeout(std::time::Duration::from_secs(10))
//!     .build(sink);
//! engine.open()?;
//!
//! tokio::spawn({
//!     let engine = engine.clone();
//!     async move { engine.serve(incoming).await }
//! });
//!
//! let result = engine.call("users.get", json!({"id": 1})).await?;
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{FutureExt, Sink, Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use crate::abort::{AbortController, AbortReason, AbortSignal};
use crate::calls::{
    CallOptions, CallRegistry, CallResponse, CallResult, PendingCall, ResultStream, ServedCalls,
};
use crate::codec::{
    parse_stream_token, Blob, BlobMetadata, DecodeRpcContext, EncodeRpcContext, Format,
    FormatRegistry, JsonFormat, Payload, ResponseBody, RpcCallFrame, RpcOutcome,
};
use crate::error::{ErrorCode, Result, RpcError, WiremuxError};
use crate::handler::{CallHandler, CallOutput, HandlerResult, IncomingCall, NoHandler};
use crate::protocol::body::{
    EventBody, RpcAbort, RpcStreamFrame, RpcStreamPull, StreamAbort, StreamEnd, StreamPull,
    StreamPush, SubscribeBody, SubscriptionEventBody, UnsubscribeBody,
};
use crate::protocol::{decode, decode_text_payload, encode, FrameParser, Message, MessageTag, Role};
use crate::streams::{InboundStream, InboundStreams, OutboundStreams, StreamWire, DEFAULT_PULL_SIZE};
use crate::subscriptions::{Channels, Subscription, SubscriptionEvent, Subscriptions};
use crate::writer::{spawn_writer_task, WriterConfig, WriterHandle};

/// Default maximum concurrent handlers.
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 256;

const CONNECTION_CLOSED: &str = "Connection closed";

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of a connection, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Timeout applied to calls that do not set their own. `None` disables it.
    pub call_timeout: Option<Duration>,
    /// Pull credit requested per round trip on inbound blob streams (bytes).
    pub pull_size: u32,
    /// Handlers allowed to run at once. Calls beyond it are answered with
    /// `ServiceUnavailable`.
    pub max_concurrent_handlers: usize,
    pub writer: WriterConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            call_timeout: None,
            pull_size: DEFAULT_PULL_SIZE,
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
            writer: WriterConfig::default(),
        }
    }
}

/// Builder for a [`ProtocolEngine`].
pub struct EngineBuilder {
    role: Role,
    config: EngineConfig,
    format: Arc<dyn Format>,
    handler: Arc<dyn CallHandler>,
}

impl EngineBuilder {
    /// Create a builder for the given side. JSON is the default format.
    pub fn new(role: Role) -> Self {
        Self {
            role,
            config: EngineConfig::default(),
            format: Arc::new(JsonFormat),
            handler: Arc::new(NoHandler),
        }
    }

    pub fn client() -> Self {
        Self::new(Role::Client)
    }

    pub fn server() -> Self {
        Self::new(Role::Server)
    }

    /// Set the payload format.
    pub fn format(mut self, format: Arc<dyn Format>) -> Self {
        self.format = format;
        self
    }

    /// Set the handler serving incoming calls (server side).
    pub fn handler<H: CallHandler>(mut self, handler: H) -> Self {
        self.handler = Arc::new(handler);
        self
    }

    /// Set the default call timeout.
    ///
    /// Default: none
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = Some(timeout);
        self
    }

    /// Set the pull credit requested per round trip on inbound streams.
    ///
    /// Default: 65535 bytes
    pub fn pull_size(mut self, size: u32) -> Self {
        self.config.pull_size = size;
        self
    }

    /// Set the maximum number of concurrent handlers.
    ///
    /// Default: 256
    pub fn max_concurrent_handlers(mut self, limit: usize) -> Self {
        self.config.max_concurrent_handlers = limit;
        self
    }

    /// Set the maximum pending frames for backpressure.
    ///
    /// Default: 1024
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.config.writer.max_pending_frames = limit;
        self
    }

    /// Set the writer channel capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.writer.channel_capacity = capacity;
        self
    }

    /// Set the backpressure timeout.
    ///
    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.config.writer.backpressure_timeout = timeout;
        self
    }

    /// Build the engine around `sink`, which receives one complete binary
    /// message per item. Must be called within a Tokio runtime.
    pub fn build<S>(self, sink: S) -> ProtocolEngine
    where
        S: Sink<Bytes> + Unpin + Send + 'static,
        S::Error: fmt::Display,
    {
        ProtocolEngine::new(self, sink)
    }

    /// Pick the format matching the peer's `content_type` from `formats`,
    /// then build. Fails with [`WiremuxError::UnsupportedFormat`].
    pub fn build_negotiated<S>(
        mut self,
        formats: &FormatRegistry,
        content_type: &str,
        sink: S,
    ) -> Result<ProtocolEngine>
    where
        S: Sink<Bytes> + Unpin + Send + 'static,
        S::Error: fmt::Display,
    {
        self.format = formats.supports_decoder(content_type)?;
        Ok(self.build(sink))
    }
}

/// Protocol engine of one connection.
///
/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct ProtocolEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    id: ConnectionId,
    role: Role,
    config: EngineConfig,
    format: Arc<dyn Format>,
    handler: Arc<dyn CallHandler>,
    state: Mutex<ConnectionState>,
    /// Fires once, on close. Every call and served call observes it.
    shutdown: AbortController,
    writer: WriterHandle,
    _writer_task: JoinHandle<Result<()>>,
    semaphore: Arc<Semaphore>,

    calls: CallRegistry,
    served: ServedCalls,
    /// Blob streams the peer sends.
    blobs_in: InboundStreams,
    /// Blob streams this side sends.
    blobs_out: OutboundStreams,
    /// Streaming results being received (client).
    results_in: InboundStreams,
    /// Streaming results being produced (server).
    results_out: OutboundStreams,
    next_stream_id: Mutex<u32>,

    subscriptions: Subscriptions,
    channels: Channels,
    events: Mutex<Option<mpsc::UnboundedSender<SubscriptionEvent>>>,

    text: Mutex<FrameParser>,
}

impl ProtocolEngine {
    fn new<S>(builder: EngineBuilder, sink: S) -> Self
    where
        S: Sink<Bytes> + Unpin + Send + 'static,
        S::Error: fmt::Display,
    {
        let EngineBuilder {
            role,
            config,
            format,
            handler,
        } = builder;

        let (writer, writer_task) = spawn_writer_task(sink, config.writer.clone());
        let pull_size = config.pull_size;

        let inner = EngineInner {
            id: ConnectionId::next(),
            role,
            format,
            handler,
            state: Mutex::new(ConnectionState::Connecting),
            shutdown: AbortController::new(),
            _writer_task: writer_task,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_handlers)),
            calls: CallRegistry::new(writer.clone()),
            served: ServedCalls::new(),
            blobs_in: InboundStreams::with_wire(StreamWire::blob(writer.clone(), role.peer()), pull_size),
            blobs_out: OutboundStreams::new(StreamWire::blob(writer.clone(), role)),
            results_in: InboundStreams::with_wire(StreamWire::rpc_items(writer.clone()), pull_size),
            results_out: OutboundStreams::new(StreamWire::rpc_items(writer.clone())),
            next_stream_id: Mutex::new(0),
            subscriptions: Subscriptions::new(),
            channels: Channels::new(),
            events: Mutex::new(None),
            text: Mutex::new(FrameParser::new()),
            writer,
            config,
        };
        tracing::debug!(connection = %inner.id, ?role, format = inner.format.content_type(), "Connection created");

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Create a builder for the given side.
    pub fn builder(role: Role) -> EngineBuilder {
        EngineBuilder::new(role)
    }

    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    /// Content type of the negotiated format.
    pub fn content_type(&self) -> &'static str {
        self.inner.format.content_type()
    }

    /// Move from `Connecting` to `Open`. Opening an open connection is a
    /// no-op; a closing or closed one cannot be reopened.
    pub fn open(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        match *state {
            ConnectionState::Connecting => {
                *state = ConnectionState::Open;
                tracing::debug!(connection = %self.inner.id, "Connection open");
                Ok(())
            }
            ConnectionState::Open => Ok(()),
            ConnectionState::Closing | ConnectionState::Closed => Err(WiremuxError::ConnectionNotOpen),
        }
    }

    /// Close the connection: fire the shutdown signal, reject pending calls
    /// with `ConnectionClosed`, abort every stream, drop every subscription,
    /// then let the writer drain and close the sink. Runs once; later calls
    /// do nothing.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Wait until the connection is closed.
    pub async fn closed(&self) {
        self.inner.shutdown.signal().aborted().await;
    }

    /// Signal that fires when the connection closes.
    pub fn shutdown_signal(&self) -> AbortSignal {
        self.inner.shutdown.signal()
    }

    /// Number of calls waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.calls.len()
    }

    /// Number of live blob streams, inbound and outbound.
    pub fn open_streams(&self) -> usize {
        self.inner.blobs_in.len() + self.inner.blobs_out.len()
    }

    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.inner.writer.is_backpressure_active()
    }

    // Client operations

    /// Call `procedure` with the default options.
    pub async fn call(&self, procedure: &str, payload: impl Into<Payload>) -> Result<CallResult> {
        self.call_with(procedure, payload, CallOptions::default()).await
    }

    /// Call `procedure`. Blobs in `payload` are sent as streams as the
    /// server pulls them.
    pub async fn call_with(
        &self,
        procedure: &str,
        payload: impl Into<Payload>,
        options: CallOptions,
    ) -> Result<CallResult> {
        let inner = &self.inner;
        inner.expect_role(Role::Client)?;
        inner.ensure_open()?;

        let timeout = options.timeout.or(inner.config.call_timeout);
        let issued = inner
            .calls
            .issue(timeout, options.signal, inner.shutdown.signal());
        if issued.signal.is_aborted() {
            return issued.response.await;
        }
        let call_id = issued.call_id;

        let mut binder = StreamBinder::new(inner);
        let sent = match inner
            .format
            .encode_rpc(call_id, procedure, payload.into(), &mut binder)
        {
            Ok(frame) => inner.writer.send_message(MessageTag::Rpc, Bytes::from(frame)).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            binder.rollback();
            inner.calls.forget(call_id);
            return Err(e);
        }

        tracing::debug!(call_id, procedure, "Call sent");
        issued.response.await
    }

    /// Send several calls in one `RpcBatch` message. Returns one future per
    /// call, in order.
    pub async fn batch<I, P>(&self, calls: I) -> Result<Vec<PendingCall>>
    where
        I: IntoIterator<Item = (String, P)>,
        P: Into<Payload>,
    {
        let inner = &self.inner;
        inner.expect_role(Role::Client)?;
        inner.ensure_open()?;

        let mut issued = Vec::new();
        let mut frames = Vec::new();
        for (procedure, payload) in calls {
            let call = inner
                .calls
                .issue(inner.config.call_timeout, None, inner.shutdown.signal());
            frames.push((call.call_id, procedure, payload.into()));
            issued.push(call);
        }

        let mut binder = StreamBinder::new(inner);
        let sent = match inner.format.encode_rpc_batch(frames, &mut binder) {
            Ok(frame) => {
                inner
                    .writer
                    .send_message(MessageTag::RpcBatch, Bytes::from(frame))
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            binder.rollback();
            for call in &issued {
                inner.calls.forget(call.call_id);
            }
            return Err(e);
        }

        tracing::debug!(calls = issued.len(), "Batch sent");
        Ok(issued.into_iter().map(|call| call.response).collect())
    }

    /// Subscribe to a channel.
    pub async fn subscribe(&self, key: &str, payload: Value) -> Result<Subscription> {
        let inner = &self.inner;
        inner.expect_role(Role::Client)?;
        inner.ensure_open()?;

        let subscription = inner.subscriptions.subscribe(key);
        let body = SubscribeBody(key.to_string(), payload);
        if let Err(e) = inner.send_body(MessageTag::Subscription, &body).await {
            inner.subscriptions.unsubscribe(key);
            return Err(e);
        }
        Ok(subscription)
    }

    /// Leave a channel. On the client this drops the local listener; on the
    /// server it ends the peer's subscription. Returns `false` if the channel
    /// was not active, in which case nothing is sent.
    pub async fn unsubscribe(&self, key: &str) -> Result<bool> {
        let inner = &self.inner;
        inner.ensure_open()?;

        let (removed, tag) = match inner.role {
            Role::Client => (inner.subscriptions.unsubscribe(key), MessageTag::ClientUnsubscribe),
            Role::Server => (inner.channels.unsubscribe(key), MessageTag::ServerUnsubscribe),
        };
        if removed {
            inner
                .send_body(tag, &UnsubscribeBody(key.to_string()))
                .await?;
        }
        Ok(removed)
    }

    /// Take the receiver of server-wide events (client). Returns `None` while
    /// a previous receiver is still alive.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SubscriptionEvent>> {
        let mut events = self.inner.events.lock();
        if events.as_ref().map_or(false, |tx| !tx.is_closed()) {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *events = Some(tx);
        Some(rx)
    }

    // Server operations

    /// Send an event on a channel (server). Returns `false` without sending
    /// if the peer is not subscribed to `key`.
    pub async fn publish(&self, key: &str, event: &str, payload: Value) -> Result<bool> {
        let inner = &self.inner;
        inner.expect_role(Role::Server)?;
        inner.ensure_open()?;

        if !inner.channels.contains(key) {
            return Ok(false);
        }
        let body = SubscriptionEventBody(key.to_string(), event.to_string(), payload);
        inner
            .send_body(MessageTag::ServerSubscriptionEvent, &body)
            .await?;
        Ok(true)
    }

    /// Send a server-wide event.
    pub async fn emit(&self, event: &str, payload: Value) -> Result<()> {
        let inner = &self.inner;
        inner.expect_role(Role::Server)?;
        inner.ensure_open()?;
        inner
            .send_body(MessageTag::Event, &EventBody(event.to_string(), payload))
            .await
    }

    /// Channels the peer is subscribed to (server).
    pub fn channels(&self) -> Vec<String> {
        self.inner.channels.keys()
    }

    // Inbound

    /// Handle one binary message from the transport.
    ///
    /// Messages that cannot be decoded are logged and dropped; the
    /// connection stays up. Fails only when the connection is not open.
    pub fn receive(&self, frame: Bytes) -> Result<()> {
        self.inner.ensure_open()?;
        match decode(frame) {
            Ok(message) => self.inner.dispatch(message),
            Err(e) => {
                tracing::warn!(connection = %self.inner.id, "Discarding undecodable message: {}", e)
            }
        }
        Ok(())
    }

    /// Handle a chunk of the HTTP text transport. Chunks may split frames
    /// anywhere.
    pub fn receive_text(&self, chunk: &[u8]) -> Result<()> {
        self.inner.ensure_open()?;
        let frames = self.inner.text.lock().push(chunk);
        for data in frames {
            match decode_text_payload(&data) {
                Ok(frame) => self.receive(frame)?,
                Err(e) => tracing::warn!(connection = %self.inner.id, "Discarding text frame: {}", e),
            }
        }
        Ok(())
    }

    /// End of the text transport. Trailing garbage is a framing error, which
    /// closes the connection.
    pub fn finish_text(&self) -> Result<()> {
        let finished = self.inner.text.lock().finish();
        if let Err(e) = finished {
            tracing::error!(connection = %self.inner.id, "Framing error: {}", e);
            self.close();
            return Err(e);
        }
        Ok(())
    }

    /// Run the dispatch loop over binary messages until the transport ends,
    /// then close the connection.
    pub async fn serve<S>(&self, incoming: S) -> Result<()>
    where
        S: Stream<Item = Bytes> + Send,
    {
        futures::pin_mut!(incoming);
        let mut result = Ok(());
        while let Some(frame) = incoming.next().await {
            if let Err(e) = self.receive(frame) {
                result = Err(e);
                break;
            }
        }
        self.close();
        result
    }

    /// Run the dispatch loop over chunks of the text transport until it
    /// ends, then close the connection.
    pub async fn serve_text<S>(&self, incoming: S) -> Result<()>
    where
        S: Stream<Item = Bytes> + Send,
    {
        futures::pin_mut!(incoming);
        let mut result = Ok(());
        while let Some(chunk) = incoming.next().await {
            if let Err(e) = self.receive_text(&chunk) {
                result = Err(e);
                break;
            }
        }
        if result.is_ok() {
            result = self.finish_text();
        }
        self.close();
        result
    }
}

impl EngineInner {
    fn ensure_open(&self) -> Result<()> {
        match *self.state.lock() {
            ConnectionState::Open => Ok(()),
            _ => Err(WiremuxError::ConnectionNotOpen),
        }
    }

    fn expect_role(&self, role: Role) -> Result<()> {
        if self.role == role {
            Ok(())
        } else {
            Err(WiremuxError::WrongRole(self.role))
        }
    }

    fn close(&self) {
        {
            let mut state = self.state.lock();
            match *state {
                ConnectionState::Closing | ConnectionState::Closed => return,
                _ => *state = ConnectionState::Closing,
            }
        }
        tracing::debug!(connection = %self.id, "Connection closing");

        // Settle calls first so their watchers find nothing left to abort.
        self.calls.clear();
        self.shutdown.abort(AbortReason::shutdown(CONNECTION_CLOSED));
        self.served.clear(CONNECTION_CLOSED);
        self.blobs_in.clear(CONNECTION_CLOSED);
        self.blobs_out.clear(CONNECTION_CLOSED);
        self.results_in.clear(CONNECTION_CLOSED);
        self.results_out.clear(CONNECTION_CLOSED);
        self.subscriptions.clear();
        self.channels.clear();
        self.events.lock().take();
        *self.text.lock() = FrameParser::new();
        self.writer.close();

        *self.state.lock() = ConnectionState::Closed;
        tracing::debug!(connection = %self.id, "Connection closed");
    }

    async fn send_body<T: serde::Serialize>(&self, tag: MessageTag, body: &T) -> Result<()> {
        let frame = encode(tag, body, self.format.as_ref())?;
        self.writer.send(frame).await
    }

    fn allocate_stream_id(&self) -> u32 {
        let mut next = self.next_stream_id.lock();
        let mut id = *next;
        while self.blobs_out.contains(id) {
            id = id.wrapping_add(1);
        }
        *next = id.wrapping_add(1);
        id
    }

    fn send_call_abort(&self, call_id: u32, reason: &str) {
        let body = RpcAbort {
            call_id,
            reason: Some(reason.to_string()),
        }
        .encode();
        if let Err(e) = self.writer.send_control(MessageTag::RpcAbort, body) {
            tracing::warn!(call_id, "Failed to send call abort: {}", e);
        }
    }

    fn dispatch(self: &Arc<Self>, message: Message) {
        let tag = message.tag;
        tracing::trace!(connection = %self.id, ?tag, len = message.body.len(), "Dispatching message");

        let from_server = self.role == Role::Client;
        let result = match tag {
            MessageTag::Event if from_server => self.on_event(&message),
            MessageTag::Rpc if from_server => self.on_response(&message),
            MessageTag::Rpc => self.on_call(&message),
            MessageTag::RpcBatch if !from_server => self.on_batch(&message),
            MessageTag::RpcStream if from_server => self.on_result_frame(message.body),
            MessageTag::RpcStream => self.on_result_pull(message.body),
            MessageTag::RpcAbort if from_server => self.on_call_aborted(message.body),
            MessageTag::RpcAbort => self.on_abort_request(message.body),
            MessageTag::Subscription if !from_server => self.on_subscribe(&message),
            MessageTag::ClientUnsubscribe if !from_server => self.on_unsubscribe(&message),
            MessageTag::ServerUnsubscribe if from_server => self.on_unsubscribe(&message),
            MessageTag::ServerSubscriptionEvent if from_server => self.on_channel_event(&message),
            MessageTag::ClientStreamPush | MessageTag::ServerStreamPush => {
                self.on_stream_push(tag, message.body)
            }
            MessageTag::ClientStreamPull | MessageTag::ServerStreamPull => {
                self.on_stream_pull(tag, message.body)
            }
            MessageTag::ClientStreamEnd | MessageTag::ServerStreamEnd => {
                self.on_stream_end(tag, message.body)
            }
            MessageTag::ClientStreamAbort | MessageTag::ServerStreamAbort => {
                self.on_stream_abort(tag, message.body)
            }
            MessageTag::Event
            | MessageTag::RpcBatch
            | MessageTag::Subscription
            | MessageTag::ClientUnsubscribe
            | MessageTag::ServerUnsubscribe
            | MessageTag::ServerSubscriptionEvent => Err(WiremuxError::decode(format!(
                "{:?} is not accepted by the {:?} side",
                tag, self.role
            ))),
        };

        if let Err(e) = result {
            tracing::warn!(connection = %self.id, ?tag, "Discarding message: {}", e);
        }
    }

    // Blob streams

    fn on_stream_push(&self, tag: MessageTag, body: Bytes) -> Result<()> {
        self.expect_peer_stream(tag)?;
        let push = StreamPush::decode(body)?;
        self.blobs_in.push(push.stream_id, push.chunk)
    }

    fn on_stream_end(&self, tag: MessageTag, body: Bytes) -> Result<()> {
        self.expect_peer_stream(tag)?;
        let end = StreamEnd::decode(body)?;
        self.blobs_in.end(end.stream_id)
    }

    fn on_stream_pull(&self, tag: MessageTag, body: Bytes) -> Result<()> {
        if stream_owner(tag) != self.role {
            return Err(WiremuxError::decode("pull credit for a stream the peer owns"));
        }
        let pull = StreamPull::decode(body)?;
        self.blobs_out.grant(pull.stream_id, pull.size)
    }

    /// Either the peer's producer failed or the peer stopped consuming ours.
    fn on_stream_abort(&self, tag: MessageTag, body: Bytes) -> Result<()> {
        let abort = StreamAbort::decode(body)?;
        if stream_owner(tag) == self.role {
            self.blobs_out.abort(abort.stream_id)
        } else {
            let reason = abort.reason.as_deref().unwrap_or("Stream aborted by peer");
            self.blobs_in.abort(abort.stream_id, reason)
        }
    }

    fn expect_peer_stream(&self, tag: MessageTag) -> Result<()> {
        if stream_owner(tag) == self.role {
            return Err(WiremuxError::decode("data for a stream this side owns"));
        }
        Ok(())
    }

    // Client side

    fn on_event(&self, message: &Message) -> Result<()> {
        let EventBody(event, payload) = message.body_value(self.format.as_ref())?;
        let events = self.events.lock();
        match events.as_ref() {
            Some(tx) if tx.send(SubscriptionEvent { event, payload }).is_ok() => {}
            _ => tracing::trace!(connection = %self.id, "No event listener, event dropped"),
        }
        Ok(())
    }

    fn on_response(&self, message: &Message) -> Result<()> {
        let mut collector = StreamCollector::new(&self.blobs_in);
        let response = match self.format.decode_rpc_response(&message.body, &mut collector) {
            Ok(response) => response,
            Err(e) => {
                collector.reject("Invalid response");
                return Err(e);
            }
        };

        let call_id = response.call_id;
        if !self.calls.is_pending(call_id) {
            tracing::debug!(call_id, "Response for a call that is no longer pending");
            collector.reject("Call is no longer pending");
            if matches!(response.body, ResponseBody::Stream) {
                self.send_call_abort(call_id, "Call is no longer pending");
            }
            return Ok(());
        }

        match response.body {
            ResponseBody::Value(value) => {
                let streams = collector.into_streams();
                let ids: Vec<u32> = streams.keys().copied().collect();
                let result = CallResult::Value(CallResponse { value, streams });
                if !self.calls.resolve(call_id, result) {
                    // Lost a race with a local abort.
                    for id in ids {
                        if let Ok(reader) = self.blobs_in.get(id) {
                            reader.abort("Call is no longer pending");
                        }
                    }
                }
            }
            ResponseBody::Error(error) => {
                self.calls.reject(call_id, WiremuxError::Remote(error));
            }
            ResponseBody::Stream => {
                let reader = self.results_in.add(call_id, None)?;
                let items = ResultStream::new(reader, self.format.clone());
                // Dropping an unsettled result stream tells the server to stop.
                self.calls.resolve(call_id, CallResult::Stream(items));
            }
        }
        Ok(())
    }

    fn on_result_frame(&self, body: Bytes) -> Result<()> {
        match RpcStreamFrame::decode(body)? {
            RpcStreamFrame::Chunk { call_id, data } => self.results_in.push(call_id, data),
            RpcStreamFrame::End { call_id } => self.results_in.end(call_id),
            RpcStreamFrame::Abort { call_id, reason } => {
                let reason = reason.as_deref().unwrap_or("Stream aborted by server");
                self.results_in.abort(call_id, reason)
            }
        }
    }

    fn on_call_aborted(&self, body: Bytes) -> Result<()> {
        let abort = RpcAbort::decode(body)?;
        let reason = abort.reason.as_deref().unwrap_or("Call aborted by server");
        let rejected = self
            .calls
            .reject(abort.call_id, WiremuxError::CallAborted(reason.to_string()));
        let stream_aborted = self.results_in.abort(abort.call_id, reason).is_ok();
        if !rejected && !stream_aborted {
            tracing::debug!(call_id = abort.call_id, "Abort for unknown call");
        }
        Ok(())
    }

    fn on_unsubscribe(&self, message: &Message) -> Result<()> {
        let UnsubscribeBody(key) = message.body_value(self.format.as_ref())?;
        let removed = match self.role {
            Role::Client => self.subscriptions.unsubscribe(&key),
            Role::Server => self.channels.unsubscribe(&key),
        };
        tracing::debug!(connection = %self.id, channel = %key, removed, "Peer unsubscribed");
        Ok(())
    }

    fn on_channel_event(&self, message: &Message) -> Result<()> {
        let SubscriptionEventBody(key, event, payload) =
            message.body_value(self.format.as_ref())?;
        self.subscriptions.deliver(&key, event, payload);
        Ok(())
    }

    // Server side

    fn on_subscribe(&self, message: &Message) -> Result<()> {
        let SubscribeBody(key, _payload) = message.body_value(self.format.as_ref())?;
        tracing::debug!(connection = %self.id, channel = %key, "Peer subscribed");
        self.channels.subscribe(key);
        Ok(())
    }

    fn on_call(self: &Arc<Self>, message: &Message) -> Result<()> {
        let mut collector = StreamCollector::new(&self.blobs_in);
        match self.format.decode_rpc(&message.body, &mut collector) {
            Ok(call) => {
                let streams = collector.into_streams();
                self.serve_call(call, streams);
                Ok(())
            }
            Err(e) => {
                collector.reject("Invalid call");
                Err(e)
            }
        }
    }

    fn on_batch(self: &Arc<Self>, message: &Message) -> Result<()> {
        let mut collector = StreamCollector::new(&self.blobs_in);
        let calls = match self.format.decode_rpc_batch(&message.body, &mut collector) {
            Ok(calls) => calls,
            Err(e) => {
                collector.reject("Invalid call");
                return Err(e);
            }
        };

        let mut streams = collector.into_streams();
        for call in calls {
            let mut ids = Vec::new();
            referenced_streams(&call.payload, &mut ids);
            let own: BTreeMap<_, _> = ids
                .into_iter()
                .filter_map(|id| streams.remove(&id).map(|reader| (id, reader)))
                .collect();
            self.serve_call(call, own);
        }
        for reader in streams.into_values() {
            reader.abort("Stream not referenced by any call");
        }
        Ok(())
    }

    fn on_result_pull(&self, body: Bytes) -> Result<()> {
        let pull = RpcStreamPull::decode(body)?;
        self.results_out.grant(pull.call_id, 1)
    }

    fn on_abort_request(&self, body: Bytes) -> Result<()> {
        let abort = RpcAbort::decode(body)?;
        let reason = abort.reason.as_deref().unwrap_or("Call aborted by client");
        let served = self
            .served
            .abort(abort.call_id, AbortReason::cancelled(reason));
        let streaming = self.results_out.abort(abort.call_id).is_ok();
        tracing::debug!(call_id = abort.call_id, served, streaming, "Call aborted by client");
        Ok(())
    }

    fn serve_call(self: &Arc<Self>, call: RpcCallFrame, streams: BTreeMap<u32, InboundStream>) {
        let call_id = call.call_id;

        let permit = match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::warn!(call_id, procedure = %call.procedure, "Handler capacity reached, rejecting call");
                for reader in streams.into_values() {
                    reader.abort("Service unavailable");
                }
                let engine = self.clone();
                tokio::spawn(async move {
                    let error = RpcError::new(ErrorCode::ServiceUnavailable, "Too many concurrent calls");
                    engine.respond(call_id, Err(error)).await;
                });
                return;
            }
        };

        let Some(controller) = self.served.register(call_id) else {
            tracing::warn!(call_id, "Call id already being served, ignoring");
            for reader in streams.into_values() {
                reader.abort("Duplicate call id");
            }
            return;
        };

        let signal = AbortSignal::any([controller.signal(), self.shutdown.signal()]);
        let incoming = IncomingCall::new(call_id, call.procedure, call.payload)
            .with_connection(self.id, streams, signal);
        tracing::debug!(call_id, procedure = incoming.procedure(), "Serving call");

        let engine = self.clone();
        tokio::spawn(async move {
            // Permit is held until this task completes
            let _permit = permit;

            let handler = engine.handler.clone();
            let outcome = AssertUnwindSafe(async move { handler.call(incoming).await })
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    tracing::error!(call_id, "Handler panicked");
                    Err(RpcError::new(ErrorCode::InternalServerError, "Internal server error"))
                });

            // An aborted call gets no response: the caller already gave up.
            let wanted = engine.served.contains(call_id);
            engine.served.finish(call_id);
            if wanted {
                engine.respond(call_id, outcome).await;
            }
        });
    }

    async fn respond(&self, call_id: u32, outcome: HandlerResult) {
        let outcome = match outcome {
            Ok(CallOutput::Value(payload)) => RpcOutcome::Value(payload),
            Ok(CallOutput::Stream(items)) => {
                let format = self.format.clone();
                let producer = items
                    .map(move |item| match item {
                        Ok(value) => format.encode(&value).map(Bytes::from),
                        Err(error) => Err(WiremuxError::Remote(error)),
                    })
                    .boxed();
                match self.results_out.add(call_id, None, producer) {
                    Ok(()) => RpcOutcome::Stream,
                    Err(e) => RpcOutcome::Error(e.to_rpc_error()),
                }
            }
            Err(error) => RpcOutcome::Error(error),
        };

        let mut binder = StreamBinder::new(self);
        let frame = match self.format.encode_rpc_response(call_id, outcome, &mut binder) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(call_id, "Failed to encode response: {}", e);
                binder.rollback();
                let fallback = RpcOutcome::Error(e.to_rpc_error());
                match self.format.encode_rpc_response(call_id, fallback, &mut binder) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::error!(call_id, "Failed to encode error response: {}", e);
                        return;
                    }
                }
            }
        };

        if let Err(e) = self
            .writer
            .send_message(MessageTag::Rpc, Bytes::from(frame))
            .await
        {
            tracing::warn!(call_id, "Failed to send response: {}", e);
            binder.rollback();
            let _ = self.results_out.abort(call_id);
        }
    }
}

/// Side that owns (produces) the stream a stream tag refers to.
fn stream_owner(tag: MessageTag) -> Role {
    match tag {
        MessageTag::ClientStreamAbort
        | MessageTag::ClientStreamPush
        | MessageTag::ClientStreamPull
        | MessageTag::ClientStreamEnd => Role::Client,
        _ => Role::Server,
    }
}

/// Collect the ids of every stream token inside `value`.
fn referenced_streams(value: &Value, ids: &mut Vec<u32>) {
    match value {
        Value::String(_) => ids.extend(parse_stream_token(value)),
        Value::Array(items) => items.iter().for_each(|v| referenced_streams(v, ids)),
        Value::Object(map) => map.values().for_each(|v| referenced_streams(v, ids)),
        _ => {}
    }
}

/// Registers blobs of an outgoing payload as outbound streams.
struct StreamBinder<'a> {
    engine: &'a EngineInner,
    added: Vec<u32>,
}

impl<'a> StreamBinder<'a> {
    fn new(engine: &'a EngineInner) -> Self {
        Self {
            engine,
            added: Vec::new(),
        }
    }

    /// Drop the streams registered so far; the message never left.
    fn rollback(&mut self) {
        for id in self.added.drain(..) {
            let _ = self.engine.blobs_out.abort(id);
        }
    }
}

impl EncodeRpcContext for StreamBinder<'_> {
    fn add_stream(&mut self, blob: Blob) -> Result<u32> {
        let id = self.engine.allocate_stream_id();
        let (metadata, source): (BlobMetadata, _) = blob.into_parts();
        let producer = source.map(|chunk| chunk.map_err(WiremuxError::from)).boxed();
        self.engine.blobs_out.add(id, Some(metadata), producer)?;
        self.added.push(id);
        Ok(id)
    }
}

/// Registers streams announced by an incoming payload.
struct StreamCollector<'a> {
    streams: &'a InboundStreams,
    bound: BTreeMap<u32, InboundStream>,
}

impl<'a> StreamCollector<'a> {
    fn new(streams: &'a InboundStreams) -> Self {
        Self {
            streams,
            bound: BTreeMap::new(),
        }
    }

    fn into_streams(self) -> BTreeMap<u32, InboundStream> {
        self.bound
    }

    /// Abort everything registered so far and tell the producer.
    fn reject(self, reason: &str) {
        for reader in self.bound.into_values() {
            reader.abort(reason);
        }
    }
}

impl DecodeRpcContext for StreamCollector<'_> {
    fn add_stream(&mut self, id: u32, metadata: BlobMetadata) -> Result<()> {
        let reader = self.streams.add(id, Some(metadata))?;
        self.bound.insert(id, reader);
        Ok(())
    }
}
