//! Handler module - serving incoming calls.
//!
//! The engine does not resolve procedure names. Every incoming call goes to
//! one [`CallHandler`], which is free to route on
//! [`IncomingCall::procedure`] however it likes. Closures taking an
//! [`IncomingCall`] and returning a future implement the trait directly.
//!
//! A handler answers with a [`CallOutput`]: a single value (which may carry
//! blobs, sent as streams) or a stream of values pulled item by item by the
//! caller. Failing with an [`RpcError`] sends that error back to the caller.
//!
//! # Example
//!
//! ```ignore
//! use serde_json::json;
//! use wiremux::handler::{CallOutput, IncomingCall};
//! use wiremux::{ErrorCode, RpcError};
//!
//! let handler = |call: IncomingCall| async move {
//!     match call.procedure() {
//!         "echo" => Ok(CallOutput::value(call.payload().clone())),
//!         "count" => {
//!             let n: u64 = call.deserialize()?;
//!             let items = futures::stream::iter((0..n).map(|i| Ok(json!(i))));
//!             Ok(CallOutput::stream(items))
//!         }
//!         other => Err(RpcError::new(ErrorCode::NotFound, format!("unknown procedure {}", other))),
//!     }
//! };
//! ```

mod context;

use std::future::Future;
use std::pin::Pin;

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde_json::Value;

use crate::codec::Payload;
use crate::error::{ErrorCode, RpcError};

pub use context::IncomingCall;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result type for handler functions.
pub type HandlerResult = std::result::Result<CallOutput, RpcError>;

/// Items of a streaming result.
pub type ItemStream = BoxStream<'static, std::result::Result<Value, RpcError>>;

/// What a handler answers with.
pub enum CallOutput {
    /// A single value.
    Value(Payload),
    /// Items sent one per pull from the caller. An `Err` item aborts the
    /// stream with its message.
    Stream(ItemStream),
}

impl CallOutput {
    pub fn value(payload: impl Into<Payload>) -> Self {
        Self::Value(payload.into())
    }

    pub fn stream<S>(items: S) -> Self
    where
        S: Stream<Item = std::result::Result<Value, RpcError>> + Send + 'static,
    {
        Self::Stream(items.boxed())
    }
}

impl From<Payload> for CallOutput {
    fn from(payload: Payload) -> Self {
        Self::Value(payload)
    }
}

impl From<Value> for CallOutput {
    fn from(value: Value) -> Self {
        Self::Value(Payload::new(value))
    }
}

impl std::fmt::Debug for CallOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(payload) => f.debug_tuple("Value").field(payload).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Serves incoming calls.
pub trait CallHandler: Send + Sync + 'static {
    fn call(&self, call: IncomingCall) -> BoxFuture<'static, HandlerResult>;
}

impl<F, Fut> CallHandler for F
where
    F: Fn(IncomingCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, call: IncomingCall) -> BoxFuture<'static, HandlerResult> {
        Box::pin((self)(call))
    }
}

/// Handler used when none is configured: every call fails with `NotFound`.
pub struct NoHandler;

impl CallHandler for NoHandler {
    fn call(&self, call: IncomingCall) -> BoxFuture<'static, HandlerResult> {
        let message = format!("No handler for procedure {}", call.procedure());
        Box::pin(async move { Err(RpcError::new(ErrorCode::NotFound, message)) })
    }
}
