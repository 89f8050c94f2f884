//! # wiremux
//!
//! Multiplexed RPC protocol engine.
//!
//! One connection carries calls, streaming results, binary blob streams,
//! server events and channel subscriptions, all as tagged binary messages.
//! The engine is transport-agnostic: hand it a `Sink<Bytes>` for outbound
//! messages and feed it inbound messages, either as whole binary frames
//! (WebSocket style) or as chunks of a base64 `data:` text stream (HTTP).
//!
//! ## Architecture
//!
//! - **Protocol** ([`protocol`]): message tags, fixed binary bodies, text frame
//!   recovery
//! - **Codec** ([`codec`]): pluggable payload formats (JSON, MessagePack) and
//!   content-type negotiation
//! - **Registries**: pending calls ([`calls`]), blob and result streams
//!   ([`streams`]), subscriptions ([`subscriptions`])
//! - **Engine** ([`engine`]): lifecycle and message dispatch
//!
//! ## Example
//!
//! ```ignore
//! use serde_json::json;
//! use wiremux::handler::{CallOutput, IncomingCall};
//! use wiremux::EngineBuilder;
//!
//! #[tokio::main]
//! async fn main() -> wiremux::Result<()> {
//!     let server = EngineBuilder::server()
//!         .handler(|call: IncomingCall| async move {
//!             Ok(CallOutput::value(call.payload().clone()))
//!         })
//!         .build(outgoing);
//!     server.open()?;
//!     server.serve(incoming).await
//! }
//! ```

pub mod abort;
pub mod calls;
pub mod codec;
pub mod engine;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod streams;
pub mod subscriptions;
pub mod writer;

pub use abort::{AbortController, AbortReason, AbortSignal};
pub use calls::{CallOptions, CallResponse, CallResult, PendingCall, ResultStream};
pub use codec::{Blob, BlobMetadata, Format, FormatRegistry, JsonFormat, MsgPackFormat, Payload};
pub use engine::{ConnectionId, ConnectionState, EngineBuilder, EngineConfig, ProtocolEngine};
pub use error::{ErrorCode, Result, RpcError, WiremuxError};
pub use handler::{CallHandler, CallOutput, IncomingCall};
pub use protocol::Role;
pub use streams::InboundStream;
pub use subscriptions::{Subscription, SubscriptionEvent};
pub use writer::WriterConfig;
