//! # Conduit Server - Ordered Dispatch for Long-Lived Sockets
//!
//! A message-oriented server core that accepts long-lived bidirectional
//! socket connections, decodes binary messages into typed envelopes, routes
//! each envelope to application handler logic and delivers the resulting
//! side effects back out.
//!
//! ## Guarantees
//!
//! * **Total order of business logic** - every handler invocation and every
//!   submitted task runs on one dedicated input worker, one at a time, in
//!   submission order
//! * **Per-connection output order** - a connection always maps to the same
//!   output partition (`connection_id mod N`), so its sends, subscription
//!   changes and closes are applied in the order they were recorded
//! * **Bounded memory** - every queue is bounded; producers block instead
//!   of dropping or reordering work
//!
//! ## Message Flow
//!
//! 1. A [`Connection`]'s receive loop accumulates frames until the end of a message
//! 2. The bytes are decoded by the [`WireSerializer`] into an envelope
//! 3. The [`QueueDispatcher`] enqueues the envelope with a fresh [`DeferredConnectionContext`]
//! 4. The input worker routes it through the [`MethodDispatchTable`]; the handler records effects
//! 5. The context moves to its connection's output partition, which replays the effects
//!
//! Observers registered by handlers can record more effects later and call
//! [`DeferredConnectionContext::request_flush`] to push them through the
//! same partition.
//!
//! ## Hosting
//!
//! [`ConduitServer`] binds a TCP listener, performs the WebSocket upgrade
//! and hands each socket to the [`ConnectionRegistry`]. Any other transport
//! can be plugged in through [`Transport::new`]; [`transport::memory`]
//! provides an in-process one.
//!
//! ## Error Handling
//!
//! Expected failures are explicit error values ([`DispatchError`],
//! [`SchedulerError`], [`ConnectionError`]). Handler failures and panics are
//! logged and isolated; teardown and shutdown never fail.

pub use config::ServerConfig;
pub use connection::{Connection, ConnectionId, ConnectionSettings, ReceiveStatus, Subscription};
pub use deferred::{DeferredConnectionContext, OutputRequest};
pub use dispatch::{Dispatch, DispatchOutcome, DispatchTableBuilder, MethodDispatchTable};
pub use error::{
    CodecError, ConnectionError, DispatchError, HandlerError, RegistryError, SchedulerError, ServerError,
    TransportError,
};
pub use registry::{AcceptedConnection, ConnectionRegistry};
pub use scheduler::{QueueDispatcher, SchedulerSettings, SchedulerStats, TaskCallback, WorkItem};
pub use serializer::{JsonSerializer, WireSerializer};
pub use server::{bind_listener, ConduitServer};
pub use session::SessionItems;
pub use transport::{CloseCode, Frame, FrameSink, FrameSource, Transport, TransportState};

pub mod config;
pub mod connection;
pub mod deferred;
pub mod dispatch;
pub mod error;
pub mod registry;
pub mod scheduler;
pub mod serializer;
pub mod server;
pub mod session;
pub mod transport;
