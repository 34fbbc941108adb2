//! Error types for the connection pipeline.
//!
//! Each concern gets its own error enum so callers can tell expected,
//! protocol-level failures (an unknown route, a closed socket) apart from
//! genuine configuration mistakes (a duplicate route at startup).

use crate::connection::ConnectionId;
use thiserror::Error;

/// Failures raised by a [`WireSerializer`](crate::serializer::WireSerializer).
#[derive(Error, Debug)]
pub enum CodecError {
    /// The outgoing value could not be encoded
    #[error("Encoding failed: {0}")]
    Encode(String),
    /// The incoming bytes could not be decoded into an envelope
    #[error("Decoding failed: {0}")]
    Decode(String),
}

/// Faults reported by the underlying socket transport.
#[derive(Error, Debug)]
pub enum TransportError {
    /// WebSocket protocol or I/O failure
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    /// The peer went away without a close handshake
    #[error("Transport closed unexpectedly")]
    Closed,
    /// The peer sent a message larger than the transport accepts
    #[error("Message exceeds the transport size limit")]
    MessageTooBig,
    /// Any other transport-level failure
    #[error("Transport error: {0}")]
    Other(String),
}

/// Errors surfaced by a single [`Connection`](crate::connection::Connection).
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// `run_receive_loop` was called a second time
    #[error("Receive loop already started for connection {0}")]
    AlreadyStarted(ConnectionId),
    /// Socket-level failure
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Envelope encode/decode failure
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Routing failures from the method dispatch table.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// No handler is registered for the envelope's discriminator
    #[error("Method not found for discriminator {0}")]
    MethodNotFound(String),
    /// Two handlers were registered for the same discriminator
    #[error("Duplicate route registered for discriminator {0}")]
    DuplicateRoute(String),
}

/// Error returned by application handler functions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The handler could not complete its work
    #[error("Handler failed: {0}")]
    Failed(String),
    /// The envelope did not carry what the handler expected
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

impl HandlerError {
    /// Shorthand for [`HandlerError::Failed`].
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Errors from the queue dispatcher.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// The scheduler has been shut down; no further work is accepted
    #[error("Scheduler is shut down")]
    ShutDown,
    /// A worker thread could not be started
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(String),
    /// The scheduler was created outside of a tokio runtime
    #[error("No tokio runtime available: {0}")]
    Runtime(String),
}

/// Errors from the connection registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The registry no longer accepts sockets
    #[error("Connection registry is shut down")]
    ShutDown,
}

/// Hosting-layer errors.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Network-related errors (binding, accepting, upgrading)
    #[error("Network error: {0}")]
    Network(String),
    /// Invalid server configuration
    #[error("Configuration error: {0}")]
    Config(String),
    /// Internal server errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<SchedulerError> for ServerError {
    fn from(error: SchedulerError) -> Self {
        ServerError::Internal(error.to_string())
    }
}
