//! Transport abstraction handed over by the hosting layer.
//!
//! A transport is split into a [`FrameSource`] (read half, owned by the
//! connection's receive loop) and a [`FrameSink`] (write half, used by the
//! output partition that owns the connection). Message boundaries come
//! entirely from the transport's end-of-message signal.

pub mod memory;
pub mod websocket;

use crate::error::TransportError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU8, Ordering};

pub use websocket::{WebSocketSink, WebSocketSource};

/// A single frame read from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A binary data frame; a message is complete once `end_of_message` is set
    Binary {
        /// Frame payload
        payload: Vec<u8>,
        /// Whether this frame terminates the current message
        end_of_message: bool,
    },
    /// A text frame; not a valid data frame for this protocol
    Text(String),
    /// The peer started (or answered) the close handshake
    Close,
}

impl Frame {
    /// Builds a complete single-frame binary message.
    pub fn message(payload: impl Into<Vec<u8>>) -> Self {
        Frame::Binary {
            payload: payload.into(),
            end_of_message: true,
        }
    }
}

/// Close status sent with the close handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// Normal closure
    Normal,
    /// The peer sent a frame this protocol does not accept
    ProtocolError,
    /// A message exceeded the receive buffer capacity
    MessageTooBig,
    /// The server is going away
    GoingAway,
}

/// Read half of a transport.
#[async_trait]
pub trait FrameSource: Send + 'static {
    /// Reads the next frame. `Ok(None)` means the stream ended without a
    /// close handshake.
    async fn next_frame(&mut self) -> Result<Option<Frame>, TransportError>;
}

/// Write half of a transport.
#[async_trait]
pub trait FrameSink: Send + 'static {
    /// Writes one complete binary message.
    async fn send_message(&mut self, payload: &[u8]) -> Result<(), TransportError>;

    /// Sends the close handshake frame.
    async fn send_close(&mut self, code: CloseCode) -> Result<(), TransportError>;

    /// Releases the underlying socket.
    async fn shutdown(&mut self) -> Result<(), TransportError>;
}

/// A transport split into its two halves.
pub struct Transport {
    pub(crate) sink: Box<dyn FrameSink>,
    pub(crate) source: Box<dyn FrameSource>,
}

impl Transport {
    /// Combines a sink and a source into a transport.
    pub fn new(sink: impl FrameSink, source: impl FrameSource) -> Self {
        Self {
            sink: Box::new(sink),
            source: Box::new(source),
        }
    }

    /// Wraps an upgraded WebSocket stream.
    pub fn websocket<S>(stream: tokio_tungstenite::WebSocketStream<S>) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, source) = websocket::split(stream);
        Self::new(sink, source)
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

/// Lifecycle of the close handshake as seen by one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportState {
    /// Data may flow in both directions
    Open = 0,
    /// We sent a close frame and wait for the peer's answer
    CloseSent = 1,
    /// The peer sent a close frame that we have not answered yet
    CloseReceived = 2,
    /// Handshake complete or transport released
    Closed = 3,
}

impl TransportState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TransportState::Open,
            1 => TransportState::CloseSent,
            2 => TransportState::CloseReceived,
            _ => TransportState::Closed,
        }
    }
}

/// Atomically updated [`TransportState`].
#[derive(Debug)]
pub(crate) struct TransportStateCell(AtomicU8);

impl TransportStateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(TransportState::Open as u8))
    }

    pub(crate) fn get(&self) -> TransportState {
        TransportState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn is_open(&self) -> bool {
        self.get() == TransportState::Open
    }

    /// Records a close frame from the peer.
    pub(crate) fn mark_close_received(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                match TransportState::from_u8(current) {
                    TransportState::Open => Some(TransportState::CloseReceived as u8),
                    TransportState::CloseSent => Some(TransportState::Closed as u8),
                    _ => None,
                }
            });
    }

    /// Claims the right to send our close frame. Returns `false` when a
    /// close frame was already sent or the transport is closed.
    pub(crate) fn begin_close(&self) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                match TransportState::from_u8(current) {
                    TransportState::Open => Some(TransportState::CloseSent as u8),
                    TransportState::CloseReceived => Some(TransportState::Closed as u8),
                    _ => None,
                }
            })
            .is_ok()
    }

    pub(crate) fn mark_closed(&self) {
        self.0.store(TransportState::Closed as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_initiated_locally() {
        let state = TransportStateCell::new();
        assert!(state.is_open());
        assert!(state.begin_close());
        assert_eq!(state.get(), TransportState::CloseSent);
        assert!(!state.begin_close());

        state.mark_close_received();
        assert_eq!(state.get(), TransportState::Closed);
    }

    #[test]
    fn test_close_initiated_by_peer() {
        let state = TransportStateCell::new();
        state.mark_close_received();
        assert_eq!(state.get(), TransportState::CloseReceived);
        assert!(!state.is_open());

        // Our reply completes the handshake
        assert!(state.begin_close());
        assert_eq!(state.get(), TransportState::Closed);
    }
}
