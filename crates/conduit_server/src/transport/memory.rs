//! In-process transport backed by tokio channels.
//!
//! Useful for hosting connections that never touch a socket (bots, local
//! tooling) and for driving the pipeline in tests. The [`MemoryPeer`]
//! plays the remote side: it injects frames and observes everything the
//! server wrote.

use super::{CloseCode, Frame, FrameSink, FrameSource, Transport};
use crate::error::TransportError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// Something the server wrote to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    /// A complete outgoing message
    Message(Vec<u8>),
    /// A close handshake frame
    Close(CloseCode),
    /// The transport was released
    Shutdown,
}

/// Creates a connected transport/peer pair.
///
/// The peer answers the server's close frame automatically, like a
/// well-behaved WebSocket client.
pub fn pair() -> (Transport, MemoryPeer) {
    pair_with_close_reply(true)
}

/// Creates a pair whose peer never answers the close handshake.
pub fn pair_without_close_reply() -> (Transport, MemoryPeer) {
    pair_with_close_reply(false)
}

fn pair_with_close_reply(reply_to_close: bool) -> (Transport, MemoryPeer) {
    let (frame_tx, frame_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let sink = MemorySink {
        events: event_tx,
        close_reply: reply_to_close.then(|| frame_tx.downgrade()),
    };
    let source = MemorySource { frames: frame_rx };
    let peer = MemoryPeer {
        frames: Some(frame_tx),
        events: event_rx,
    };

    (Transport::new(sink, source), peer)
}

struct MemorySource {
    frames: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn next_frame(&mut self) -> Result<Option<Frame>, TransportError> {
        Ok(self.frames.recv().await)
    }
}

struct MemorySink {
    events: mpsc::UnboundedSender<SinkEvent>,
    close_reply: Option<mpsc::WeakUnboundedSender<Frame>>,
}

impl MemorySink {
    fn emit(&self, event: SinkEvent) -> Result<(), TransportError> {
        self.events.send(event).map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_message(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        self.emit(SinkEvent::Message(payload.to_vec()))
    }

    async fn send_close(&mut self, code: CloseCode) -> Result<(), TransportError> {
        self.emit(SinkEvent::Close(code))?;
        if let Some(frames) = self.close_reply.as_ref().and_then(|weak| weak.upgrade()) {
            let _ = frames.send(Frame::Close);
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.emit(SinkEvent::Shutdown)
    }
}

/// The remote end of an in-memory transport.
#[derive(Debug)]
pub struct MemoryPeer {
    frames: Option<mpsc::UnboundedSender<Frame>>,
    events: mpsc::UnboundedReceiver<SinkEvent>,
}

impl MemoryPeer {
    /// Sends a raw frame to the server. Returns `false` once disconnected.
    pub fn send_frame(&self, frame: Frame) -> bool {
        self.frames
            .as_ref()
            .map(|frames| frames.send(frame).is_ok())
            .unwrap_or(false)
    }

    /// Sends a complete single-frame message.
    pub fn send_message(&self, payload: impl Into<Vec<u8>>) -> bool {
        self.send_frame(Frame::message(payload))
    }

    /// Sends one message split across several frames.
    pub fn send_fragmented<I, P>(&self, parts: I) -> bool
    where
        I: IntoIterator<Item = P>,
        P: Into<Vec<u8>>,
    {
        let mut parts = parts.into_iter().peekable();
        while let Some(part) = parts.next() {
            let frame = Frame::Binary {
                payload: part.into(),
                end_of_message: parts.peek().is_none(),
            };
            if !self.send_frame(frame) {
                return false;
            }
        }
        true
    }

    /// Starts the close handshake from the peer side.
    pub fn send_close(&self) -> bool {
        self.send_frame(Frame::Close)
    }

    /// Drops the connection without a close handshake.
    pub fn disconnect(&mut self) {
        self.frames = None;
    }

    /// Waits up to `wait` for the next thing the server wrote.
    pub async fn next_event(&mut self, wait: Duration) -> Option<SinkEvent> {
        tokio::time::timeout(wait, self.events.recv())
            .await
            .ok()
            .flatten()
    }

    /// Waits up to `wait` for the next outgoing message, skipping
    /// close/shutdown events.
    pub async fn next_message(&mut self, wait: Duration) -> Option<Vec<u8>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match self.next_event(remaining).await? {
                SinkEvent::Message(bytes) => return Some(bytes),
                SinkEvent::Close(_) | SinkEvent::Shutdown => continue,
            }
        }
    }

    /// Returns everything written so far without waiting.
    pub fn drain_events(&mut self) -> Vec<SinkEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fragmented_message_marks_last_frame() {
        let (mut transport, peer) = pair();
        assert!(peer.send_fragmented(vec![b"ab".to_vec(), b"cd".to_vec()]));

        let first = transport.source.next_frame().await.unwrap();
        let second = transport.source.next_frame().await.unwrap();
        assert_eq!(
            first,
            Some(Frame::Binary {
                payload: b"ab".to_vec(),
                end_of_message: false
            })
        );
        assert_eq!(second, Some(Frame::message(b"cd".to_vec())));
    }

    #[tokio::test]
    async fn test_close_reply_and_disconnect() {
        let (mut transport, mut peer) = pair();
        transport.sink.send_close(CloseCode::Normal).await.unwrap();

        assert_eq!(
            peer.next_event(Duration::from_millis(100)).await,
            Some(SinkEvent::Close(CloseCode::Normal))
        );
        assert_eq!(transport.source.next_frame().await.unwrap(), Some(Frame::Close));

        peer.disconnect();
        assert_eq!(transport.source.next_frame().await.unwrap(), None);
    }
}
