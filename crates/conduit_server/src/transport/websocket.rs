//! `tokio-tungstenite` adapter.
//!
//! Tungstenite reassembles fragmented messages and answers pings itself, so
//! every binary message arrives here as a single frame with the
//! end-of-message marker set.

use super::{CloseCode, Frame, FrameSink, FrameSource};
use crate::error::TransportError;
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::WebSocketStream;

/// Read half of an upgraded WebSocket.
pub struct WebSocketSource<S> {
    inner: SplitStream<WebSocketStream<S>>,
}

/// Write half of an upgraded WebSocket.
pub struct WebSocketSink<S> {
    inner: SplitSink<WebSocketStream<S>, Message>,
}

pub(crate) fn split<S>(stream: WebSocketStream<S>) -> (WebSocketSink<S>, WebSocketSource<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, source) = stream.split();
    (WebSocketSink { inner: sink }, WebSocketSource { inner: source })
}

#[async_trait]
impl<S> FrameSource for WebSocketSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn next_frame(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            let Some(message) = self.inner.next().await else {
                return Ok(None);
            };

            let message = match message {
                Ok(message) => message,
                Err(tokio_tungstenite::tungstenite::Error::Capacity(_)) => {
                    return Err(TransportError::MessageTooBig);
                }
                Err(e) => return Err(e.into()),
            };

            return match message {
                Message::Binary(payload) => Ok(Some(Frame::message(payload.to_vec()))),
                Message::Text(text) => Ok(Some(Frame::Text(text.as_str().to_owned()))),
                Message::Close(_) => Ok(Some(Frame::Close)),
                // Control frames are handled by tungstenite
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            };
        }
    }
}

#[async_trait]
impl<S> FrameSink for WebSocketSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send_message(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        self.inner.send(Message::binary(payload.to_vec())).await?;
        Ok(())
    }

    async fn send_close(&mut self, code: CloseCode) -> Result<(), TransportError> {
        let frame = match code {
            CloseCode::Normal => None,
            CloseCode::ProtocolError => Some(CloseFrame {
                code: WsCloseCode::Protocol,
                reason: Utf8Bytes::from_static("unexpected frame type"),
            }),
            CloseCode::MessageTooBig => Some(CloseFrame {
                code: WsCloseCode::Size,
                reason: Utf8Bytes::from_static("message too big"),
            }),
            CloseCode::GoingAway => Some(CloseFrame {
                code: WsCloseCode::Away,
                reason: Utf8Bytes::from_static("server shutting down"),
            }),
        };
        self.inner.send(Message::Close(frame)).await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), TransportError> {
        match self.inner.close().await {
            Ok(()) => Ok(()),
            // Already closed by the handshake
            Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed)
            | Err(tokio_tungstenite::tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
