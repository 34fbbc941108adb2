//! A single long-lived socket connection.
//!
//! The connection owns its receive loop (frame accumulation, decode and
//! hand-off to the scheduler), the outgoing send path, the observer
//! registry and the session store. Outgoing sends and observer changes are
//! only ever made by the output partition that owns the connection, plus
//! the connection's own teardown.

use crate::error::{ConnectionError, TransportError};
use crate::registry::ConnectionRegistry;
use crate::scheduler::QueueDispatcher;
use crate::serializer::WireSerializer;
use crate::session::SessionItems;
use crate::transport::{CloseCode, Frame, FrameSink, FrameSource, Transport, TransportState, TransportStateCell};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Identifier assigned by the registry, unique for the process lifetime.
pub type ConnectionId = u64;

/// How a receive loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveStatus {
    /// A complete message was read (only seen between loop iterations)
    MessageReceived,
    /// The peer sent a frame that is not a data frame, or an oversized message
    ProtocolError,
    /// The peer closed the socket, or the transport/decoder failed
    SocketClosing,
    /// The connection's cancellation token fired
    ConnectionCanceled,
}

/// A long-lived registration on a connection, disposed when it is removed
/// or when the connection tears down.
pub trait Subscription: Send + Sync + 'static {
    /// Releases the subscription. Called exactly once by the connection.
    fn dispose(&self);
}

impl Subscription for tokio::task::JoinHandle<()> {
    fn dispose(&self) {
        self.abort();
    }
}

impl Subscription for CancellationToken {
    fn dispose(&self) {
        self.cancel();
    }
}

/// A subscription plus the optional key used to find it again.
pub struct ObserverEntry {
    key: Option<String>,
    subscription: Box<dyn Subscription>,
}

impl ObserverEntry {
    /// Key the observer was registered under.
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }
}

/// Per-connection tunables.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Capacity of the receive buffer; larger messages are rejected
    pub receive_buffer_size: usize,
    /// How long teardown waits for the peer to answer the close handshake
    pub close_timeout: Duration,
    /// Drop undecodable messages instead of closing the connection
    pub skip_malformed_messages: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            receive_buffer_size: 64 * 1024,
            close_timeout: Duration::from_secs(2),
            skip_malformed_messages: false,
        }
    }
}

struct SendHalf {
    sink: Box<dyn FrameSink>,
    buffer: Vec<u8>,
}

/// Outcome of reading one message worth of frames.
enum Received {
    Message,
    Terminal(ReceiveStatus, Option<CloseCode>),
}

/// One accepted socket and everything scoped to it.
pub struct Connection<In, Out> {
    id: ConnectionId,
    state: TransportStateCell,
    cancellation: CancellationToken,
    session: SessionItems,
    observers: Mutex<Vec<ObserverEntry>>,
    send_half: tokio::sync::Mutex<SendHalf>,
    source: Mutex<Option<Box<dyn FrameSource>>>,
    started: AtomicBool,
    disposed: AtomicBool,
    receive_finished: watch::Sender<bool>,
    serializer: Arc<dyn WireSerializer<In, Out>>,
    scheduler: Arc<QueueDispatcher<In, Out>>,
    registry: Weak<ConnectionRegistry<In, Out>>,
    settings: ConnectionSettings,
}

impl<In, Out> Connection<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    pub(crate) fn new(
        id: ConnectionId,
        transport: Transport,
        cancellation: CancellationToken,
        serializer: Arc<dyn WireSerializer<In, Out>>,
        scheduler: Arc<QueueDispatcher<In, Out>>,
        registry: Weak<ConnectionRegistry<In, Out>>,
        settings: ConnectionSettings,
    ) -> Self {
        let Transport { sink, source } = transport;
        let (receive_finished, _) = watch::channel(false);

        Self {
            id,
            state: TransportStateCell::new(),
            cancellation,
            session: SessionItems::new(),
            observers: Mutex::new(Vec::new()),
            send_half: tokio::sync::Mutex::new(SendHalf {
                sink,
                buffer: Vec::new(),
            }),
            source: Mutex::new(Some(source)),
            started: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            receive_finished,
            serializer,
            scheduler,
            registry,
            settings,
        }
    }

    /// Connection identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Whether data can still be sent.
    pub fn is_open(&self) -> bool {
        self.state.is_open() && !self.is_disposed()
    }

    /// Current close-handshake state.
    pub fn transport_state(&self) -> TransportState {
        self.state.get()
    }

    /// Whether teardown has started.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Cancellation token for this connection, linked to the host's token.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Per-connection session store.
    pub fn session(&self) -> &SessionItems {
        &self.session
    }

    /// Runs the receive loop until the peer closes, a protocol error occurs,
    /// or the connection is cancelled. May only be called once.
    pub async fn run_receive_loop(self: Arc<Self>) -> Result<ReceiveStatus, ConnectionError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ConnectionError::AlreadyStarted(self.id));
        }
        let Some(mut source) = self.source.lock().take() else {
            return Err(ConnectionError::AlreadyStarted(self.id));
        };

        // Signals completion and leaves the registry even if this future is
        // dropped mid-await.
        let _guard = ReceiveLoopGuard { connection: &self };

        let (status, close_code) = match self.receive_messages(source.as_mut()).await {
            Ok(outcome) => outcome,
            Err(ConnectionError::Transport(TransportError::MessageTooBig)) => {
                warn!(connection_id = self.id, "Transport rejected an oversized message");
                (ReceiveStatus::ProtocolError, Some(CloseCode::MessageTooBig))
            }
            Err(error) => {
                warn!(connection_id = self.id, error = %error, "Receive loop failed; closing connection");
                (ReceiveStatus::SocketClosing, None)
            }
        };

        match (status, close_code) {
            (ReceiveStatus::SocketClosing | ReceiveStatus::ProtocolError, code) => {
                self.send_close_frame(code.unwrap_or(CloseCode::Normal)).await;
            }
            (ReceiveStatus::ConnectionCanceled, Some(code)) => self.send_close_frame(code).await,
            (ReceiveStatus::ConnectionCanceled, None) | (ReceiveStatus::MessageReceived, _) => {}
        }

        debug!(connection_id = self.id, ?status, "Receive loop finished");
        Ok(status)
    }

    async fn receive_messages(
        self: &Arc<Self>,
        source: &mut dyn FrameSource,
    ) -> Result<(ReceiveStatus, Option<CloseCode>), ConnectionError> {
        let mut buffer = Vec::with_capacity(self.settings.receive_buffer_size);

        loop {
            buffer.clear();
            let received = tokio::select! {
                biased;
                _ = self.cancellation.cancelled() => {
                    return Ok((ReceiveStatus::ConnectionCanceled, None));
                }
                received = self.receive_message(source, &mut buffer) => received?,
            };

            if let Received::Terminal(status, close_code) = received {
                return Ok((status, close_code));
            }

            let envelope = match self.serializer.decode(&buffer) {
                Ok(envelope) => envelope,
                Err(error) if self.settings.skip_malformed_messages => {
                    warn!(connection_id = self.id, error = %error, "Dropping malformed message");
                    continue;
                }
                Err(error) => return Err(error.into()),
            };

            // Enqueueing may wait on a full input queue
            let forwarded = tokio::select! {
                biased;
                _ = self.cancellation.cancelled() => {
                    return Ok((ReceiveStatus::ConnectionCanceled, None));
                }
                forwarded = self.scheduler.dispatch_operation_async(self, envelope) => forwarded,
            };
            if let Err(error) = forwarded {
                info!(connection_id = self.id, error = %error, "Scheduler unavailable; stopping receive loop");
                return Ok((ReceiveStatus::ConnectionCanceled, Some(CloseCode::GoingAway)));
            }
        }
    }

    /// Reads frames until the end-of-message marker, a close frame, or a
    /// non-data frame.
    async fn receive_message(
        &self,
        source: &mut dyn FrameSource,
        buffer: &mut Vec<u8>,
    ) -> Result<Received, ConnectionError> {
        loop {
            match source.next_frame().await? {
                Some(Frame::Binary {
                    payload,
                    end_of_message,
                }) => {
                    if buffer.len() + payload.len() > self.settings.receive_buffer_size {
                        warn!(
                            connection_id = self.id,
                            limit = self.settings.receive_buffer_size,
                            "Message exceeds receive buffer capacity"
                        );
                        return Ok(Received::Terminal(
                            ReceiveStatus::ProtocolError,
                            Some(CloseCode::MessageTooBig),
                        ));
                    }
                    buffer.extend_from_slice(&payload);
                    if end_of_message {
                        return Ok(Received::Message);
                    }
                }
                Some(Frame::Close) => {
                    self.state.mark_close_received();
                    return Ok(Received::Terminal(ReceiveStatus::SocketClosing, None));
                }
                Some(Frame::Text(_)) => {
                    debug!(connection_id = self.id, "Received non-binary frame");
                    return Ok(Received::Terminal(
                        ReceiveStatus::ProtocolError,
                        Some(CloseCode::ProtocolError),
                    ));
                }
                None => return Err(TransportError::Closed.into()),
            }
        }
    }

    /// Encodes `value` into the reusable outgoing buffer and writes it as
    /// one message. A no-op once the transport is no longer open.
    pub async fn send_message(&self, value: &Out) -> Result<(), ConnectionError> {
        if !self.is_open() {
            return Ok(());
        }

        let mut half = self.send_half.lock().await;
        let SendHalf { sink, buffer } = &mut *half;
        self.serializer.encode(value, buffer)?;
        sink.send_message(buffer).await?;
        Ok(())
    }

    /// Adds an observer. Observers registered after teardown started are
    /// disposed immediately.
    pub fn register_observer(&self, subscription: Box<dyn Subscription>, key: Option<String>) {
        if self.is_disposed() {
            subscription.dispose();
            return;
        }
        self.observers.lock().push(ObserverEntry { key, subscription });
    }

    /// Removes the observer registered under `key` and disposes it.
    /// Returns whether one was found.
    pub fn dispose_observer(&self, key: &str) -> bool {
        let removed = {
            let mut observers = self.observers.lock();
            observers
                .iter()
                .position(|entry| entry.key() == Some(key))
                .map(|index| observers.remove(index))
        };

        match removed {
            Some(entry) => {
                entry.subscription.dispose();
                true
            }
            None => false,
        }
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    /// Keys of the registered observers, in registration order.
    pub fn observer_keys(&self) -> Vec<Option<String>> {
        self.observers
            .lock()
            .iter()
            .map(|entry| entry.key.clone())
            .collect()
    }

    /// Tears the connection down. Idempotent and infallible: disposes every
    /// observer, performs the close handshake if still open, waits for the
    /// receive loop, then releases the transport.
    pub async fn close_connection(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(connection_id = self.id, "Tearing down connection");

        let observers = std::mem::take(&mut *self.observers.lock());
        for entry in observers {
            entry.subscription.dispose();
        }

        self.send_close_frame(CloseCode::Normal).await;
        self.wait_for_receive_loop().await;

        self.state.mark_closed();
        if let Err(error) = self.send_half.lock().await.sink.shutdown().await {
            debug!(connection_id = self.id, error = %error, "Transport shutdown failed");
        }
        self.session.clear();
    }

    async fn send_close_frame(&self, code: CloseCode) {
        if !self.state.begin_close() {
            return;
        }
        if let Err(error) = self.send_half.lock().await.sink.send_close(code).await {
            debug!(connection_id = self.id, error = %error, "Close handshake failed");
        }
    }

    async fn wait_for_receive_loop(&self) {
        if !self.started.load(Ordering::Acquire) {
            return;
        }

        let mut finished = self.receive_finished.subscribe();
        let graceful = tokio::time::timeout(self.settings.close_timeout, finished.wait_for(|done| *done))
            .await
            .is_ok();
        if graceful {
            return;
        }

        debug!(connection_id = self.id, "Peer did not finish the close handshake; cancelling");
        self.cancellation.cancel();
        if tokio::time::timeout(self.settings.close_timeout, finished.wait_for(|done| *done))
            .await
            .is_err()
        {
            warn!(connection_id = self.id, "Receive loop did not stop after cancellation");
        }
    }
}

impl<In, Out> std::fmt::Debug for Connection<In, Out> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state.get())
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

struct ReceiveLoopGuard<'a, In, Out> {
    connection: &'a Connection<In, Out>,
}

impl<In, Out> Drop for ReceiveLoopGuard<'_, In, Out> {
    fn drop(&mut self) {
        // Stored even with no subscriber yet; teardown may subscribe later.
        self.connection.receive_finished.send_replace(true);
        if let Some(registry) = self.connection.registry.upgrade() {
            registry.remove_closed_connection(self.connection.id);
        }
    }
}
