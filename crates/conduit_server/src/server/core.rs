//! Core server implementation.

use crate::config::ServerConfig;
use crate::dispatch::Dispatch;
use crate::error::ServerError;
use crate::registry::ConnectionRegistry;
use crate::scheduler::QueueDispatcher;
use crate::serializer::WireSerializer;
use crate::server::listener::bind_listener;
use crate::transport::Transport;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// A WebSocket server in front of the connection pipeline.
///
/// `ConduitServer` owns the scheduler and the connection registry, accepts
/// TCP connections, performs the WebSocket upgrade and hands every upgraded
/// socket to the registry. Application logic lives entirely in the
/// [`Dispatch`] implementation passed to [`ConduitServer::new`].
pub struct ConduitServer<In, Out> {
    /// Server configuration settings
    config: ServerConfig,

    /// The two-tier dispatcher shared by every connection
    scheduler: Arc<QueueDispatcher<In, Out>>,

    /// Live connection tracking
    registry: Arc<ConnectionRegistry<In, Out>>,

    /// Stops the accept loop
    shutdown: CancellationToken,

    /// Parent of every connection's cancellation token
    connections: CancellationToken,

    /// WebSocket upgrades in flight, counted against `max_connections`
    pending_upgrades: Arc<AtomicUsize>,
}

impl<In, Out> ConduitServer<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    /// Creates the server and starts the scheduler's worker threads.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Arguments
    ///
    /// * `config` - Configuration parameters for server behavior
    /// * `dispatch` - The method dispatch table holding the application handlers
    /// * `serializer` - Wire codec for incoming and outgoing envelopes
    pub fn new(
        config: ServerConfig,
        dispatch: impl Dispatch<In, Out> + 'static,
        serializer: Arc<dyn WireSerializer<In, Out>>,
    ) -> Result<Self, ServerError> {
        let scheduler = QueueDispatcher::new(dispatch, config.scheduler_settings())?;
        let registry = ConnectionRegistry::new(serializer, Arc::clone(&scheduler), config.connection_settings());

        Ok(Self {
            config,
            scheduler,
            registry,
            shutdown: CancellationToken::new(),
            connections: CancellationToken::new(),
            pending_upgrades: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Binds the configured address and serves until [`shutdown`](Self::shutdown).
    pub async fn start(&self) -> Result<(), ServerError> {
        let listener = bind_listener(self.config.bind_address)?;
        info!("🚀 Server listening on {}", self.config.bind_address);
        self.serve(listener).await
    }

    /// Runs the accept loop on an already bound listener, then tears down
    /// every connection and the scheduler once shutdown is requested.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let tick = self.start_server_tick();

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown signal received");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => self.handle_stream(stream, addr),
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
            }
        }

        info!("🧹 Performing server cleanup...");
        if let Some(tick) = tick {
            tick.abort();
        }
        self.registry.shutdown().await;
        self.connections.cancel();
        info!("✅ Server stopped");
        Ok(())
    }

    fn handle_stream(&self, stream: TcpStream, addr: SocketAddr) {
        let upgrade = PendingUpgrade::begin(&self.pending_upgrades);
        let active = self.registry.connection_count() + upgrade.in_flight;
        if active >= self.config.max_connections {
            warn!(%addr, active, "Connection limit reached; rejecting socket");
            return;
        }
        stream.set_nodelay(true).ok();

        let registry = Arc::clone(&self.registry);
        let token = self.connections.clone();
        let websocket_config = self.websocket_config();
        tokio::spawn(
            async move {
                let upgraded = tokio_tungstenite::accept_async_with_config(stream, Some(websocket_config)).await;
                let websocket = match upgraded {
                    Ok(websocket) => websocket,
                    Err(e) => {
                        warn!(error = %e, "WebSocket upgrade failed");
                        return;
                    }
                };

                match registry.accept_socket(Transport::websocket(websocket), &token) {
                    Ok(accepted) => info!("🔗 Connection {} accepted", accepted.connection.id()),
                    Err(e) => warn!(error = %e, "Socket rejected"),
                }
                drop(upgrade);
            }
            .instrument(info_span!("accept", %addr)),
        );
    }

    /// Tungstenite never buffers more than one receive buffer per message.
    fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig::default()
            .max_message_size(Some(self.config.receive_buffer_size))
            .max_frame_size(Some(self.config.receive_buffer_size))
    }

    /// Starts the tick loop that feeds `submit_tick` through the input
    /// queue. Returns `None` when the tick is disabled.
    fn start_server_tick(&self) -> Option<JoinHandle<()>> {
        if self.config.tick_interval_ms == 0 {
            info!("⏸️ Server tick disabled (interval: 0ms)");
            return None;
        }

        let scheduler = Arc::clone(&self.scheduler);
        let tick_interval = Duration::from_millis(self.config.tick_interval_ms);
        info!("🕒 Server tick started with interval: {}ms", self.config.tick_interval_ms);

        Some(tokio::spawn(async move {
            let mut ticker = interval(tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut tick_count: u64 = 0;

            loop {
                ticker.tick().await;
                tick_count += 1;

                if let Err(e) = scheduler.submit_tick_async(tick_count).await {
                    debug!(error = %e, "Server tick stopped");
                    break;
                }
            }
        }))
    }

    /// Initiates server shutdown. The accept loop stops and `serve` tears
    /// down connections and the scheduler before returning.
    pub async fn shutdown(&self) -> Result<(), ServerError> {
        info!("🛑 Shutting down server...");
        self.shutdown.cancel();
        Ok(())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn scheduler(&self) -> Arc<QueueDispatcher<In, Out>> {
        Arc::clone(&self.scheduler)
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry<In, Out>> {
        Arc::clone(&self.registry)
    }

    /// Token cancelled when shutdown is requested.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

/// One WebSocket upgrade in flight. Released when dropped.
struct PendingUpgrade {
    counter: Arc<AtomicUsize>,
    /// Upgrades in flight before this one
    in_flight: usize,
}

impl PendingUpgrade {
    fn begin(counter: &Arc<AtomicUsize>) -> Self {
        let in_flight = counter.fetch_add(1, Ordering::AcqRel);
        Self {
            counter: Arc::clone(counter),
            in_flight,
        }
    }
}

impl Drop for PendingUpgrade {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}
