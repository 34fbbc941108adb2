//! Live connection tracking.
//!
//! The registry is the single entry point for accepted sockets: it assigns
//! identifiers, wires each [`Connection`] to the shared serializer and
//! scheduler, spawns its receive loop, and tears everything down on
//! shutdown.

use crate::connection::{Connection, ConnectionId, ConnectionSettings, ReceiveStatus};
use crate::error::RegistryError;
use crate::scheduler::QueueDispatcher;
use crate::serializer::WireSerializer;
use crate::transport::Transport;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

/// A freshly accepted connection and the task driving its receive loop.
///
/// The task resolves once the receive loop has ended and the connection
/// has been torn down.
pub struct AcceptedConnection<In, Out> {
    pub connection: Arc<Connection<In, Out>>,
    pub task: JoinHandle<ReceiveStatus>,
}

/// Tracks every live connection.
pub struct ConnectionRegistry<In, Out> {
    connections: DashMap<ConnectionId, Arc<Connection<In, Out>>>,
    next_id: AtomicU64,
    shut_down: AtomicBool,
    serializer: Arc<dyn WireSerializer<In, Out>>,
    scheduler: Arc<QueueDispatcher<In, Out>>,
    settings: ConnectionSettings,
    this: Weak<Self>,
}

impl<In, Out> ConnectionRegistry<In, Out> {
    /// Drops a connection from the live set. No-op after shutdown.
    pub fn remove_closed_connection(&self, id: ConnectionId) {
        if self.is_shut_down() {
            return;
        }
        if self.connections.remove(&id).is_some() {
            debug!(connection_id = id, "Connection removed from registry");
        }
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection<In, Out>>> {
        self.connections.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Identifiers of all live connections, in ascending order.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.connections.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

impl<In, Out> ConnectionRegistry<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    pub fn new(
        serializer: Arc<dyn WireSerializer<In, Out>>,
        scheduler: Arc<QueueDispatcher<In, Out>>,
        settings: ConnectionSettings,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
            serializer,
            scheduler,
            settings,
            this: this.clone(),
        })
    }

    /// Registers an upgraded transport and starts its receive loop.
    ///
    /// # Arguments
    ///
    /// * `transport` - The accepted socket, already past any upgrade handshake
    /// * `cancellation` - Host token; the connection gets a child of it
    ///
    /// # Returns
    ///
    /// The new connection and its receive task, or
    /// [`RegistryError::ShutDown`] once the registry has been shut down.
    pub fn accept_socket(
        &self,
        transport: Transport,
        cancellation: &CancellationToken,
    ) -> Result<AcceptedConnection<In, Out>, RegistryError> {
        if self.is_shut_down() {
            return Err(RegistryError::ShutDown);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let connection = Arc::new(Connection::new(
            id,
            transport,
            cancellation.child_token(),
            Arc::clone(&self.serializer),
            Arc::clone(&self.scheduler),
            self.this.clone(),
            self.settings.clone(),
        ));
        self.connections.insert(id, Arc::clone(&connection));

        // Shutdown may have started while we were inserting
        if self.is_shut_down() {
            self.connections.remove(&id);
            return Err(RegistryError::ShutDown);
        }

        let span = info_span!("connection", connection_id = id);
        let driver = Arc::clone(&connection);
        let task = self.scheduler.runtime().spawn(
            async move {
                debug!("Connection accepted");
                let status = match Arc::clone(&driver).run_receive_loop().await {
                    Ok(status) => status,
                    Err(e) => {
                        warn!(error = %e, "Receive loop could not start");
                        ReceiveStatus::SocketClosing
                    }
                };
                driver.close_connection().await;
                debug!(?status, "Connection finished");
                status
            }
            .instrument(span),
        );

        Ok(AcceptedConnection { connection, task })
    }

    pub fn scheduler(&self) -> &Arc<QueueDispatcher<In, Out>> {
        &self.scheduler
    }

    /// Stops accepting sockets, tears down every live connection, then
    /// shuts the scheduler down. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let connections: Vec<_> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        info!("🔌 Closing {} connection(s)", connections.len());

        futures::future::join_all(connections.iter().map(|connection| connection.close_connection())).await;
        self.connections.clear();

        let scheduler = Arc::clone(&self.scheduler);
        if let Err(e) = tokio::task::spawn_blocking(move || scheduler.shutdown()).await {
            warn!(error = %e, "Scheduler shutdown task failed");
        }
    }
}
