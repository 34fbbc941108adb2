//! Deferred effects recorded while a handler runs.
//!
//! Handlers never touch a [`Connection`] directly. They record what they
//! want to happen (send, subscribe, unsubscribe, close) on a
//! [`DeferredConnectionContext`], and the output partition that owns the
//! connection replays the recording later, in order.

use crate::connection::{Connection, ConnectionId, Subscription};
use crate::error::{ConnectionError, SchedulerError};
use crate::scheduler::{enqueue_blocking, SchedulerShared, WorkItem};
use crate::session::SessionItems;
use crossbeam::channel::Sender;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// One recorded side effect.
pub enum OutputRequest<Out> {
    /// Send an envelope to the peer
    Send(Out),
    /// Register a long-lived observer on the connection
    Subscribe {
        /// The subscription to dispose on removal or teardown
        subscription: Box<dyn Subscription>,
        /// Lookup key for [`OutputRequest::Unsubscribe`]
        key: Option<String>,
    },
    /// Dispose the observer registered under this key
    Unsubscribe(String),
    /// Tear the connection down
    Close,
}

impl<Out> std::fmt::Debug for OutputRequest<Out> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputRequest::Send(_) => f.write_str("Send"),
            OutputRequest::Subscribe { key, .. } => f.debug_struct("Subscribe").field("key", key).finish(),
            OutputRequest::Unsubscribe(key) => f.debug_tuple("Unsubscribe").field(key).finish(),
            OutputRequest::Close => f.write_str("Close"),
        }
    }
}

/// The output queue a context delivers through, fixed when the context is
/// created.
pub(crate) struct OutputPartition<In, Out> {
    pub(crate) index: usize,
    pub(crate) sender: Sender<WorkItem<In, Out>>,
    pub(crate) shared: Arc<SchedulerShared>,
}

/// Records side effects for one connection and one handler invocation.
pub struct DeferredConnectionContext<In, Out> {
    connection: Arc<Connection<In, Out>>,
    requests: Mutex<Vec<OutputRequest<Out>>>,
    partition: OutputPartition<In, Out>,
}

impl<In, Out> DeferredConnectionContext<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    pub(crate) fn new(connection: Arc<Connection<In, Out>>, partition: OutputPartition<In, Out>) -> Self {
        Self {
            connection,
            requests: Mutex::new(Vec::new()),
            partition,
        }
    }

    /// Records an envelope to send.
    pub fn fire_message(&self, message: Out) {
        self.requests.lock().push(OutputRequest::Send(message));
    }

    /// Records an observer registration.
    pub fn register_observer(&self, subscription: Box<dyn Subscription>, key: Option<&str>) {
        self.requests.lock().push(OutputRequest::Subscribe {
            subscription,
            key: key.map(str::to_owned),
        });
    }

    /// Records removal of the observer registered under `key`.
    pub fn dispose_observer(&self, key: &str) {
        self.requests
            .lock()
            .push(OutputRequest::Unsubscribe(key.to_owned()));
    }

    /// Records a request to close the connection.
    pub fn request_close(&self) {
        self.requests.lock().push(OutputRequest::Close);
    }

    /// Schedules another replay of this context on the partition that owns
    /// the connection. Blocks while that partition's queue is full.
    ///
    /// Used by observers that record effects after the handler returned.
    pub fn request_flush(self: &Arc<Self>) -> Result<(), SchedulerError> {
        self.partition.shared.record_flush();
        self.enqueue_delivery()
    }

    pub(crate) fn enqueue_delivery(self: &Arc<Self>) -> Result<(), SchedulerError> {
        let item = WorkItem::OutputDelivery {
            id: self.partition.shared.next_item_id(),
            context: Arc::clone(self),
        };
        enqueue_blocking(&self.partition.sender, item, &self.partition.shared)
    }

    /// Replays every recorded request against the connection, in order.
    ///
    /// The first failure stops the replay; the remaining requests of this
    /// batch are dropped. Requests recorded while the replay runs are kept
    /// for the next delivery.
    pub async fn perform_output_requests(&self) -> Result<(), ConnectionError> {
        let requests = std::mem::take(&mut *self.requests.lock());

        for request in requests {
            let result = match request {
                OutputRequest::Send(message) => self.connection.send_message(&message).await,
                OutputRequest::Subscribe { subscription, key } => {
                    self.connection.register_observer(subscription, key);
                    Ok(())
                }
                OutputRequest::Unsubscribe(key) => {
                    self.connection.dispose_observer(&key);
                    Ok(())
                }
                OutputRequest::Close => {
                    self.connection.close_connection().await;
                    Ok(())
                }
            };

            if let Err(error) = result {
                warn!(
                    connection_id = self.connection.id(),
                    error = %error,
                    "Output replay failed; dropping remaining requests"
                );
                return Err(error);
            }
        }

        Ok(())
    }

    /// Number of requests waiting for the next replay.
    pub fn pending_requests(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        self.connection.cancellation()
    }

    pub fn session(&self) -> &SessionItems {
        self.connection.session()
    }

    /// Output partition this context delivers through.
    pub fn partition_index(&self) -> usize {
        self.partition.index
    }
}
