//! Two-tier queue dispatcher.
//!
//! ```text
//!   receive loops ──► input queue (bounded) ──► input worker ──► dispatch table
//!   submit_task   ──┘                                │
//!                                                    ▼ connection_id mod N
//!                          output queue 0 .. N-1 (bounded) ──► output worker i
//! ```
//!
//! A single input worker thread executes every handler and arbitrary task,
//! so business logic observes one total order. The resulting effect
//! buffers fan out to N output workers; a connection always maps to the
//! same partition, so its effects are applied in the order they were
//! produced while different connections proceed in parallel.
//!
//! Both tiers use dedicated OS threads with blocking, timed dequeues. Output
//! workers drive the async transport through the tokio runtime handle the
//! dispatcher was created with.

use crate::connection::{Connection, ConnectionId};
use crate::deferred::{DeferredConnectionContext, OutputPartition};
use crate::dispatch::{panic_message, Dispatch, DispatchOutcome};
use crate::error::{DispatchError, SchedulerError};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, error, info, warn, Instrument};

/// Callback run on the input worker with access to the dispatch table.
pub type TaskCallback<In, Out> = Box<dyn FnOnce(&mut dyn Dispatch<In, Out>) + Send>;

/// A unit of work flowing through the scheduler's queues. Ids increase
/// monotonically and are only used for tracing.
pub enum WorkItem<In, Out> {
    /// A decoded envelope and the fresh context its handler records into
    IncomingMessage {
        id: u64,
        context: Arc<DeferredConnectionContext<In, Out>>,
        envelope: In,
    },
    /// A context whose recorded effects should be replayed
    OutputDelivery {
        id: u64,
        context: Arc<DeferredConnectionContext<In, Out>>,
    },
    /// Work that must run in the same total order as message handlers
    ArbitraryTask { id: u64, callback: TaskCallback<In, Out> },
}

impl<In, Out> WorkItem<In, Out> {
    pub fn id(&self) -> u64 {
        match self {
            WorkItem::IncomingMessage { id, .. }
            | WorkItem::OutputDelivery { id, .. }
            | WorkItem::ArbitraryTask { id, .. } => *id,
        }
    }
}

/// Tunables for the dispatcher.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Capacity of the global input queue
    pub input_queue_capacity: usize,
    /// Capacity of each output partition queue
    pub output_queue_capacity: usize,
    /// Number of output partitions and worker threads
    pub output_workers: usize,
    /// How long a worker blocks on an empty queue before rechecking cancellation
    pub dequeue_timeout: Duration,
    /// Upper bound for replaying one effects buffer
    pub delivery_timeout: Duration,
    /// Upper bound for joining each worker on shutdown
    pub shutdown_timeout: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            input_queue_capacity: 500,
            output_queue_capacity: 500,
            output_workers: num_cpus::get().max(1),
            dequeue_timeout: Duration::from_millis(100),
            delivery_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Snapshot of dispatcher counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Envelopes routed to a handler
    pub dispatched: u64,
    /// Arbitrary tasks executed
    pub tasks_run: u64,
    /// Handlers that returned an error or panicked
    pub handler_failures: u64,
    /// Envelopes with no registered handler
    pub unknown_routes: u64,
    /// Effects buffers replayed successfully
    pub deliveries: u64,
    /// Effects buffers whose replay failed
    pub delivery_failures: u64,
    /// Effects buffers whose replay exceeded the delivery timeout
    pub delivery_timeouts: u64,
    /// Flush requests from observers
    pub flushes: u64,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    tasks_run: AtomicU64,
    handler_failures: AtomicU64,
    unknown_routes: AtomicU64,
    deliveries: AtomicU64,
    delivery_failures: AtomicU64,
    delivery_timeouts: AtomicU64,
    flushes: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// State shared by the dispatcher, its workers and every context.
pub(crate) struct SchedulerShared {
    cancellation: CancellationToken,
    next_item_id: AtomicU64,
    counters: Counters,
    poll_interval: Duration,
}

impl SchedulerShared {
    pub(crate) fn next_item_id(&self) -> u64 {
        self.next_item_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn record_flush(&self) {
        bump(&self.counters.flushes);
    }
}

/// Blocking enqueue that gives up once the dispatcher is cancelled or the
/// receiving worker is gone.
pub(crate) fn enqueue_blocking<T>(
    sender: &Sender<T>,
    mut item: T,
    shared: &SchedulerShared,
) -> Result<(), SchedulerError> {
    loop {
        if shared.cancellation.is_cancelled() {
            return Err(SchedulerError::ShutDown);
        }
        match sender.send_timeout(item, shared.poll_interval) {
            Ok(()) => return Ok(()),
            Err(SendTimeoutError::Timeout(returned)) => item = returned,
            Err(SendTimeoutError::Disconnected(_)) => return Err(SchedulerError::ShutDown),
        }
    }
}

struct Workers {
    input: JoinHandle<()>,
    outputs: Vec<JoinHandle<()>>,
}

/// The concurrency core: one input worker, N output partitions.
pub struct QueueDispatcher<In, Out> {
    input: Sender<WorkItem<In, Out>>,
    partitions: Vec<Sender<WorkItem<In, Out>>>,
    shared: Arc<SchedulerShared>,
    settings: SchedulerSettings,
    runtime: Handle,
    workers: Mutex<Option<Workers>>,
}

impl<In, Out> QueueDispatcher<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    /// Starts the worker threads on the current tokio runtime.
    pub fn new(dispatch: impl Dispatch<In, Out> + 'static, settings: SchedulerSettings) -> Result<Arc<Self>, SchedulerError> {
        let runtime = Handle::try_current().map_err(|e| SchedulerError::Runtime(e.to_string()))?;
        Self::with_runtime(dispatch, settings, runtime)
    }

    /// Starts the worker threads, driving async output through `runtime`.
    pub fn with_runtime(
        dispatch: impl Dispatch<In, Out> + 'static,
        mut settings: SchedulerSettings,
        runtime: Handle,
    ) -> Result<Arc<Self>, SchedulerError> {
        settings.output_workers = settings.output_workers.max(1);
        settings.input_queue_capacity = settings.input_queue_capacity.max(1);
        settings.output_queue_capacity = settings.output_queue_capacity.max(1);

        let shared = Arc::new(SchedulerShared {
            cancellation: CancellationToken::new(),
            next_item_id: AtomicU64::new(1),
            counters: Counters::default(),
            poll_interval: settings.dequeue_timeout,
        });

        let mut partitions = Vec::with_capacity(settings.output_workers);
        let mut outputs = Vec::with_capacity(settings.output_workers);
        for index in 0..settings.output_workers {
            let (sender, receiver) = channel::bounded(settings.output_queue_capacity);
            partitions.push(sender);

            let worker = OutputWorker {
                index,
                queue: receiver,
                shared: Arc::clone(&shared),
                runtime: runtime.clone(),
                dequeue_timeout: settings.dequeue_timeout,
                delivery_timeout: settings.delivery_timeout,
            };
            let spawned = std::thread::Builder::new()
                .name(format!("conduit-output-{index}"))
                .spawn(move || worker.run());
            match spawned {
                Ok(handle) => outputs.push(handle),
                Err(e) => {
                    shared.cancellation.cancel();
                    return Err(SchedulerError::Spawn(e.to_string()));
                }
            }
        }

        let (input, receiver) = channel::bounded(settings.input_queue_capacity);
        let worker = InputWorker {
            queue: receiver,
            dispatch: Box::new(dispatch),
            shared: Arc::clone(&shared),
            dequeue_timeout: settings.dequeue_timeout,
        };
        let input_handle = std::thread::Builder::new()
            .name("conduit-input".to_string())
            .spawn(move || worker.run())
            .map_err(|e| {
                shared.cancellation.cancel();
                SchedulerError::Spawn(e.to_string())
            })?;

        info!(
            "🧵 Queue dispatcher started with {} output partition(s), input capacity {}",
            settings.output_workers, settings.input_queue_capacity
        );

        Ok(Arc::new(Self {
            input,
            partitions,
            shared,
            settings,
            runtime,
            workers: Mutex::new(Some(Workers {
                input: input_handle,
                outputs,
            })),
        }))
    }

    /// Output partition owning `connection_id`.
    pub fn partition_for(&self, connection_id: ConnectionId) -> usize {
        (connection_id % self.partitions.len() as u64) as usize
    }

    /// Number of output partitions.
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// Creates a fresh effects buffer for `connection`, bound to the
    /// partition that owns it.
    pub fn create_context(&self, connection: &Arc<Connection<In, Out>>) -> Arc<DeferredConnectionContext<In, Out>> {
        let index = self.partition_for(connection.id());
        Arc::new(DeferredConnectionContext::new(
            Arc::clone(connection),
            OutputPartition {
                index,
                sender: self.partitions[index].clone(),
                shared: Arc::clone(&self.shared),
            },
        ))
    }

    fn incoming_item(&self, connection: &Arc<Connection<In, Out>>, envelope: In) -> WorkItem<In, Out> {
        WorkItem::IncomingMessage {
            id: self.shared.next_item_id(),
            context: self.create_context(connection),
            envelope,
        }
    }

    /// Enqueues an envelope for dispatch, blocking while the input queue is
    /// full.
    pub fn dispatch_operation(&self, connection: &Arc<Connection<In, Out>>, envelope: In) -> Result<(), SchedulerError> {
        let item = self.incoming_item(connection, envelope);
        enqueue_blocking(&self.input, item, &self.shared)
    }

    /// Async variant of [`dispatch_operation`](Self::dispatch_operation).
    /// A full queue is waited out on the blocking pool so the caller's
    /// runtime thread stays free.
    pub async fn dispatch_operation_async(
        &self,
        connection: &Arc<Connection<In, Out>>,
        envelope: In,
    ) -> Result<(), SchedulerError> {
        let item = self.incoming_item(connection, envelope);
        self.enqueue_async(item).await
    }

    /// Enqueues a callback that runs on the input worker, in total order
    /// with message handlers.
    pub fn submit_task<F>(&self, task: F) -> Result<(), SchedulerError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit_dispatch_task(move |_| task())
    }

    /// Async variant of [`submit_task`](Self::submit_task).
    pub async fn submit_task_async<F>(&self, task: F) -> Result<(), SchedulerError>
    where
        F: FnOnce() + Send + 'static,
    {
        let item = self.task_item(move |_| task());
        self.enqueue_async(item).await
    }

    /// Enqueues a callback that receives the dispatch table itself.
    pub fn submit_dispatch_task<F>(&self, task: F) -> Result<(), SchedulerError>
    where
        F: FnOnce(&mut dyn Dispatch<In, Out>) + Send + 'static,
    {
        let item = self.task_item(task);
        enqueue_blocking(&self.input, item, &self.shared)
    }

    fn task_item<F>(&self, task: F) -> WorkItem<In, Out>
    where
        F: FnOnce(&mut dyn Dispatch<In, Out>) + Send + 'static,
    {
        WorkItem::ArbitraryTask {
            id: self.shared.next_item_id(),
            callback: Box::new(task),
        }
    }

    /// Enqueues a callback that receives the handler object of type `H`.
    /// Logs and skips the task if the table holds a different handler type.
    pub fn submit_handler_task<H, F>(&self, task: F) -> Result<(), SchedulerError>
    where
        H: 'static,
        F: FnOnce(&mut H) + Send + 'static,
    {
        self.submit_dispatch_task(move |dispatch| match dispatch.state_mut().downcast_mut::<H>() {
            Some(handler) => task(handler),
            None => warn!(
                expected = std::any::type_name::<H>(),
                "Handler task skipped: handler type mismatch"
            ),
        })
    }

    /// Delivers a server tick to the dispatch table through the input queue.
    pub fn submit_tick(&self, tick: u64) -> Result<(), SchedulerError> {
        self.submit_dispatch_task(move |dispatch| dispatch.tick(tick))
    }

    /// Async variant of [`submit_tick`](Self::submit_tick).
    pub async fn submit_tick_async(&self, tick: u64) -> Result<(), SchedulerError> {
        let item = self.task_item(move |dispatch| dispatch.tick(tick));
        self.enqueue_async(item).await
    }

    async fn enqueue_async(&self, item: WorkItem<In, Out>) -> Result<(), SchedulerError> {
        if self.shared.cancellation.is_cancelled() {
            return Err(SchedulerError::ShutDown);
        }
        match self.input.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Disconnected(_)) => Err(SchedulerError::ShutDown),
            Err(TrySendError::Full(item)) => {
                debug!("Input queue full; waiting for capacity");
                let input = self.input.clone();
                let shared = Arc::clone(&self.shared);
                tokio::task::spawn_blocking(move || enqueue_blocking(&input, item, &shared))
                    .await
                    .map_err(|e| SchedulerError::Runtime(e.to_string()))?
            }
        }
    }

    /// Items currently waiting in the input queue.
    pub fn pending_inputs(&self) -> usize {
        self.input.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.cancellation.is_cancelled()
    }

    pub fn stats(&self) -> SchedulerStats {
        let c = &self.shared.counters;
        SchedulerStats {
            dispatched: c.dispatched.load(Ordering::Relaxed),
            tasks_run: c.tasks_run.load(Ordering::Relaxed),
            handler_failures: c.handler_failures.load(Ordering::Relaxed),
            unknown_routes: c.unknown_routes.load(Ordering::Relaxed),
            deliveries: c.deliveries.load(Ordering::Relaxed),
            delivery_failures: c.delivery_failures.load(Ordering::Relaxed),
            delivery_timeouts: c.delivery_timeouts.load(Ordering::Relaxed),
            flushes: c.flushes.load(Ordering::Relaxed),
        }
    }

    /// Stops both worker tiers. Idempotent and bounded: output workers are
    /// joined first, then the input worker, each for at most the configured
    /// shutdown timeout. Blocks the calling thread.
    pub fn shutdown(&self) {
        let Some(workers) = self.workers.lock().take() else {
            return;
        };

        info!("🛑 Shutting down queue dispatcher");
        workers.stop(&self.shared.cancellation, self.settings.shutdown_timeout);
        info!("✅ Queue dispatcher stopped");
    }
}

impl<In, Out> Drop for QueueDispatcher<In, Out> {
    fn drop(&mut self) {
        if let Some(workers) = self.workers.get_mut().take() {
            workers.stop(&self.shared.cancellation, self.settings.shutdown_timeout);
        }
    }
}

impl Workers {
    /// Cancels both tiers, then joins the outputs before the input worker.
    fn stop(self, cancellation: &CancellationToken, timeout: Duration) {
        cancellation.cancel();
        for (index, handle) in self.outputs.into_iter().enumerate() {
            join_with_timeout(handle, timeout, &format!("output-{index}"));
        }
        join_with_timeout(self.input, timeout, "input");
    }
}

fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration, worker: &str) {
    // A worker can end up releasing the last dispatcher handle itself
    if handle.thread().id() == std::thread::current().id() {
        return;
    }

    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!(worker, ?timeout, "Worker did not stop within the shutdown timeout");
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    if let Err(panic) = handle.join() {
        error!(worker, panic = %panic_message(panic.as_ref()), "Worker thread panicked");
    }
}

struct InputWorker<In, Out> {
    queue: Receiver<WorkItem<In, Out>>,
    dispatch: Box<dyn Dispatch<In, Out>>,
    shared: Arc<SchedulerShared>,
    dequeue_timeout: Duration,
}

impl<In, Out> InputWorker<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    fn run(mut self) {
        debug!("Input worker started");
        while !self.shared.cancellation.is_cancelled() {
            let item = match self.queue.recv_timeout(self.dequeue_timeout) {
                Ok(item) => item,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let id = item.id();
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| self.process(item))) {
                error!(
                    work_item_id = id,
                    panic = %panic_message(panic.as_ref()),
                    "Work item panicked"
                );
            }
        }
        debug!(routes = self.dispatch.route_count(), "Input worker stopped; releasing dispatch table");
    }

    fn process(&mut self, item: WorkItem<In, Out>) {
        match item {
            WorkItem::IncomingMessage { id, context, envelope } => {
                let span = debug_span!("dispatch", work_item_id = id, connection_id = context.connection_id());
                let _entered = span.enter();

                match self.dispatch.dispatch(&context, envelope) {
                    Ok(outcome) => {
                        bump(&self.shared.counters.dispatched);
                        if outcome == DispatchOutcome::HandlerFailed {
                            bump(&self.shared.counters.handler_failures);
                        }
                        if let Err(e) = context.enqueue_delivery() {
                            debug!(error = %e, "Effects dropped; dispatcher is shutting down");
                        }
                    }
                    Err(DispatchError::MethodNotFound(discriminator)) => {
                        bump(&self.shared.counters.unknown_routes);
                        warn!(%discriminator, "No handler registered for discriminator");
                    }
                    Err(e) => {
                        error!(error = %e, "Dispatch failed");
                    }
                }
            }
            WorkItem::ArbitraryTask { id, callback } => {
                let span = debug_span!("task", work_item_id = id);
                let _entered = span.enter();
                callback(self.dispatch.as_mut());
                bump(&self.shared.counters.tasks_run);
            }
            WorkItem::OutputDelivery { id, .. } => {
                warn!(work_item_id = id, "Output delivery on the input queue; ignoring");
            }
        }
    }
}

struct OutputWorker<In, Out> {
    index: usize,
    queue: Receiver<WorkItem<In, Out>>,
    shared: Arc<SchedulerShared>,
    runtime: Handle,
    dequeue_timeout: Duration,
    delivery_timeout: Duration,
}

impl<In, Out> OutputWorker<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    fn run(self) {
        debug!(partition = self.index, "Output worker started");
        while !self.shared.cancellation.is_cancelled() {
            match self.queue.recv_timeout(self.dequeue_timeout) {
                Ok(WorkItem::OutputDelivery { id, context }) => self.deliver(id, context),
                Ok(other) => {
                    warn!(partition = self.index, work_item_id = other.id(), "Unexpected work item on output queue");
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!(partition = self.index, "Output worker stopped");
    }

    fn deliver(&self, id: u64, context: Arc<DeferredConnectionContext<In, Out>>) {
        let counters = &self.shared.counters;
        let span = debug_span!(
            "output_delivery",
            work_item_id = id,
            connection_id = context.connection_id(),
            partition = self.index
        );
        let delivery_timeout = self.delivery_timeout;

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.runtime.block_on(
                async {
                    tokio::time::timeout(delivery_timeout, context.perform_output_requests()).await
                }
                .instrument(span),
            )
        }));

        match outcome {
            Ok(Ok(Ok(()))) => bump(&counters.deliveries),
            Ok(Ok(Err(e))) => {
                bump(&counters.delivery_failures);
                warn!(work_item_id = id, connection_id = context.connection_id(), error = %e, "Output delivery failed");
            }
            Ok(Err(_)) => {
                bump(&counters.delivery_timeouts);
                warn!(
                    work_item_id = id,
                    connection_id = context.connection_id(),
                    timeout = ?delivery_timeout,
                    "Output delivery timed out"
                );
            }
            Err(panic) => {
                bump(&counters.delivery_failures);
                error!(work_item_id = id, panic = %panic_message(panic.as_ref()), "Output delivery panicked");
            }
        }
    }
}
