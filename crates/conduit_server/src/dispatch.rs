//! Discriminator-based method dispatch.
//!
//! A [`MethodDispatchTable`] owns the application's handler object and an
//! immutable map from discriminator value to handler function, assembled
//! once at startup through a [`DispatchTableBuilder`]:
//!
//! ```rust,ignore
//! let table = DispatchTableBuilder::new(Lobby::default(), |envelope: &ClientEnvelope| envelope.route.clone())
//!     .route("ping".to_string(), Lobby::ping)
//!     .route("echo".to_string(), Lobby::echo)
//!     .build()?;
//! ```
//!
//! The table is driven exclusively by the scheduler's input worker, so
//! handlers get `&mut` access to their state without any locking.

use crate::deferred::DeferredConnectionContext;
use crate::error::{DispatchError, HandlerError};
use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, warn};

/// Result of routing one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The handler ran to completion
    Completed,
    /// The handler returned an error or panicked; the failure was logged
    HandlerFailed,
}

/// Something the scheduler's input worker can route envelopes into.
pub trait Dispatch<In, Out>: Send {
    /// Routes `envelope` to its handler.
    ///
    /// Fails only when no handler is registered for the envelope's
    /// discriminator. Handler failures are isolated and reported through
    /// [`DispatchOutcome::HandlerFailed`].
    fn dispatch(
        &mut self,
        context: &Arc<DeferredConnectionContext<In, Out>>,
        envelope: In,
    ) -> Result<DispatchOutcome, DispatchError>;

    /// Periodic server tick.
    fn tick(&mut self, _tick: u64) {}

    /// The handler state, for tasks that need direct access to it.
    fn state_mut(&mut self) -> &mut dyn Any;

    /// Number of registered routes.
    fn route_count(&self) -> usize;
}

type Route<H, In, Out> =
    Box<dyn Fn(&mut H, &Arc<DeferredConnectionContext<In, Out>>, In) -> Result<(), HandlerError> + Send>;

type Extractor<In, D> = Box<dyn Fn(&In) -> D + Send>;

type TickHook<H> = Box<dyn FnMut(&mut H, u64) + Send>;

/// Immutable discriminator to handler table.
pub struct MethodDispatchTable<H, In, Out, D> {
    handler: H,
    discriminator: Extractor<In, D>,
    routes: HashMap<D, Route<H, In, Out>>,
    on_tick: Option<TickHook<H>>,
}

impl<H, In, Out, D> MethodDispatchTable<H, In, Out, D>
where
    D: Eq + Hash + Debug,
{
    /// Whether a handler is registered for `discriminator`.
    pub fn has_route(&self, discriminator: &D) -> bool {
        self.routes.contains_key(discriminator)
    }

    /// Shared access to the handler object.
    pub fn handler(&self) -> &H {
        &self.handler
    }
}

impl<H, In, Out, D> Dispatch<In, Out> for MethodDispatchTable<H, In, Out, D>
where
    H: Send + 'static,
    In: Send + 'static,
    Out: Send + 'static,
    D: Eq + Hash + Debug + Send + 'static,
{
    fn dispatch(
        &mut self,
        context: &Arc<DeferredConnectionContext<In, Out>>,
        envelope: In,
    ) -> Result<DispatchOutcome, DispatchError> {
        let key = (self.discriminator)(&envelope);
        let Some(route) = self.routes.get(&key) else {
            return Err(DispatchError::MethodNotFound(format!("{key:?}")));
        };

        let handler = &mut self.handler;
        match catch_unwind(AssertUnwindSafe(|| route(handler, context, envelope))) {
            Ok(Ok(())) => Ok(DispatchOutcome::Completed),
            Ok(Err(e)) => {
                warn!(
                    connection_id = context.connection_id(),
                    discriminator = ?key,
                    error = %e,
                    "Handler failed"
                );
                Ok(DispatchOutcome::HandlerFailed)
            }
            Err(panic) => {
                error!(
                    connection_id = context.connection_id(),
                    discriminator = ?key,
                    panic = %panic_message(panic.as_ref()),
                    "Handler panicked"
                );
                Ok(DispatchOutcome::HandlerFailed)
            }
        }
    }

    fn tick(&mut self, tick: u64) {
        if let Some(on_tick) = self.on_tick.as_mut() {
            on_tick(&mut self.handler, tick);
        }
    }

    fn state_mut(&mut self) -> &mut dyn Any {
        &mut self.handler
    }

    fn route_count(&self) -> usize {
        self.routes.len()
    }
}

/// Assembles a [`MethodDispatchTable`]. Duplicate discriminators are
/// reported by [`build`](Self::build).
pub struct DispatchTableBuilder<H, In, Out, D> {
    handler: H,
    discriminator: Extractor<In, D>,
    routes: HashMap<D, Route<H, In, Out>>,
    duplicates: Vec<String>,
    on_tick: Option<TickHook<H>>,
}

impl<H, In, Out, D> DispatchTableBuilder<H, In, Out, D>
where
    H: Send + 'static,
    In: Send + 'static,
    Out: Send + 'static,
    D: Eq + Hash + Debug + Send + 'static,
{
    /// Starts a table for `handler`, routing on the value `discriminator`
    /// extracts from each envelope.
    pub fn new(handler: H, discriminator: impl Fn(&In) -> D + Send + 'static) -> Self {
        Self {
            handler,
            discriminator: Box::new(discriminator),
            routes: HashMap::new(),
            duplicates: Vec::new(),
            on_tick: None,
        }
    }

    /// Registers the handler function for one discriminator value.
    pub fn route<F>(mut self, discriminator: D, handler: F) -> Self
    where
        F: Fn(&mut H, &Arc<DeferredConnectionContext<In, Out>>, In) -> Result<(), HandlerError> + Send + 'static,
    {
        if self.routes.contains_key(&discriminator) {
            self.duplicates.push(format!("{discriminator:?}"));
        } else {
            self.routes.insert(discriminator, Box::new(handler));
        }
        self
    }

    /// Registers a hook run on every server tick.
    pub fn on_tick<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&mut H, u64) + Send + 'static,
    {
        self.on_tick = Some(Box::new(hook));
        self
    }

    pub fn build(self) -> Result<MethodDispatchTable<H, In, Out, D>, DispatchError> {
        if let Some(duplicate) = self.duplicates.into_iter().next() {
            return Err(DispatchError::DuplicateRoute(duplicate));
        }

        Ok(MethodDispatchTable {
            handler: self.handler,
            discriminator: self.discriminator,
            routes: self.routes,
            on_tick: self.on_tick,
        })
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        calls: Vec<u32>,
    }

    fn builder() -> DispatchTableBuilder<Counter, u32, u32, u32> {
        DispatchTableBuilder::new(Counter { calls: Vec::new() }, |envelope: &u32| *envelope)
    }

    #[test]
    fn test_duplicate_route_is_rejected() {
        let result = builder()
            .route(1, |_, _, _| Ok(()))
            .route(1, |_, _, _| Ok(()))
            .build();

        assert_eq!(result.err(), Some(DispatchError::DuplicateRoute("1".to_string())));
    }

    #[test]
    fn test_table_exposes_routes_and_state() {
        let mut table = builder()
            .route(1, |counter, _, envelope| {
                counter.calls.push(envelope);
                Ok(())
            })
            .route(2, |_, _, _| Err(HandlerError::failed("boom")))
            .on_tick(|counter, tick| counter.calls.push(tick as u32 * 100))
            .build()
            .unwrap();

        assert_eq!(table.route_count(), 2);
        assert!(table.has_route(&1));
        assert!(!table.has_route(&3));

        table.tick(4);
        let counter = table.state_mut().downcast_mut::<Counter>().unwrap();
        assert_eq!(counter.calls, vec![400]);
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload = catch_unwind(|| panic!("handler exploded")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "handler exploded");

        let payload = catch_unwind(|| std::panic::panic_any(7_u8)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
