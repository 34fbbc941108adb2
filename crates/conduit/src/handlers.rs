//! Lobby handlers served by the binary.
//!
//! Clients send `{"route": "...", "data": ...}` envelopes. Routes:
//!
//! * `ping` - replies `pong` with the same data
//! * `echo` - replies `echo` with the same data
//! * `nickname.set` / `nickname.get` - per-connection session state
//! * `ticks.subscribe` / `ticks.unsubscribe` - receive a `tick` message on
//!   every server tick
//! * `close` - replies `bye` and closes the connection

use conduit_server::{
    ConnectionId, DeferredConnectionContext, DispatchError, DispatchTableBuilder, HandlerError,
    MethodDispatchTable,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Observer key of a connection's tick subscription.
pub const TICKS_OBSERVER: &str = "ticks";

/// Incoming envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEnvelope {
    pub route: String,
    #[serde(default)]
    pub data: Value,
}

/// Outgoing envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEnvelope {
    pub route: String,
    pub data: Value,
}

impl ServerEnvelope {
    pub fn new(route: impl Into<String>, data: Value) -> Self {
        Self {
            route: route.into(),
            data,
        }
    }
}

pub type LobbyContext = DeferredConnectionContext<ClientEnvelope, ServerEnvelope>;
pub type LobbyTable = MethodDispatchTable<Lobby, ClientEnvelope, ServerEnvelope, String>;

struct Nickname(String);

struct TickSubscriber {
    context: Arc<LobbyContext>,
    token: CancellationToken,
}

/// Handler state. Only ever touched by the input worker.
#[derive(Default)]
pub struct Lobby {
    subscribers: HashMap<ConnectionId, TickSubscriber>,
    ticks_published: u64,
}

impl Lobby {
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn ticks_published(&self) -> u64 {
        self.ticks_published
    }

    fn ping(&mut self, ctx: &Arc<LobbyContext>, envelope: ClientEnvelope) -> Result<(), HandlerError> {
        ctx.fire_message(ServerEnvelope::new("pong", envelope.data));
        Ok(())
    }

    fn echo(&mut self, ctx: &Arc<LobbyContext>, envelope: ClientEnvelope) -> Result<(), HandlerError> {
        ctx.fire_message(ServerEnvelope::new("echo", envelope.data));
        Ok(())
    }

    fn set_nickname(&mut self, ctx: &Arc<LobbyContext>, envelope: ClientEnvelope) -> Result<(), HandlerError> {
        let name = envelope
            .data
            .as_str()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| HandlerError::InvalidPayload("nickname must be a non-empty string".to_string()))?;

        ctx.session().insert(Nickname(name.to_string()));
        ctx.fire_message(ServerEnvelope::new("nickname", json!(name)));
        Ok(())
    }

    fn get_nickname(&mut self, ctx: &Arc<LobbyContext>, _envelope: ClientEnvelope) -> Result<(), HandlerError> {
        let name = ctx
            .session()
            .get::<Nickname>()
            .map(|nickname| Value::String(nickname.0.clone()))
            .unwrap_or(Value::Null);
        ctx.fire_message(ServerEnvelope::new("nickname", name));
        Ok(())
    }

    fn subscribe_ticks(&mut self, ctx: &Arc<LobbyContext>, _envelope: ClientEnvelope) -> Result<(), HandlerError> {
        self.prune_subscribers();
        let id = ctx.connection_id();
        if !self.subscribers.contains_key(&id) {
            let token = CancellationToken::new();
            ctx.register_observer(Box::new(token.clone()), Some(TICKS_OBSERVER));
            self.subscribers.insert(
                id,
                TickSubscriber {
                    context: Arc::clone(ctx),
                    token,
                },
            );
            debug!(connection_id = id, "Subscribed to ticks");
        }
        ctx.fire_message(ServerEnvelope::new("ticks.subscribed", Value::Null));
        Ok(())
    }

    fn unsubscribe_ticks(&mut self, ctx: &Arc<LobbyContext>, _envelope: ClientEnvelope) -> Result<(), HandlerError> {
        self.prune_subscribers();
        if self.subscribers.remove(&ctx.connection_id()).is_some() {
            ctx.dispose_observer(TICKS_OBSERVER);
        }
        ctx.fire_message(ServerEnvelope::new("ticks.unsubscribed", Value::Null));
        Ok(())
    }

    fn close(&mut self, ctx: &Arc<LobbyContext>, _envelope: ClientEnvelope) -> Result<(), HandlerError> {
        ctx.fire_message(ServerEnvelope::new("bye", Value::Null));
        ctx.request_close();
        Ok(())
    }

    /// Drops subscriptions disposed by connection teardown, releasing
    /// their connection contexts.
    fn prune_subscribers(&mut self) {
        self.subscribers
            .retain(|_, subscriber| !subscriber.token.is_cancelled() && subscriber.context.is_open());
    }

    /// Pushes a `tick` message to every live subscriber.
    fn publish_tick(&mut self, tick: u64) {
        self.prune_subscribers();

        for (id, subscriber) in &self.subscribers {
            subscriber
                .context
                .fire_message(ServerEnvelope::new("tick", json!({ "tick": tick })));
            if let Err(e) = subscriber.context.request_flush() {
                warn!(connection_id = id, error = %e, "Tick flush rejected");
            }
        }
        self.ticks_published += 1;
    }
}

/// Builds the lobby's dispatch table.
pub fn build_dispatch_table() -> Result<LobbyTable, DispatchError> {
    DispatchTableBuilder::new(Lobby::default(), |envelope: &ClientEnvelope| envelope.route.clone())
        .route("ping".to_string(), Lobby::ping)
        .route("echo".to_string(), Lobby::echo)
        .route("nickname.set".to_string(), Lobby::set_nickname)
        .route("nickname.get".to_string(), Lobby::get_nickname)
        .route("ticks.subscribe".to_string(), Lobby::subscribe_ticks)
        .route("ticks.unsubscribe".to_string(), Lobby::unsubscribe_ticks)
        .route("close".to_string(), Lobby::close)
        .on_tick(Lobby::publish_tick)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_server::transport::memory::{self, MemoryPeer, SinkEvent};
    use conduit_server::{
        AcceptedConnection, CloseCode, ConnectionRegistry, ConnectionSettings, JsonSerializer, QueueDispatcher,
        SchedulerSettings, WireSerializer,
    };
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    struct Lobbyist {
        scheduler: Arc<QueueDispatcher<ClientEnvelope, ServerEnvelope>>,
        registry: Arc<ConnectionRegistry<ClientEnvelope, ServerEnvelope>>,
        host: CancellationToken,
    }

    impl Lobbyist {
        fn new() -> Self {
            let settings = SchedulerSettings {
                output_workers: 2,
                dequeue_timeout: Duration::from_millis(10),
                ..SchedulerSettings::default()
            };
            let scheduler = QueueDispatcher::new(build_dispatch_table().unwrap(), settings).unwrap();
            let serializer: Arc<dyn WireSerializer<ClientEnvelope, ServerEnvelope>> = Arc::new(JsonSerializer);
            let connection = ConnectionSettings {
                close_timeout: Duration::from_millis(250),
                ..ConnectionSettings::default()
            };
            let registry = ConnectionRegistry::new(serializer, Arc::clone(&scheduler), connection);
            Self {
                scheduler,
                registry,
                host: CancellationToken::new(),
            }
        }

        fn connect(&self) -> (AcceptedConnection<ClientEnvelope, ServerEnvelope>, MemoryPeer) {
            let (transport, peer) = memory::pair();
            let accepted = self.registry.accept_socket(transport, &self.host).unwrap();
            (accepted, peer)
        }

        /// Runs on the input worker, so it observes every envelope
        /// dispatched before it.
        async fn subscriber_count(&self) -> usize {
            let (tx, rx) = tokio::sync::oneshot::channel();
            let scheduler = Arc::clone(&self.scheduler);
            tokio::task::spawn_blocking(move || {
                scheduler.submit_handler_task::<Lobby, _>(move |lobby| {
                    let _ = tx.send(lobby.subscriber_count());
                })
            })
            .await
            .unwrap()
            .unwrap();
            rx.await.unwrap()
        }
    }

    fn send(peer: &MemoryPeer, route: &str, data: Value) {
        let bytes = serde_json::to_vec(&json!({ "route": route, "data": data })).unwrap();
        assert!(peer.send_message(bytes));
    }

    async fn reply(peer: &mut MemoryPeer) -> ServerEnvelope {
        let bytes = peer.next_message(WAIT).await.expect("reply within timeout");
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_table_has_every_route() {
        let table = build_dispatch_table().unwrap();
        for route in [
            "ping",
            "echo",
            "nickname.set",
            "nickname.get",
            "ticks.subscribe",
            "ticks.unsubscribe",
            "close",
        ] {
            assert!(table.has_route(&route.to_string()), "missing route {route}");
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ping_and_echo() {
        let lobby = Lobbyist::new();
        let (_accepted, mut peer) = lobby.connect();

        send(&peer, "ping", json!(7));
        send(&peer, "echo", json!({ "text": "hello" }));

        assert_eq!(reply(&mut peer).await, ServerEnvelope::new("pong", json!(7)));
        assert_eq!(reply(&mut peer).await, ServerEnvelope::new("echo", json!({ "text": "hello" })));

        lobby.registry.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_nickname_lives_in_session() {
        let lobby = Lobbyist::new();
        let (_first, mut first) = lobby.connect();
        let (_second, mut second) = lobby.connect();

        send(&first, "nickname.get", Value::Null);
        assert_eq!(reply(&mut first).await, ServerEnvelope::new("nickname", Value::Null));

        send(&first, "nickname.set", json!("  ada "));
        assert_eq!(reply(&mut first).await, ServerEnvelope::new("nickname", json!("ada")));

        send(&first, "nickname.get", Value::Null);
        assert_eq!(reply(&mut first).await, ServerEnvelope::new("nickname", json!("ada")));

        send(&second, "nickname.get", Value::Null);
        assert_eq!(reply(&mut second).await, ServerEnvelope::new("nickname", Value::Null));

        lobby.registry.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_invalid_nickname_fails_without_reply() {
        let lobby = Lobbyist::new();
        let (_accepted, mut peer) = lobby.connect();

        send(&peer, "nickname.set", json!(42));
        send(&peer, "ping", json!("still here"));

        assert_eq!(reply(&mut peer).await, ServerEnvelope::new("pong", json!("still here")));
        assert_eq!(lobby.scheduler.stats().handler_failures, 1);

        lobby.registry.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unknown_route_is_skipped() {
        let lobby = Lobbyist::new();
        let (_accepted, mut peer) = lobby.connect();

        send(&peer, "teleport", Value::Null);
        send(&peer, "ping", Value::Null);

        assert_eq!(reply(&mut peer).await, ServerEnvelope::new("pong", Value::Null));
        assert_eq!(lobby.scheduler.stats().unknown_routes, 1);

        lobby.registry.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ticks_reach_subscribers_only() {
        let lobby = Lobbyist::new();
        let (_subscribed, mut subscriber) = lobby.connect();
        let (_idle, mut idle) = lobby.connect();

        send(&subscriber, "ticks.subscribe", Value::Null);
        assert_eq!(reply(&mut subscriber).await, ServerEnvelope::new("ticks.subscribed", Value::Null));
        assert_eq!(lobby.subscriber_count().await, 1);

        lobby.scheduler.submit_tick_async(1).await.unwrap();
        lobby.scheduler.submit_tick_async(2).await.unwrap();
        assert_eq!(reply(&mut subscriber).await, ServerEnvelope::new("tick", json!({ "tick": 1 })));
        assert_eq!(reply(&mut subscriber).await, ServerEnvelope::new("tick", json!({ "tick": 2 })));

        send(&subscriber, "ticks.unsubscribe", Value::Null);
        assert_eq!(reply(&mut subscriber).await, ServerEnvelope::new("ticks.unsubscribed", Value::Null));
        assert_eq!(lobby.subscriber_count().await, 0);

        lobby.scheduler.submit_tick_async(3).await.unwrap();
        send(&subscriber, "ping", Value::Null);
        assert_eq!(reply(&mut subscriber).await, ServerEnvelope::new("pong", Value::Null));

        assert!(idle.next_message(Duration::from_millis(100)).await.is_none());
        lobby.registry.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_closed_subscriber_is_pruned() {
        let lobby = Lobbyist::new();
        let (accepted, mut peer) = lobby.connect();

        send(&peer, "ticks.subscribe", Value::Null);
        assert_eq!(reply(&mut peer).await, ServerEnvelope::new("ticks.subscribed", Value::Null));

        peer.send_close();
        tokio::time::timeout(WAIT, accepted.task).await.unwrap().unwrap();
        assert_eq!(accepted.connection.observer_count(), 0);

        lobby.scheduler.submit_tick_async(1).await.unwrap();
        assert_eq!(lobby.subscriber_count().await, 0);

        lobby.registry.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_closed_subscriber_is_pruned_without_ticks() {
        let lobby = Lobbyist::new();
        let (closed, mut closed_peer) = lobby.connect();
        let (_open, mut open_peer) = lobby.connect();

        send(&closed_peer, "ticks.subscribe", Value::Null);
        assert_eq!(reply(&mut closed_peer).await, ServerEnvelope::new("ticks.subscribed", Value::Null));
        closed_peer.send_close();
        tokio::time::timeout(WAIT, closed.task).await.unwrap().unwrap();
        let weak = Arc::downgrade(&closed.connection);
        drop(closed.connection);

        send(&open_peer, "ticks.subscribe", Value::Null);
        assert_eq!(reply(&mut open_peer).await, ServerEnvelope::new("ticks.subscribed", Value::Null));
        assert_eq!(lobby.subscriber_count().await, 1);

        send(&open_peer, "ticks.unsubscribe", Value::Null);
        assert_eq!(reply(&mut open_peer).await, ServerEnvelope::new("ticks.unsubscribed", Value::Null));
        assert_eq!(lobby.subscriber_count().await, 0);
        assert_eq!(lobby.scheduler.stats().flushes, 0);
        assert!(weak.upgrade().is_none(), "pruned subscriber still holds its connection");

        lobby.registry.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_route_says_bye() {
        let lobby = Lobbyist::new();
        let (accepted, mut peer) = lobby.connect();

        send(&peer, "close", Value::Null);
        assert_eq!(reply(&mut peer).await, ServerEnvelope::new("bye", Value::Null));

        let mut events = Vec::new();
        while let Some(event) = peer.next_event(WAIT).await {
            let released = event == SinkEvent::Shutdown;
            events.push(event);
            if released {
                break;
            }
        }
        assert_eq!(events, vec![SinkEvent::Close(CloseCode::Normal), SinkEvent::Shutdown]);

        tokio::time::timeout(WAIT, accepted.task).await.unwrap().unwrap();
        assert!(!accepted.connection.is_open());

        lobby.registry.shutdown().await;
    }
}
