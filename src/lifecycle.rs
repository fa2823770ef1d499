use crate::broker_client::BrokerClient;
use crate::metrics::Metrics;
use crate::protocol::{parse_request, ClientRequest, ServerMessage};
use crate::registry::{
    ClientTx, ConnectionId, SubscribeOutcome, SubscriptionRegistry, UnsubscribeOutcome,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

/// The one lock guarding subscription state, shared by the lifecycle manager and the router
pub type SharedRegistry = Arc<Mutex<SubscriptionRegistry>>;

/// Applies client connect/subscribe/disconnect events to the registry and keeps the
/// broker's subscriptions in step with topic interest.
///
/// Broker requests are enqueued while the registry lock is held so that the order of
/// subscribe/unsubscribe calls reaching the broker matches the order of the interest
/// transitions that caused them.
pub struct ConnectionLifecycleManager {
    registry: SharedRegistry,
    broker: Arc<dyn BrokerClient>,
    metrics: Arc<Metrics>,
    unsubscribe_when_idle: bool,
}

impl ConnectionLifecycleManager {
    pub fn new(
        registry: SharedRegistry,
        broker: Arc<dyn BrokerClient>,
        metrics: Arc<Metrics>,
        unsubscribe_when_idle: bool,
    ) -> Self {
        Self {
            registry,
            broker,
            metrics,
            unsubscribe_when_idle,
        }
    }

    /// Register a freshly opened connection and return its session
    pub fn open(self: &Arc<Self>, tx: ClientTx) -> ClientSession {
        let id = ConnectionId::next();
        {
            let mut registry = self.registry.lock();
            registry.on_connect(id, tx.clone());
            self.update_gauges(&registry);
        }
        info!("New WebSocket client {} connected", id);

        ClientSession {
            id,
            state: SessionState::Open,
            tx,
            manager: Arc::clone(self),
        }
    }

    /// Re-issue a broker subscription for every topic that still has subscribers.
    ///
    /// Returns the number of topics requested.
    pub fn resubscribe_interested(&self) -> usize {
        let registry = self.registry.lock();
        let mut requested = 0;
        for topic in registry.interested_topics() {
            match self.broker.subscribe(topic) {
                Ok(()) => requested += 1,
                Err(e) => warn!("Failed to re-subscribe to '{}': {}", topic, e),
            }
        }
        requested
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.registry.lock().subscriber_count(topic)
    }

    pub fn connection_count(&self) -> usize {
        self.registry.lock().connection_count()
    }

    fn subscribe(&self, id: ConnectionId, topic: &str) -> SubscribeOutcome {
        let mut registry = self.registry.lock();
        let outcome = registry.subscribe(id, topic);
        if outcome == SubscribeOutcome::FirstInterest {
            match self.broker.subscribe(topic) {
                Ok(()) => info!("📝 Subscribed to '{}' on broker", topic),
                // Restored by resubscribe_interested on the next ConnAck
                Err(e) => warn!("Failed to subscribe to '{}' on broker: {}", topic, e),
            }
        }
        self.update_gauges(&registry);
        outcome
    }

    fn unsubscribe(&self, id: ConnectionId, topic: &str) -> UnsubscribeOutcome {
        let mut registry = self.registry.lock();
        let outcome = registry.unsubscribe(id, topic);
        if outcome == UnsubscribeOutcome::LastInterest {
            self.release_broker_topics(&[topic.to_string()]);
        }
        self.update_gauges(&registry);
        outcome
    }

    fn disconnect(&self, id: ConnectionId) {
        let mut registry = self.registry.lock();
        let idle = registry.on_disconnect(id);
        self.release_broker_topics(&idle);
        self.update_gauges(&registry);
    }

    fn release_broker_topics(&self, topics: &[String]) {
        if !self.unsubscribe_when_idle {
            return;
        }
        for topic in topics {
            match self.broker.unsubscribe(topic) {
                Ok(()) => debug!("Unsubscribed from '{}' on broker", topic),
                Err(e) => warn!("Failed to unsubscribe from '{}' on broker: {}", topic, e),
            }
        }
    }

    fn update_gauges(&self, registry: &SubscriptionRegistry) {
        self.metrics
            .active_clients
            .set(registry.connection_count() as i64);
        self.metrics
            .subscribed_topics
            .set(registry.topic_count() as i64);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closed,
}

/// What a single inbound frame did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    Subscribed(SubscribeOutcome),
    Unsubscribed(UnsubscribeOutcome),
    /// Frame was not JSON; the client was sent an error reply
    Rejected,
    Ignored,
}

/// Per-connection state machine: `Open` until closed, then inert.
///
/// Dropping a session closes it, so a connection task that ends for any reason
/// still removes its registry entry.
pub struct ClientSession {
    id: ConnectionId,
    state: SessionState,
    tx: ClientTx,
    manager: Arc<ConnectionLifecycleManager>,
}

impl ClientSession {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn handle_frame(&mut self, raw: &[u8]) -> FrameOutcome {
        if self.state == SessionState::Closed {
            return FrameOutcome::Ignored;
        }

        match parse_request(raw) {
            Ok(ClientRequest::Subscribe { topic }) => {
                FrameOutcome::Subscribed(self.manager.subscribe(self.id, &topic))
            }
            Ok(ClientRequest::Unsubscribe { topic }) => {
                FrameOutcome::Unsubscribed(self.manager.unsubscribe(self.id, &topic))
            }
            Ok(ClientRequest::Ignored) => {
                debug!("Ignoring request without usable action from {}", self.id);
                FrameOutcome::Ignored
            }
            Err(e) => {
                debug!("Invalid request from {}: {}", self.id, e);
                self.manager.metrics.invalid_requests.inc();
                self.reply(&ServerMessage::invalid_json());
                FrameOutcome::Rejected
            }
        }
    }

    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        self.manager.disconnect(self.id);
        info!("WebSocket client {} disconnected", self.id);
    }

    fn reply(&self, message: &ServerMessage<'_>) {
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode reply for {}: {}", self.id, e);
                return;
            }
        };
        match self.tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("Reply to {} dropped: buffer full", self.id),
            Err(TrySendError::Closed(_)) => debug!("Reply to {} dropped: socket closed", self.id),
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.close();
    }
}
