use crate::lifecycle::SharedRegistry;
use crate::metrics::Metrics;
use crate::protocol::ServerMessage;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

/// A message received from the broker
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Registry entries subscribed to the topic
    pub matched: usize,
    pub delivered: usize,
    /// Skipped because the client's socket was gone or its buffer full
    pub dropped: usize,
}

/// Fans broker messages out to subscribed clients.
///
/// Delivery is best-effort and at most once: a frame is offered to each client's
/// bounded buffer without waiting, and a client that cannot take it misses it.
#[derive(Clone)]
pub struct Router {
    registry: SharedRegistry,
    metrics: Arc<Metrics>,
}

impl Router {
    pub fn new(registry: SharedRegistry, metrics: Arc<Metrics>) -> Self {
        Self { registry, metrics }
    }

    pub fn route(&self, message: &BrokerMessage) -> DeliveryReport {
        let start = Instant::now();
        self.metrics.broker_messages_received.inc();

        let frame = match ServerMessage::delivery(&message.topic, &message.payload).encode() {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode message on '{}': {}", message.topic, e);
                return DeliveryReport::default();
            }
        };

        let mut report = DeliveryReport::default();
        {
            // Sends happen under the lock so nothing is delivered to a connection
            // after its on_disconnect has returned
            let registry = self.registry.lock();
            for (id, tx) in registry.matching(&message.topic) {
                report.matched += 1;

                if tx.is_closed() {
                    debug!("Skipped {} on '{}': socket closed", id, message.topic);
                    report.dropped += 1;
                    continue;
                }

                match tx.try_send(frame.clone()) {
                    Ok(()) => {
                        debug!("Forwarded message on '{}' to {}", message.topic, id);
                        report.delivered += 1;
                    }
                    Err(TrySendError::Full(_)) => {
                        warn!("Dropped message on '{}' for {}: buffer full", message.topic, id);
                        report.dropped += 1;
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!("Skipped {} on '{}': socket closed", id, message.topic);
                        report.dropped += 1;
                    }
                }
            }
        }

        self.metrics.messages_delivered.inc_by(report.delivered as u64);
        self.metrics.deliveries_dropped.inc_by(report.dropped as u64);
        self.metrics
            .fanout_duration
            .observe(start.elapsed().as_secs_f64());

        if report.delivered > 0 {
            info!(
                "📤 Message on '{}' forwarded to {} subscribed client(s)",
                message.topic, report.delivered
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ConnectionId, SubscriptionRegistry};
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    fn message(topic: &str, payload: &'static str) -> BrokerMessage {
        BrokerMessage {
            topic: topic.to_string(),
            payload: Bytes::from_static(payload.as_bytes()),
        }
    }

    fn setup() -> (SharedRegistry, Router, Arc<Metrics>) {
        let registry: SharedRegistry = Arc::new(Mutex::new(SubscriptionRegistry::new()));
        let metrics = Metrics::new().unwrap();
        let router = Router::new(Arc::clone(&registry), Arc::clone(&metrics));
        (registry, router, metrics)
    }

    fn connect(registry: &SharedRegistry, buffer: usize) -> (ConnectionId, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(buffer);
        let id = ConnectionId::next();
        registry.lock().on_connect(id, tx);
        (id, rx)
    }

    #[test]
    fn test_only_subscribers_receive() {
        let (registry, router, metrics) = setup();
        let (a, mut rx_a) = connect(&registry, 4);
        let (_b, mut rx_b) = connect(&registry, 4);
        registry.lock().subscribe(a, "sensors/1");

        let report = router.route(&message("sensors/1", "42"));
        assert_eq!(
            report,
            DeliveryReport {
                matched: 1,
                delivered: 1,
                dropped: 0
            }
        );
        assert_eq!(rx_a.try_recv().unwrap(), r#"{"topic":"sensors/1","message":"42"}"#);
        assert!(rx_b.try_recv().is_err());
        assert_eq!(metrics.broker_messages_received.get(), 1);
        assert_eq!(metrics.messages_delivered.get(), 1);
    }

    #[test]
    fn test_exactly_k_of_n_delivered() {
        let (registry, router, _metrics) = setup();
        let mut receivers = Vec::new();
        for i in 0..10 {
            let (id, rx) = connect(&registry, 4);
            let subscribed = i % 3 == 0;
            if subscribed {
                registry.lock().subscribe(id, "T");
            }
            receivers.push((subscribed, rx));
        }

        let report = router.route(&message("T", "x"));
        assert_eq!(report.delivered, 4);

        for (subscribed, mut rx) in receivers {
            assert_eq!(rx.try_recv().is_ok(), subscribed);
            assert!(rx.try_recv().is_err());
        }
    }

    #[test]
    fn test_disconnected_client_not_considered() {
        let (registry, router, _metrics) = setup();
        let (a, mut rx_a) = connect(&registry, 4);
        registry.lock().subscribe(a, "t1");
        registry.lock().on_disconnect(a);

        let report = router.route(&message("t1", "late"));
        assert_eq!(report, DeliveryReport::default());
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn test_failed_client_does_not_block_others() {
        let (registry, router, metrics) = setup();
        let (closed, rx_closed) = connect(&registry, 4);
        let (full, _rx_full) = connect(&registry, 1);
        let (healthy, mut rx_healthy) = connect(&registry, 4);
        for id in [closed, full, healthy] {
            registry.lock().subscribe(id, "t");
        }
        drop(rx_closed);

        // Fill the single-slot buffer
        assert_eq!(router.route(&message("t", "first")).delivered, 2);
        let report = router.route(&message("t", "second"));

        assert_eq!(report.matched, 3);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.dropped, 2);
        assert_eq!(rx_healthy.try_recv().unwrap(), r#"{"topic":"t","message":"first"}"#);
        assert_eq!(rx_healthy.try_recv().unwrap(), r#"{"topic":"t","message":"second"}"#);
        assert_eq!(metrics.deliveries_dropped.get(), 3);
    }

    #[test]
    fn test_no_subscribers() {
        let (_registry, router, metrics) = setup();
        let report = router.route(&message("nobody", "x"));
        assert_eq!(report, DeliveryReport::default());
        assert_eq!(metrics.broker_messages_received.get(), 1);
    }
}
