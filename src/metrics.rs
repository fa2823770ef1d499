use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub broker_messages_received: IntCounter,
    pub messages_delivered: IntCounter,
    pub deliveries_dropped: IntCounter,
    pub invalid_requests: IntCounter,
    pub publish_succeeded: IntCounter,
    pub publish_failed: IntCounter,
    pub active_clients: IntGauge,
    pub subscribed_topics: IntGauge,
    pub fanout_duration: Histogram,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Arc<Self>> {
        let registry = Registry::new();

        let broker_messages_received = IntCounter::new(
            "bridge_broker_messages_received_total",
            "Total number of messages received from the broker",
        )?;
        let messages_delivered = IntCounter::new(
            "bridge_messages_delivered_total",
            "Total number of frames queued to WebSocket clients",
        )?;
        let deliveries_dropped = IntCounter::new(
            "bridge_deliveries_dropped_total",
            "Deliveries skipped because the client was closed or its buffer was full",
        )?;
        let invalid_requests = IntCounter::new(
            "bridge_invalid_requests_total",
            "Client frames rejected as invalid JSON",
        )?;
        let publish_succeeded = IntCounter::new(
            "bridge_publish_succeeded_total",
            "Publish requests accepted by the broker client",
        )?;
        let publish_failed = IntCounter::new(
            "bridge_publish_failed_total",
            "Publish requests that failed",
        )?;
        let active_clients = IntGauge::new(
            "bridge_active_clients",
            "Number of connected WebSocket clients",
        )?;
        let subscribed_topics = IntGauge::new(
            "bridge_subscribed_topics",
            "Number of topics with at least one subscribed client",
        )?;
        let fanout_duration = Histogram::with_opts(HistogramOpts::new(
            "bridge_fanout_duration_seconds",
            "Time spent fanning one broker message out to clients",
        ))?;

        registry.register(Box::new(broker_messages_received.clone()))?;
        registry.register(Box::new(messages_delivered.clone()))?;
        registry.register(Box::new(deliveries_dropped.clone()))?;
        registry.register(Box::new(invalid_requests.clone()))?;
        registry.register(Box::new(publish_succeeded.clone()))?;
        registry.register(Box::new(publish_failed.clone()))?;
        registry.register(Box::new(active_clients.clone()))?;
        registry.register(Box::new(subscribed_topics.clone()))?;
        registry.register(Box::new(fanout_duration.clone()))?;

        Ok(Arc::new(Self {
            registry,
            broker_messages_received,
            messages_delivered,
            deliveries_dropped,
            invalid_requests,
            publish_succeeded,
            publish_failed,
            active_clients,
            subscribed_topics,
            fanout_duration,
        }))
    }

    /// Prometheus text exposition of every metric
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
