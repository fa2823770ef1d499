use crate::broker_client::BrokerClient;
use crate::error::PublishError;
use crate::metrics::Metrics;
use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info};

/// One-shot publish requests from the HTTP API.
///
/// The whole request body, `topic` included, is re-encoded as the MQTT payload.
pub struct PublishGateway {
    broker: Arc<dyn BrokerClient>,
    metrics: Arc<Metrics>,
}

impl PublishGateway {
    pub fn new(broker: Arc<dyn BrokerClient>, metrics: Arc<Metrics>) -> Self {
        Self { broker, metrics }
    }

    pub fn publish(&self, body: &Value) -> Result<(), PublishError> {
        let result = self.forward(body);
        match &result {
            Ok(()) => self.metrics.publish_succeeded.inc(),
            Err(e) => {
                error!("Publish failed: {}", e);
                self.metrics.publish_failed.inc();
            }
        }
        result
    }

    fn forward(&self, body: &Value) -> Result<(), PublishError> {
        let topic = body
            .get("topic")
            .and_then(Value::as_str)
            .filter(|topic| !topic.is_empty())
            .ok_or(PublishError::MissingTopic)?;
        let msg_key = body.get("msgKey").and_then(Value::as_str);
        info!("Publishing message: topic='{}', msgKey={:?}", topic, msg_key);

        let payload = Bytes::from(serde_json::to_vec(body)?);
        self.broker.publish(topic, payload)?;
        Ok(())
    }
}
