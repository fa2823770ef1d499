use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::lifecycle::ConnectionLifecycleManager;
use crate::router::{BrokerMessage, Router};
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS, Transport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Requests the bridge makes of its upstream broker connection.
///
/// Calls never wait on the network: they only enqueue the request for the event loop,
/// which is what allows them to be issued while the subscription registry is locked.
#[cfg_attr(test, mockall::automock)]
pub trait BrokerClient: Send + Sync {
    fn subscribe(&self, topic: &str) -> Result<(), BrokerError>;
    fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError>;
    fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError>;
}

pub struct MqttBrokerClient {
    client: AsyncClient,
    qos: QoS,
}

impl MqttBrokerClient {
    pub fn new(config: &BrokerConfig, transport: Option<Transport>) -> (Self, EventLoop) {
        let client_id = config.effective_client_id();
        let mut mqtt_options = MqttOptions::new(&client_id, &config.host, config.port);
        mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            mqtt_options.set_credentials(username, password);
        }

        if let Some(transport) = transport {
            mqtt_options.set_transport(transport);
        }

        info!(
            "Broker client '{}' targeting {}:{}",
            client_id, config.host, config.port
        );

        let (client, eventloop) = AsyncClient::new(mqtt_options, config.request_capacity);
        (
            Self {
                client,
                qos: qos_from_level(config.qos),
            },
            eventloop,
        )
    }
}

impl BrokerClient for MqttBrokerClient {
    fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.client.try_subscribe(topic, self.qos)?;
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.client.try_unsubscribe(topic)?;
        Ok(())
    }

    fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError> {
        self.client
            .try_publish(topic, self.qos, false, payload.to_vec())?;
        Ok(())
    }
}

fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        other => {
            warn!("Invalid QoS level {}, falling back to 0", other);
            QoS::AtMostOnce
        }
    }
}

/// Reacts to broker events: routes incoming publishes and restores broker
/// subscriptions after every (re)connect.
pub struct BrokerEventHandler {
    router: Router,
    lifecycle: Arc<ConnectionLifecycleManager>,
    connected: Arc<AtomicBool>,
}

impl BrokerEventHandler {
    pub fn new(
        router: Router,
        lifecycle: Arc<ConnectionLifecycleManager>,
        connected: Arc<AtomicBool>,
    ) -> Self {
        Self {
            router,
            lifecycle,
            connected,
        }
    }

    pub fn handle(&self, event: Event) {
        match event {
            Event::Incoming(Incoming::ConnAck(_)) => {
                self.connected.store(true, Ordering::Relaxed);
                info!("✅ Connected to broker");

                // Clean sessions lose their subscriptions across reconnects
                let restored = self.lifecycle.resubscribe_interested();
                if restored > 0 {
                    info!("Re-subscribed to {} topic(s) after connect", restored);
                }
            }
            Event::Incoming(Incoming::Publish(publish)) => {
                debug!(
                    "📥 Received from broker: topic='{}', {} bytes",
                    publish.topic,
                    publish.payload.len()
                );
                let message = BrokerMessage {
                    topic: publish.topic,
                    payload: publish.payload,
                };
                self.router.route(&message);
            }
            Event::Incoming(Incoming::SubAck(suback)) => {
                debug!("Broker acknowledged subscription (pkid {})", suback.pkid);
            }
            Event::Incoming(Incoming::Disconnect) => {
                self.connected.store(false, Ordering::Relaxed);
                warn!("Broker sent disconnect");
            }
            _ => {}
        }
    }

    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }
}

/// Drive the rumqttc event loop until `shutdown` fires.
///
/// Errors are logged and the loop keeps polling after `retry_delay`; rumqttc
/// reconnects on the next poll.
pub async fn run_event_loop(
    mut eventloop: EventLoop,
    handler: BrokerEventHandler,
    shutdown: CancellationToken,
    retry_delay: Duration,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Broker event loop shutting down");
                break;
            }
            result = eventloop.poll() => {
                match result {
                    Ok(event) => handler.handle(event),
                    Err(e) => {
                        handler.mark_disconnected();
                        error!("❌ MQTT connection error: {}", e);
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(retry_delay) => {}
                        }
                    }
                }
            }
        }
    }
}
