use crate::broker_client::{run_event_loop, BrokerEventHandler, MqttBrokerClient};
use crate::config::Config;
use crate::lifecycle::{ConnectionLifecycleManager, SharedRegistry};
use crate::metrics::Metrics;
use crate::publish::PublishGateway;
use crate::registry::SubscriptionRegistry;
use crate::router::Router;
use crate::tls;
use crate::web_server::{AppState, WebServer};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use rumqttc::EventLoop;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// The assembled bridge: one broker connection, one subscription registry, one web server
pub struct MqttWsBridge {
    eventloop: EventLoop,
    event_handler: BrokerEventHandler,
    web_server: WebServer,
    retry_delay: Duration,
}

impl MqttWsBridge {
    pub fn new(config: Config) -> Result<Self> {
        info!("Initializing MQTT WebSocket bridge");

        let metrics = Metrics::new().context("Failed to register metrics")?;

        let transport = if config.broker.tls.enabled {
            let material = config.broker.tls.load_material()?;
            let transport = tls::transport(&material, config.broker.tls.insecure_skip_verify)
                .context("Failed to configure TLS")?;
            Some(transport)
        } else {
            None
        };

        let (broker, eventloop) = MqttBrokerClient::new(&config.broker, transport);
        let broker = Arc::new(broker);

        let registry: SharedRegistry = Arc::new(Mutex::new(SubscriptionRegistry::new()));
        let lifecycle = Arc::new(ConnectionLifecycleManager::new(
            Arc::clone(&registry),
            broker.clone(),
            Arc::clone(&metrics),
            config.broker.unsubscribe_when_idle,
        ));
        let router = Router::new(registry, Arc::clone(&metrics));
        let gateway = Arc::new(PublishGateway::new(broker, Arc::clone(&metrics)));

        let broker_connected = Arc::new(AtomicBool::new(false));
        let event_handler =
            BrokerEventHandler::new(router, Arc::clone(&lifecycle), Arc::clone(&broker_connected));

        let state = AppState::new(
            lifecycle,
            gateway,
            metrics,
            broker_connected,
            config.server.client_buffer,
        );
        let web_server = WebServer::new(config.server.port, state);

        Ok(Self {
            eventloop,
            event_handler,
            web_server,
            retry_delay: Duration::from_secs(config.broker.retry_delay_secs),
        })
    }

    pub async fn run(self) -> Result<()> {
        let shutdown = CancellationToken::new();

        let broker_task = tokio::spawn(run_event_loop(
            self.eventloop,
            self.event_handler,
            shutdown.clone(),
            self.retry_delay,
        ));

        let web_shutdown = shutdown.clone();
        let mut web_task = tokio::spawn(self.web_server.run(web_shutdown));

        tokio::select! {
            result = &mut web_task => {
                shutdown.cancel();
                match result {
                    Ok(Ok(())) => info!("Web server stopped"),
                    Ok(Err(e)) => {
                        error!("Web server error: {}", e);
                        return Err(e);
                    }
                    Err(e) => return Err(e).context("Web server task failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down MQTT WebSocket bridge");
                shutdown.cancel();
                if let Ok(Err(e)) = web_task.await {
                    error!("Web server error during shutdown: {}", e);
                }
            }
        }

        if let Err(e) = broker_task.await {
            error!("Broker event loop task failed: {}", e);
        }
        Ok(())
    }
}
