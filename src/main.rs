use anyhow::Result;
use mqtt_ws_bridge::{config::Config, MqttWsBridge};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    // Initialize tracing
    let fmt_layer = if std::env::var("LOG_FORMAT").is_ok_and(|format| format == "json") {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "mqtt_ws_bridge=info,rumqttc=warn,tower_http=info".into()
            }),
        )
        .with(fmt_layer)
        .init();

    tracing::info!("Starting MQTT WebSocket bridge");

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!(
        "Configuration loaded: broker {}:{} (tls: {}), listening on port {}",
        config.broker.host,
        config.broker.port,
        config.broker.tls.enabled,
        config.server.port
    );

    // Create and start the bridge
    let bridge = MqttWsBridge::new(config)?;
    bridge.run().await?;

    Ok(())
}
