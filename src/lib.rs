pub mod bridge;
pub mod broker_client;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod protocol;
pub mod publish;
pub mod registry;
pub mod router;
pub mod tls;
pub mod web_server;

pub use bridge::MqttWsBridge;
pub use broker_client::{BrokerClient, MqttBrokerClient};
pub use config::Config;
pub use lifecycle::{ClientSession, ConnectionLifecycleManager};
pub use registry::SubscriptionRegistry;
pub use router::Router;
