use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

const CONFIG_PATH_VAR: &str = "MQTT_BRIDGE_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "./config/bridge.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Hostname of the MQTT broker (e.g. the AWS IoT data endpoint)
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    /// Empty means a random `mqtt-ws-bridge-<uuid>` id is generated
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default)]
    pub qos: u8,
    /// Capacity of the rumqttc request queue
    #[serde(default = "default_request_capacity")]
    pub request_capacity: usize,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    /// Drop the broker subscription once no client is interested in a topic
    #[serde(default = "default_true")]
    pub unsubscribe_when_idle: bool,
    #[serde(default)]
    pub tls: TlsConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub ca_cert_path: Option<String>,
    #[serde(default)]
    pub client_cert_path: Option<String>,
    #[serde(default)]
    pub client_key_path: Option<String>,
    /// Inline PEM; takes precedence over the matching path
    #[serde(default, skip_serializing)]
    pub ca_cert_pem: Option<String>,
    #[serde(default, skip_serializing)]
    pub client_cert_pem: Option<String>,
    #[serde(default, skip_serializing)]
    pub client_key_pem: Option<String>,
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Frames buffered per WebSocket client before deliveries are dropped
    #[serde(default = "default_client_buffer")]
    pub client_buffer: usize,
}

/// PEM bytes resolved from inline values or files
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsMaterial {
    pub ca_cert: Option<Vec<u8>>,
    pub client_cert: Option<Vec<u8>>,
    pub client_key: Option<Vec<u8>>,
}

fn default_true() -> bool {
    true
}

fn default_broker_port() -> u16 {
    8883
}

fn default_keep_alive() -> u64 {
    60
}

fn default_request_capacity() -> usize {
    10000
}

fn default_retry_delay() -> u64 {
    5
}

fn default_server_port() -> u16 {
    3000
}

fn default_client_buffer() -> usize {
    256
}

impl Config {
    /// Load the TOML file named by `MQTT_BRIDGE_CONFIG` (if present), then apply
    /// environment overrides
    pub fn from_env() -> Result<Self> {
        let config_path =
            std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        let mut config = if Path::new(&config_path).exists() {
            Self::from_file(&config_path)?
        } else {
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Config =
            toml::from_str(&contents).with_context(|| "Failed to parse TOML configuration")?;
        config.validate()?;

        Ok(config)
    }

    /// Reject values that would leave the bridge unable to queue anything
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.server.client_buffer > 0,
            "server.client_buffer must be greater than 0"
        );
        anyhow::ensure!(
            self.broker.request_capacity > 0,
            "broker.request_capacity must be greater than 0"
        );
        Ok(())
    }

    /// Apply overrides using the variable names of the deployment environment.
    ///
    /// PEM values arrive with literal `\n` sequences; any inline PEM enables TLS.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("AWS_IOT_HOST") {
            self.broker.host = host;
        }
        if let Some(client_id) = lookup("MQTT_CLIENT_ID") {
            self.broker.client_id = client_id;
        }
        if let Some(port) = lookup("MQTT_BROKER_PORT") {
            self.broker.port = port
                .parse()
                .with_context(|| format!("Invalid MQTT_BROKER_PORT: {}", port))?;
        }
        if let Some(port) = lookup("PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid PORT: {}", port))?;
        }

        let tls = &mut self.broker.tls;
        for (key, slot) in [
            ("rootCAEnv", &mut tls.ca_cert_pem),
            ("certificateEnv", &mut tls.client_cert_pem),
            ("privateKeyEnv", &mut tls.client_key_pem),
        ] {
            if let Some(pem) = lookup(key) {
                *slot = Some(unescape_pem(&pem));
                tls.enabled = true;
            }
        }

        Ok(())
    }
}

impl BrokerConfig {
    pub fn effective_client_id(&self) -> String {
        if self.client_id.is_empty() {
            format!("mqtt-ws-bridge-{}", uuid::Uuid::new_v4())
        } else {
            self.client_id.clone()
        }
    }
}

impl TlsConfig {
    pub fn load_material(&self) -> Result<TlsMaterial> {
        Ok(TlsMaterial {
            ca_cert: resolve_pem(&self.ca_cert_pem, &self.ca_cert_path)?,
            client_cert: resolve_pem(&self.client_cert_pem, &self.client_cert_path)?,
            client_key: resolve_pem(&self.client_key_pem, &self.client_key_path)?,
        })
    }
}

fn resolve_pem(inline: &Option<String>, path: &Option<String>) -> Result<Option<Vec<u8>>> {
    if let Some(pem) = inline {
        return Ok(Some(pem.clone().into_bytes()));
    }
    match path {
        Some(path) => std::fs::read(path)
            .map(Some)
            .with_context(|| format!("Failed to read PEM file: {}", path)),
        None => Ok(None),
    }
}

fn unescape_pem(raw: &str) -> String {
    raw.replace("\\n", "\n")
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: default_broker_port(),
            client_id: String::new(),
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive(),
            qos: 0,
            request_capacity: default_request_capacity(),
            retry_delay_secs: default_retry_delay(),
            unsubscribe_when_idle: true,
            tls: TlsConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_server_port(),
            client_buffer: default_client_buffer(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[broker]
host = "example-ats.iot.eu-west-1.amazonaws.com"
client_id = "dashboard"
unsubscribe_when_idle = false

[broker.tls]
enabled = true
ca_cert_path = "certs/AmazonRootCA1.pem"

[server]
port = 8080
"#
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.broker.host, "example-ats.iot.eu-west-1.amazonaws.com");
        assert_eq!(config.broker.port, 8883);
        assert_eq!(config.broker.client_id, "dashboard");
        assert!(!config.broker.unsubscribe_when_idle);
        assert!(config.broker.tls.enabled);
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.client_buffer, 256);
    }

    #[test]
    fn test_zero_capacities_rejected() {
        for contents in [
            "[server]\nclient_buffer = 0\n",
            "[broker]\nhost = \"localhost\"\nrequest_capacity = 0\n",
        ] {
            let mut file = NamedTempFile::new().unwrap();
            file.write_all(contents.as_bytes()).unwrap();

            let err = Config::from_file(file.path().to_str().unwrap()).unwrap_err();
            assert!(err.to_string().contains("must be greater than 0"), "{}", err);
        }
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_from_file_missing() {
        assert!(Config::from_file("/nonexistent/bridge.toml").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("AWS_IOT_HOST", "iot.example.com"),
            ("MQTT_CLIENT_ID", "bridge-1"),
            ("PORT", "4000"),
            ("rootCAEnv", "-----BEGIN CERTIFICATE-----\\nAAAA\\n-----END CERTIFICATE-----"),
        ]);

        let mut config = Config::default();
        assert!(!config.broker.tls.enabled);
        config
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.broker.host, "iot.example.com");
        assert_eq!(config.broker.client_id, "bridge-1");
        assert_eq!(config.server.port, 4000);
        assert!(config.broker.tls.enabled);
        assert_eq!(
            config.broker.tls.ca_cert_pem.as_deref(),
            Some("-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----")
        );
    }

    #[test]
    fn test_invalid_port_override() {
        let mut config = Config::default();
        let result = config.apply_overrides(|key| (key == "PORT").then(|| "http".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_material_prefers_inline() {
        let temp_dir = TempDir::new().unwrap();
        let ca_path = temp_dir.path().join("ca.pem");
        let key_path = temp_dir.path().join("key.pem");
        std::fs::write(&ca_path, "from-file-ca").unwrap();
        std::fs::write(&key_path, "from-file-key").unwrap();

        let tls = TlsConfig {
            enabled: true,
            ca_cert_path: Some(ca_path.to_string_lossy().into_owned()),
            client_key_path: Some(key_path.to_string_lossy().into_owned()),
            ca_cert_pem: Some("inline-ca".to_string()),
            ..TlsConfig::default()
        };

        let material = tls.load_material().unwrap();
        assert_eq!(material.ca_cert.as_deref(), Some(b"inline-ca".as_slice()));
        assert_eq!(material.client_key.as_deref(), Some(b"from-file-key".as_slice()));
        assert_eq!(material.client_cert, None);
    }

    #[test]
    fn test_generated_client_id() {
        let config = BrokerConfig::default();
        let first = config.effective_client_id();
        assert!(first.starts_with("mqtt-ws-bridge-"));
        assert_ne!(first, config.effective_client_id());
    }
}
