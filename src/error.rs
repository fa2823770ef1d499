use thiserror::Error;

/// Failure of a request handed to the broker client
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker client rejected request: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to parse PEM {what}: {reason}")]
    Pem { what: &'static str, reason: String },
    #[error("no usable root certificates")]
    NoRoots,
    #[error("failed to load platform root certificates: {0}")]
    NativeRoots(#[from] std::io::Error),
    #[error("client certificate and key must be configured together")]
    IncompleteClientAuth,
    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

/// Inbound client frame that could not be understood.
///
/// Every variant is reported to the client as `{"error":"Invalid JSON"}`.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("payload is not valid UTF-8")]
    NotUtf8(#[from] std::str::Utf8Error),
    #[error("malformed JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("request is null")]
    Null,
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("topic is required")]
    MissingTopic,
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}
