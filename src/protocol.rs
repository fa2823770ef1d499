//! JSON frames exchanged with WebSocket clients.
//!
//! Inbound frames are `{"action": "...", "topic": "..."}`. Anything that parses as JSON
//! but does not carry a recognized action and a non-empty string topic is ignored;
//! only frames that are not JSON at all (or JSON `null`) are rejected.

use crate::error::RequestError;
use serde::Serialize;
use serde_json::Value;
use std::borrow::Cow;

/// Reply sent to a client whose frame could not be parsed
pub const INVALID_JSON: &str = "Invalid JSON";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    /// Well-formed JSON without a usable action/topic pair
    Ignored,
}

pub fn parse_request(raw: &[u8]) -> Result<ClientRequest, RequestError> {
    let text = std::str::from_utf8(raw)?;
    let value: Value = serde_json::from_str(text)?;
    if value.is_null() {
        return Err(RequestError::Null);
    }

    let action = value.get("action").and_then(Value::as_str);
    let topic = value
        .get("topic")
        .and_then(Value::as_str)
        .filter(|topic| !topic.is_empty());

    let request = match (action, topic) {
        (Some("subscribe"), Some(topic)) => ClientRequest::Subscribe {
            topic: topic.to_string(),
        },
        (Some("unsubscribe"), Some(topic)) => ClientRequest::Unsubscribe {
            topic: topic.to_string(),
        },
        _ => ClientRequest::Ignored,
    };
    Ok(request)
}

/// Frames sent from the bridge to a client
#[derive(Debug, Serialize, PartialEq)]
#[serde(untagged)]
pub enum ServerMessage<'a> {
    Delivery {
        topic: &'a str,
        message: Cow<'a, str>,
    },
    Error {
        error: &'a str,
    },
}

impl<'a> ServerMessage<'a> {
    /// Broker payloads are forwarded as text; invalid UTF-8 is replaced lossily
    pub fn delivery(topic: &'a str, payload: &'a [u8]) -> Self {
        ServerMessage::Delivery {
            topic,
            message: String::from_utf8_lossy(payload),
        }
    }

    pub fn invalid_json() -> Self {
        ServerMessage::Error {
            error: INVALID_JSON,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
