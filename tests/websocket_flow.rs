use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use mqtt_ws_bridge::error::BrokerError;
use mqtt_ws_bridge::lifecycle::SharedRegistry;
use mqtt_ws_bridge::metrics::Metrics;
use mqtt_ws_bridge::publish::PublishGateway;
use mqtt_ws_bridge::router::BrokerMessage;
use mqtt_ws_bridge::web_server::{app, AppState};
use mqtt_ws_bridge::{BrokerClient, ConnectionLifecycleManager, Router, SubscriptionRegistry};
use parking_lot::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Records broker requests instead of talking to a broker
#[derive(Default)]
struct RecordingBroker {
    subscribed: Mutex<Vec<String>>,
    unsubscribed: Mutex<Vec<String>>,
}

impl BrokerClient for RecordingBroker {
    fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.subscribed.lock().push(topic.to_string());
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.unsubscribed.lock().push(topic.to_string());
        Ok(())
    }

    fn publish(&self, _topic: &str, _payload: Bytes) -> Result<(), BrokerError> {
        Ok(())
    }
}

struct Harness {
    url: String,
    broker: Arc<RecordingBroker>,
    lifecycle: Arc<ConnectionLifecycleManager>,
    router: Router,
}

async fn start() -> Harness {
    let metrics = Metrics::new().unwrap();
    let broker = Arc::new(RecordingBroker::default());
    let registry: SharedRegistry = Arc::new(Mutex::new(SubscriptionRegistry::new()));
    let lifecycle = Arc::new(ConnectionLifecycleManager::new(
        Arc::clone(&registry),
        broker.clone(),
        Arc::clone(&metrics),
        true,
    ));
    let router = Router::new(registry, Arc::clone(&metrics));
    let gateway = Arc::new(PublishGateway::new(broker.clone(), Arc::clone(&metrics)));
    let state = AppState::new(
        Arc::clone(&lifecycle),
        gateway,
        metrics,
        Arc::new(AtomicBool::new(true)),
        16,
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app(state)).await.unwrap();
    });

    Harness {
        url: format!("ws://{}/", addr),
        broker,
        lifecycle,
        router,
    }
}

async fn connect(harness: &Harness) -> Client {
    let (client, _response) = connect_async(harness.url.as_str()).await.unwrap();
    client
}

/// Poll until `check` holds; registry updates happen on the server's tasks
async fn eventually<F: Fn() -> bool>(check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

async fn next_text(client: &mut Client) -> String {
    let frame = tokio::time::timeout(Duration::from_secs(2), client.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("stream ended")
        .unwrap();
    frame.into_text().unwrap()
}

async fn assert_silent(client: &mut Client) {
    let result = tokio::time::timeout(Duration::from_millis(200), client.next()).await;
    assert!(result.is_err(), "unexpected frame: {:?}", result);
}

fn deliver(harness: &Harness, topic: &str, payload: &'static str) -> usize {
    harness
        .router
        .route(&BrokerMessage {
            topic: topic.to_string(),
            payload: Bytes::from_static(payload.as_bytes()),
        })
        .delivered
}

#[tokio::test]
async fn test_only_subscribed_client_receives() {
    let harness = start().await;
    let mut a = connect(&harness).await;
    let mut b = connect(&harness).await;

    a.send(Message::Text(
        r#"{"action":"subscribe","topic":"sensors/1"}"#.into(),
    ))
    .await
    .unwrap();
    eventually(|| harness.lifecycle.subscriber_count("sensors/1") == 1).await;
    eventually(|| harness.lifecycle.connection_count() == 2).await;

    assert_eq!(deliver(&harness, "sensors/1", "42"), 1);

    assert_eq!(next_text(&mut a).await, r#"{"topic":"sensors/1","message":"42"}"#);
    assert_silent(&mut b).await;
    assert_eq!(*harness.broker.subscribed.lock(), vec!["sensors/1".to_string()]);
}

#[tokio::test]
async fn test_malformed_frame_keeps_connection_usable() {
    let harness = start().await;
    let mut a = connect(&harness).await;

    a.send(Message::Text("not-json".into())).await.unwrap();
    assert_eq!(next_text(&mut a).await, r#"{"error":"Invalid JSON"}"#);

    a.send(Message::Text(r#"{"action":"subscribe","topic":"t1"}"#.into()))
        .await
        .unwrap();
    eventually(|| harness.lifecycle.subscriber_count("t1") == 1).await;

    assert_eq!(deliver(&harness, "t1", "still here"), 1);
    assert_eq!(
        next_text(&mut a).await,
        r#"{"topic":"t1","message":"still here"}"#
    );
}

#[tokio::test]
async fn test_disconnected_client_is_not_a_target() {
    let harness = start().await;
    let mut a = connect(&harness).await;

    a.send(Message::Text(r#"{"action":"subscribe","topic":"t1"}"#.into()))
        .await
        .unwrap();
    eventually(|| harness.lifecycle.subscriber_count("t1") == 1).await;

    a.close(None).await.unwrap();
    eventually(|| harness.lifecycle.connection_count() == 0).await;

    assert_eq!(deliver(&harness, "t1", "nobody home"), 0);
    assert_eq!(*harness.broker.unsubscribed.lock(), vec!["t1".to_string()]);
}

#[tokio::test]
async fn test_broker_subscribe_once_for_many_clients() {
    let harness = start().await;
    let mut clients = Vec::new();
    for _ in 0..3 {
        let mut client = connect(&harness).await;
        for _ in 0..2 {
            client
                .send(Message::Text(
                    r#"{"action":"subscribe","topic":"shared"}"#.into(),
                ))
                .await
                .unwrap();
        }
        clients.push(client);
    }
    eventually(|| harness.lifecycle.subscriber_count("shared") == 3).await;

    assert_eq!(*harness.broker.subscribed.lock(), vec!["shared".to_string()]);
    assert_eq!(deliver(&harness, "shared", "x"), 3);
    for client in &mut clients {
        assert_eq!(next_text(client).await, r#"{"topic":"shared","message":"x"}"#);
    }
}
