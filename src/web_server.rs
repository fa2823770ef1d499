use crate::error::PublishError;
use crate::lifecycle::ConnectionLifecycleManager;
use crate::metrics::Metrics;
use crate::publish::PublishGateway;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

#[derive(Clone)]
pub struct AppState {
    lifecycle: Arc<ConnectionLifecycleManager>,
    gateway: Arc<PublishGateway>,
    metrics: Arc<Metrics>,
    broker_connected: Arc<AtomicBool>,
    client_buffer: usize,
    started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        lifecycle: Arc<ConnectionLifecycleManager>,
        gateway: Arc<PublishGateway>,
        metrics: Arc<Metrics>,
        broker_connected: Arc<AtomicBool>,
        client_buffer: usize,
    ) -> Self {
        Self {
            lifecycle,
            gateway,
            metrics,
            broker_connected,
            // Bounded channels need a non-zero capacity
            client_buffer: client_buffer.max(1),
            started_at: Utc::now(),
        }
    }
}

pub struct WebServer {
    port: u16,
    state: AppState,
}

impl WebServer {
    pub fn new(port: u16, state: AppState) -> Self {
        Self { port, state }
    }

    pub fn router(&self) -> Router {
        app(self.state.clone())
    }

    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let app = self.router();

        let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", self.port)).await?;
        info!("🚀 Server running on port {}", self.port);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;
        Ok(())
    }
}

/// All HTTP and WebSocket routes.
///
/// WebSocket clients upgrade on `/` (the path browser dashboards use) or on `/ws`.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(websocket_handler).post(initial_route))
        .route("/ws", get(websocket_handler))
        .route("/health", get(health_check))
        .route("/api/status", get(get_status))
        .route("/metrics", get(get_metrics))
        .route("/mqtt/publish", post(publish_message))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

async fn initial_route() -> Json<Value> {
    Json(serde_json::json!({ "message": "Initial Route Running" }))
}

// REST endpoint to publish an MQTT message
async fn publish_message(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<PublishResponse>, AppError> {
    state.gateway.publish(&body)?;
    Ok(Json(PublishResponse { success: true }))
}

async fn get_status(State(state): State<AppState>) -> Json<SystemStatus> {
    Json(SystemStatus {
        started_at: state.started_at,
        broker_connected: state.broker_connected.load(Ordering::Relaxed),
        active_clients: state.lifecycle.connection_count(),
        subscribed_topics: state.metrics.subscribed_topics.get(),
        messages_received: state.metrics.broker_messages_received.get(),
        messages_delivered: state.metrics.messages_delivered.get(),
    })
}

async fn get_metrics(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let body = state
        .metrics
        .render()
        .map_err(|e| AppError::Internal(e.into()))?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}

#[derive(Debug, Serialize)]
struct PublishResponse {
    success: bool,
}

#[derive(Debug, Serialize)]
struct SystemStatus {
    started_at: DateTime<Utc>,
    broker_connected: bool,
    active_clients: usize,
    subscribed_topics: i64,
    messages_received: u64,
    messages_delivered: u64,
}

// Error handling
enum AppError {
    Internal(anyhow::Error),
    BadRequest(String),
    PublishFailed,
}

impl From<PublishError> for AppError {
    fn from(err: PublishError) -> Self {
        match err {
            PublishError::MissingTopic => AppError::BadRequest(err.to_string()),
            PublishError::Encode(_) | PublishError::Broker(_) => AppError::PublishFailed,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            AppError::Internal(err) => {
                error!("Internal error: {}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal error: {}", err),
                )
            }
            AppError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            AppError::PublishFailed => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Publish failed".to_string(),
            ),
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

// WebSocket handler: subscribe requests in, topic data out
async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(state.client_buffer);
    let mut session = state.lifecycle.open(tx);
    let id = session.id();

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    debug!("Received message from {}: {}", id, text);
                    session.handle_frame(text.as_bytes());
                }
                Some(Ok(Message::Binary(data))) => {
                    session.handle_frame(&data);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("WebSocket error from {}: {}", id, e);
                    break;
                }
            },
            _ = &mut writer => {
                debug!("WebSocket writer for {} stopped", id);
                break;
            }
        }
    }

    session.close();
    writer.abort();
}
