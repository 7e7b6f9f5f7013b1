//! End-to-end session tests against an in-process pub/sub endpoint.
//!
//! The axum server below speaks the subset of the Web PubSub JSON
//! subprotocol the monitor uses: it greets with a `system` frame, expects
//! `joinGroup`, and plays the device side of the conversation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

use dunebugger_core::GpioValue;
use dunebugger_sync::{
    ClientFrame, Connector, MonitorConfig, SessionBuilder, SessionEventEmitter, SessionState,
    SessionStatus, TransportEvent, TransportSettings, WsConnector, WEBPUBSUB_SUBPROTOCOL,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Fake Endpoint
// =============================================================================

#[derive(Clone, Copy)]
enum Behavior {
    /// Full happy-path conversation, then stay open.
    Device,
    /// Answer every handshake with 503; the socket never opens.
    Unavailable,
    /// Accept the upgrade, then close straight away.
    Hangup,
}

#[derive(Clone)]
struct ServerState {
    behavior: Behavior,
    connections: Arc<AtomicUsize>,
    frames: mpsc::UnboundedSender<Value>,
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> Response {
    let n = state.connections.fetch_add(1, Ordering::SeqCst) + 1;

    if let Behavior::Unavailable = state.behavior {
        return (StatusCode::SERVICE_UNAVAILABLE, "endpoint unavailable").into_response();
    }

    ws.protocols([WEBPUBSUB_SUBPROTOCOL])
        .on_upgrade(move |socket| handle_socket(socket, state, n))
}

async fn handle_socket(mut socket: WebSocket, state: ServerState, n: usize) {
    if let Behavior::Hangup = state.behavior {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: 1011,
                reason: "endpoint unavailable".into(),
            })))
            .await;
        return;
    }

    let greeting = json!({
        "type": "system",
        "event": "connected",
        "userId": null,
        "connectionId": format!("conn-{}", n),
    });
    if send_json(&mut socket, greeting).await.is_err() {
        return;
    }

    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(frame) = serde_json::from_str::<Value>(text.as_str()) else {
            continue;
        };
        let _ = state.frames.send(frame.clone());

        let reply = match frame["type"].as_str() {
            Some("joinGroup") => vec![
                device(json!({"type": "device_online", "device_id": "raspberry123"})),
            ],
            Some("request_initial_state") => vec![
                device(json!({
                    "type": "initial_state",
                    "gpio_states": {"GPIO17": "HIGH", "GPIO27": "LOW"},
                    "logs": ["boot", "ready"],
                })),
                device(json!({"type": "gpio_update", "gpio": "GPIO27", "value": "HIGH"})),
                device(json!({"type": "message", "data": "relay 2 on"})),
            ],
            _ => Vec::new(),
        };

        for frame in reply {
            if send_json(&mut socket, frame).await.is_err() {
                return;
            }
        }
    }
}

/// Wraps a device payload the way the endpoint relays group messages.
fn device(payload: Value) -> Value {
    json!({
        "type": "message",
        "from": "group",
        "group": "velasquez",
        "dataType": "text",
        "data": payload.to_string(),
    })
}

async fn send_json(socket: &mut WebSocket, value: Value) -> Result<(), axum::Error> {
    socket.send(Message::Text(value.to_string().into())).await
}

struct FakeEndpoint {
    url: String,
    connections: Arc<AtomicUsize>,
    frames: mpsc::UnboundedReceiver<Value>,
}

async fn start_endpoint(behavior: Behavior) -> FakeEndpoint {
    let (frames_tx, frames) = mpsc::unbounded_channel();
    let connections = Arc::new(AtomicUsize::new(0));
    let state = ServerState {
        behavior,
        connections: connections.clone(),
        frames: frames_tx,
    };

    let app = Router::new()
        .route("/client", get(ws_handler))
        .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    FakeEndpoint {
        url: format!("ws://{}/client", addr),
        connections,
        frames,
    }
}

// =============================================================================
// Helpers
// =============================================================================

struct ChannelEmitter(mpsc::UnboundedSender<SessionStatus>);

impl SessionEventEmitter for ChannelEmitter {
    fn emit_status(&self, status: &SessionStatus) {
        let _ = self.0.send(status.clone());
    }

    fn emit_error(&self, _message: &str, _retryable: bool) {}
}

fn config_for(endpoint: &FakeEndpoint) -> MonitorConfig {
    let mut config = MonitorConfig::default();
    config.endpoint.url = Some(endpoint.url.clone());
    config.endpoint.connect_timeout_secs = 2;
    config.retry.delay_ms = 50;
    config
}

async fn wait_for(
    statuses: &mut mpsc::UnboundedReceiver<SessionStatus>,
    state: SessionState,
) -> SessionStatus {
    timeout(TEST_TIMEOUT, async {
        loop {
            let status = statuses.recv().await.unwrap();
            if status.state == state {
                return status;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("Timed out waiting for {}", state))
}

async fn next_event(events: &mut mpsc::Receiver<TransportEvent>) -> Option<TransportEvent> {
    timeout(TEST_TIMEOUT, events.recv())
        .await
        .unwrap_or_else(|_| panic!("Timed out waiting for a transport event"))
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_session_syncs_device_state() {
    let mut endpoint = start_endpoint(Behavior::Device).await;
    let config = config_for(&endpoint);
    let connector = WsConnector::new(config.transport_settings());

    let (statuses_tx, mut statuses) = mpsc::unbounded_channel();
    let session = SessionBuilder::new(config)
        .with_emitter(Arc::new(ChannelEmitter(statuses_tx)))
        .spawn(connector)
        .unwrap();

    let (changes_tx, mut changes) = mpsc::unbounded_channel();
    session.subscribe(move |change, _store| {
        let _ = changes_tx.send(change.clone());
    });

    session.connect().await.unwrap();
    let status = wait_for(&mut statuses, SessionState::Active).await;
    assert!(status.is_connected);
    assert!(status.is_device_online);

    // initial_state, gpio_update, message
    for _ in 0..3 {
        timeout(TEST_TIMEOUT, changes.recv()).await.unwrap().unwrap();
    }

    let snapshot = session.snapshot();
    assert_eq!(snapshot.gpio.get("GPIO17"), Some(&GpioValue::from("HIGH")));
    assert_eq!(snapshot.gpio.get("GPIO27"), Some(&GpioValue::from("HIGH")));
    assert_eq!(snapshot.logs, vec!["boot", "ready", "relay 2 on"]);

    let status = session.status().await;
    assert_eq!(status.connection_id.as_deref(), Some("conn-1"));

    let join = endpoint.frames.recv().await.unwrap();
    assert_eq!(join, json!({"type": "joinGroup", "group": "velasquez"}));
    let request = endpoint.frames.recv().await.unwrap();
    assert_eq!(
        request,
        json!({"type": "request_initial_state", "device_id": "raspberry123"})
    );

    session.shutdown().await.unwrap();
    assert_eq!(session.status().await.state, SessionState::Disconnected);
    assert_eq!(endpoint.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_refused_handshakes_exhaust_retries() {
    let endpoint = start_endpoint(Behavior::Unavailable).await;
    let mut config = config_for(&endpoint);
    config.retry.max_attempts = 3;
    let connector = WsConnector::new(config.transport_settings());

    let (statuses_tx, mut statuses) = mpsc::unbounded_channel();
    let session = SessionBuilder::new(config)
        .with_emitter(Arc::new(ChannelEmitter(statuses_tx)))
        .spawn(connector)
        .unwrap();

    session.connect().await.unwrap();

    let status = wait_for(&mut statuses, SessionState::Backoff).await;
    assert_eq!(status.retry_count, 1);
    assert!(status.last_error.unwrap().contains("503"));

    let status = wait_for(&mut statuses, SessionState::Failed).await;
    assert_eq!(status.retry_count, 3);
    assert!(status.next_retry_in.is_none());
    assert_eq!(endpoint.connections.load(Ordering::SeqCst), 3);

    // Every status up to the shutdown ack is already delivered
    session.shutdown().await.unwrap();
    let mut after_failed = Vec::new();
    while let Ok(status) = statuses.try_recv() {
        after_failed.push(status.state);
    }
    assert_eq!(after_failed, vec![SessionState::Disconnected]);
    assert_eq!(endpoint.connections.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_accepted_then_closed_keeps_retrying() {
    let endpoint = start_endpoint(Behavior::Hangup).await;
    let mut config = config_for(&endpoint);
    config.retry.max_attempts = 3;
    let connector = WsConnector::new(config.transport_settings());

    let (statuses_tx, mut statuses) = mpsc::unbounded_channel();
    let session = SessionBuilder::new(config)
        .with_emitter(Arc::new(ChannelEmitter(statuses_tx)))
        .spawn(connector)
        .unwrap();

    session.connect().await.unwrap();

    // More closes than max_attempts, yet each open resets the counter
    for _ in 0..4 {
        let status = wait_for(&mut statuses, SessionState::Backoff).await;
        assert_eq!(status.retry_count, 1);
        assert!(status.last_error.is_some());
    }

    assert!(endpoint.connections.load(Ordering::SeqCst) >= 4);
    assert_ne!(session.status().await.state, SessionState::Failed);
    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_zero_ping_interval_is_rejected_before_connecting() {
    let endpoint = start_endpoint(Behavior::Device).await;
    let mut config = config_for(&endpoint);
    config.endpoint.ping_interval_secs = 0;
    let connector = WsConnector::new(config.transport_settings());

    let err = SessionBuilder::new(config).spawn(connector).err().unwrap();
    assert!(err.is_config_error());
    assert_eq!(endpoint.connections.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_transport_without_keepalive_stays_open() {
    let endpoint = start_endpoint(Behavior::Device).await;
    let connector = WsConnector::new(TransportSettings {
        connect_timeout: Duration::from_secs(2),
        ping_interval: Duration::ZERO,
    });

    let (handle, mut events) = connector.connect(&endpoint.url, WEBPUBSUB_SUBPROTOCOL);
    assert_eq!(next_event(&mut events).await, Some(TransportEvent::Opened));
    assert!(matches!(next_event(&mut events).await, Some(TransportEvent::Received(_))));

    assert!(handle.send_frame(&ClientFrame::join_group("velasquez")).unwrap());
    match next_event(&mut events).await {
        Some(TransportEvent::Received(text)) => assert!(text.contains("device_online")),
        other => panic!("Expected device_online, got {:?}", other),
    }

    handle.close();
    assert!(matches!(
        next_event(&mut events).await,
        Some(TransportEvent::Closed { .. })
    ));
}

#[tokio::test]
async fn test_unreachable_endpoint_backs_off() {
    let mut config = MonitorConfig::default();
    // Bind then drop to get a port nothing listens on
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    config.endpoint.url = Some(format!("ws://{}/client", addr));
    config.retry.delay_ms = 50;
    config.retry.max_attempts = 2;

    let connector = WsConnector::new(config.transport_settings());
    let (statuses_tx, mut statuses) = mpsc::unbounded_channel();
    let session = SessionBuilder::new(config)
        .with_emitter(Arc::new(ChannelEmitter(statuses_tx)))
        .spawn(connector)
        .unwrap();

    session.connect().await.unwrap();
    let status = wait_for(&mut statuses, SessionState::Failed).await;
    assert_eq!(status.retry_count, 2);
    assert!(!status.is_connected);

    assert_eq!(session.snapshot().revision, 0);
}
