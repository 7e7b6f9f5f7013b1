//! # WebSocket Transport
//!
//! One duplex text-frame connection per [`Connector::connect`] call. The
//! transport never retries; reconnecting is the session manager's job.
//!
//! ## Connection Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Transport Connection Events                          │
//! │                                                                         │
//! │  connect(url, subprotocol)                                              │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  ┌────────────┐  handshake ok   ┌────────────┐                          │
//! │  │ Connecting │ ──────────────► │    Open    │ ── Received(text) ...    │
//! │  └─────┬──────┘    Opened       └─────┬──────┘                          │
//! │        │                              │                                 │
//! │        │ refused / timeout            │ peer close / error / close()    │
//! │        ▼                              ▼                                 │
//! │  ┌──────────────────────────────────────────┐                           │
//! │  │      Closed { code, reason }  (exactly once)                         │
//! │  └──────────────────────────────────────────┘                           │
//! │                                                                         │
//! │  send() on a handle that is not open is dropped with a warning.         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Seam
//! ```text
//!   TransportHandle ──outgoing text──► TransportEndpoint ──► socket
//!   (session side)  ◄──TransportEvent── (driver side)    ◄── socket
//! ```
//! [`WsConnector`] drives endpoints with tokio-tungstenite. Tests drive them
//! by hand.

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{MonitorError, MonitorResult};
use crate::protocol::ClientFrame;

const OUTGOING_BUFFER: usize = 32;
const EVENT_BUFFER: usize = 256;

// =============================================================================
// Transport Events
// =============================================================================

/// Notification emitted by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Handshake completed; frames may be sent.
    Opened,

    /// Connection ended. Always the last event of a transport.
    Closed { code: Option<u16>, reason: String },

    /// One text frame.
    Received(String),
}

// =============================================================================
// Transport Handle
// =============================================================================

/// Session-side handle to one connection.
#[derive(Clone)]
pub struct TransportHandle {
    id: Uuid,
    outgoing_tx: mpsc::Sender<String>,
    close_tx: mpsc::Sender<()>,
    open: Arc<AtomicBool>,
}

impl TransportHandle {
    /// Creates a handle, its driver-side endpoint and the event receiver.
    pub fn channel() -> (
        TransportHandle,
        TransportEndpoint,
        mpsc::Receiver<TransportEvent>,
    ) {
        let id = Uuid::new_v4();
        let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_BUFFER);
        let (close_tx, close_rx) = mpsc::channel(1);
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let open = Arc::new(AtomicBool::new(false));

        let handle = TransportHandle {
            id,
            outgoing_tx,
            close_tx,
            open: open.clone(),
        };

        let endpoint = TransportEndpoint {
            id,
            events_tx,
            outgoing_rx,
            close_rx,
            open,
            finished: false,
        };

        (handle, endpoint, events_rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Returns true between `Opened` and `Closed`.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Queues one text frame. Returns false if the frame was dropped.
    pub fn send(&self, text: String) -> bool {
        if !self.is_open() {
            warn!(transport = %self.id, "Send on a transport that is not open, dropping frame");
            return false;
        }

        match self.outgoing_tx.try_send(text) {
            Ok(()) => true,
            Err(e) => {
                warn!(transport = %self.id, error = %e, "Outgoing queue unavailable, dropping frame");
                false
            }
        }
    }

    /// Serializes and queues a protocol frame.
    pub fn send_frame(&self, frame: &ClientFrame) -> MonitorResult<bool> {
        let json = frame.to_json()?;
        debug!(transport = %self.id, msg_type = frame.type_name(), "Sending frame");
        Ok(self.send(json))
    }

    /// Requests an orderly close. Idempotent.
    pub fn close(&self) {
        let _ = self.close_tx.try_send(());
    }
}

impl std::fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHandle")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .finish()
    }
}

// =============================================================================
// Transport Endpoint
// =============================================================================

/// Driver side of a [`TransportHandle`].
pub struct TransportEndpoint {
    id: Uuid,
    events_tx: mpsc::Sender<TransportEvent>,
    outgoing_rx: mpsc::Receiver<String>,
    close_rx: mpsc::Receiver<()>,
    open: Arc<AtomicBool>,
    finished: bool,
}

impl TransportEndpoint {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Marks the connection open and emits `Opened`.
    pub async fn opened(&self) {
        if self.finished {
            return;
        }
        self.open.store(true, Ordering::Release);
        self.emit(TransportEvent::Opened).await;
    }

    /// Emits `Received(text)`.
    pub async fn received(&self, text: String) {
        if self.finished {
            return;
        }
        self.emit(TransportEvent::Received(text)).await;
    }

    /// Marks the connection closed and emits `Closed`. Only the first call
    /// has an effect.
    pub async fn closed(&mut self, code: Option<u16>, reason: impl Into<String>) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.open.store(false, Ordering::Release);
        self.emit(TransportEvent::Closed {
            code,
            reason: reason.into(),
        })
        .await;
    }

    /// Next frame queued by the session, or `None` once every handle is gone.
    pub async fn next_outgoing(&mut self) -> Option<String> {
        self.outgoing_rx.recv().await
    }

    /// Next queued frame, if one is already waiting.
    pub fn try_next_outgoing(&mut self) -> Option<String> {
        self.outgoing_rx.try_recv().ok()
    }

    /// Resolves when the session requests a close or drops every handle.
    pub async fn close_requested(&mut self) {
        let _ = self.close_rx.recv().await;
    }

    async fn emit(&self, event: TransportEvent) {
        if self.events_tx.send(event).await.is_err() {
            debug!(transport = %self.id, "Event receiver dropped");
        }
    }
}

// =============================================================================
// Connector Seam
// =============================================================================

/// Opens transports. Implemented by [`WsConnector`] and by test doubles.
pub trait Connector: Send + Sync + 'static {
    /// Starts one connection attempt.
    ///
    /// The returned receiver yields `Opened` on success and always ends with
    /// one `Closed`.
    fn connect(
        &self,
        url: &str,
        subprotocol: &str,
    ) -> (TransportHandle, mpsc::Receiver<TransportEvent>);
}

// =============================================================================
// WebSocket Connector
// =============================================================================

/// Transport timing settings.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    /// Handshake timeout.
    pub connect_timeout: Duration,

    /// Interval between keepalive pings. Zero disables keepalive.
    pub ping_interval: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        TransportSettings {
            connect_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
        }
    }
}

/// tokio-tungstenite backed [`Connector`].
#[derive(Debug, Clone, Default)]
pub struct WsConnector {
    settings: TransportSettings,
}

impl WsConnector {
    pub fn new(settings: TransportSettings) -> Self {
        WsConnector { settings }
    }
}

impl Connector for WsConnector {
    fn connect(
        &self,
        url: &str,
        subprotocol: &str,
    ) -> (TransportHandle, mpsc::Receiver<TransportEvent>) {
        let (handle, endpoint, events_rx) = TransportHandle::channel();
        tokio::spawn(run_connection(
            self.settings.clone(),
            endpoint,
            url.to_string(),
            subprotocol.to_string(),
        ));
        (handle, events_rx)
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Drives one WebSocket connection from handshake to close.
async fn run_connection(
    settings: TransportSettings,
    mut endpoint: TransportEndpoint,
    url: String,
    subprotocol: String,
) {
    info!(transport = %endpoint.id(), url = %url, "Connecting");

    let request = match build_request(&url, &subprotocol) {
        Ok(request) => request,
        Err(e) => {
            warn!(?e, "Invalid connection request");
            endpoint.closed(None, e.to_string()).await;
            return;
        }
    };

    let ws_stream = tokio::select! {
        result = timeout(settings.connect_timeout, connect_async(request)) => match result {
            Ok(Ok((ws_stream, response))) => {
                debug!(status = ?response.status(), "WebSocket handshake complete");
                ws_stream
            }
            Ok(Err(e)) => {
                let err = MonitorError::from(e);
                if err.is_retryable() {
                    warn!(?err, "Failed to connect");
                } else {
                    error!(?err, "Connection refused by endpoint");
                }
                endpoint.closed(None, err.to_string()).await;
                return;
            }
            Err(_) => {
                let err = MonitorError::Timeout(settings.connect_timeout.as_secs());
                warn!(?err, "Failed to connect");
                endpoint.closed(None, err.to_string()).await;
                return;
            }
        },
        _ = endpoint.close_requested() => {
            endpoint.closed(None, "closed before open").await;
            return;
        }
    };

    info!(transport = %endpoint.id(), "WebSocket connected");
    endpoint.opened().await;

    let (code, reason) = match connection_loop(&mut endpoint, ws_stream, settings.ping_interval).await {
        Ok(close) => close,
        Err(e) => {
            warn!(?e, "Connection loop ended");
            (None, e.to_string())
        }
    };

    info!(transport = %endpoint.id(), ?code, reason = %reason, "WebSocket closed");
    endpoint.closed(code, reason).await;
}

/// Pumps frames until the connection ends; returns the close code and reason.
async fn connection_loop(
    endpoint: &mut TransportEndpoint,
    ws_stream: WsStream,
    ping_interval: Duration,
) -> MonitorResult<(Option<u16>, String)> {
    let (mut write, mut read) = ws_stream.split();

    let mut ping = (!ping_interval.is_zero()).then(|| {
        let mut ping = interval_at(Instant::now() + ping_interval, ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping
    });

    loop {
        tokio::select! {
            outgoing = endpoint.outgoing_rx.recv() => match outgoing {
                Some(text) => {
                    write.send(WsMessage::Text(text.into())).await?;
                }
                None => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    return Ok((Some(1000), "handle dropped".to_string()));
                }
            },

            incoming = read.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    endpoint.received(text.as_str().to_owned()).await;
                }
                Some(Ok(WsMessage::Binary(data))) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => endpoint.received(text).await,
                    Err(_) => warn!("Received non UTF-8 binary frame, dropping"),
                },
                Some(Ok(WsMessage::Ping(data))) => {
                    write.send(WsMessage::Pong(data)).await?;
                }
                Some(Ok(WsMessage::Pong(_))) => {
                    debug!("Received pong");
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    info!(?frame, "Received close frame");
                    return Ok(match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.as_str().to_owned()),
                        None => (None, "closed by peer".to_string()),
                    });
                }
                Some(Ok(WsMessage::Frame(_))) => {
                    // Raw frame, ignore
                }
                Some(Err(e)) => return Err(MonitorError::from(e)),
                None => return Ok((None, "stream ended".to_string())),
            },

            _ = next_ping(&mut ping) => {
                write.send(WsMessage::Ping(Vec::new().into())).await?;
                debug!("Sent ping");
            }

            _ = endpoint.close_rx.recv() => {
                info!("Close requested, closing connection");
                let _ = write.send(WsMessage::Close(None)).await;
                return Ok((Some(1000), "closed by client".to_string()));
            }
        }
    }
}

/// Waits for the next keepalive tick; pends forever when keepalive is off.
async fn next_ping(ping: &mut Option<Interval>) {
    match ping {
        Some(ping) => {
            ping.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Header value requesting `subprotocol`, or `None` when it is empty.
pub(crate) fn subprotocol_header(subprotocol: &str) -> MonitorResult<Option<HeaderValue>> {
    if subprotocol.is_empty() {
        return Ok(None);
    }
    HeaderValue::from_str(subprotocol)
        .map(Some)
        .map_err(|e| MonitorError::InvalidConfig(format!("subprotocol: {}", e)))
}

/// Builds the handshake request, asking for `subprotocol` when non-empty.
fn build_request(url: &str, subprotocol: &str) -> MonitorResult<Request> {
    let mut request = url.into_client_request()?;
    if let Some(value) = subprotocol_header(subprotocol)? {
        request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
    }
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_before_open_is_dropped() {
        let (handle, mut endpoint, _events) = TransportHandle::channel();
        assert!(!handle.send("early".into()));

        endpoint.opened().await;
        assert!(handle.send("late".into()));
        assert_eq!(endpoint.next_outgoing().await.as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn test_closed_is_emitted_once() {
        let (handle, mut endpoint, mut events) = TransportHandle::channel();
        endpoint.opened().await;
        endpoint.closed(Some(1006), "gone").await;
        endpoint.closed(Some(1000), "again").await;
        endpoint.received("after close".into()).await;
        drop(endpoint);

        assert_eq!(events.recv().await, Some(TransportEvent::Opened));
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Closed {
                code: Some(1006),
                reason: "gone".into()
            })
        );
        assert_eq!(events.recv().await, None);
        assert!(!handle.is_open());
        assert!(!handle.send("x".into()));
    }

    #[tokio::test]
    async fn test_close_request_reaches_endpoint() {
        let (handle, mut endpoint, _events) = TransportHandle::channel();
        handle.close();
        handle.close();
        endpoint.close_requested().await;
    }

    #[test]
    fn test_build_request_sets_subprotocol() {
        let request = build_request("ws://localhost:9000/client", "json.webpubsub.azure.v1").unwrap();
        assert_eq!(
            request.headers().get(SEC_WEBSOCKET_PROTOCOL).unwrap(),
            "json.webpubsub.azure.v1"
        );

        let request = build_request("ws://localhost:9000/client", "").unwrap();
        assert!(request.headers().get(SEC_WEBSOCKET_PROTOCOL).is_none());

        let err = build_request("ws://localhost:9000/client", "bad\nvalue").unwrap_err();
        assert!(err.is_config_error());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ping_interval_disables_keepalive() {
        let mut off: Option<Interval> = None;
        let waited = timeout(Duration::from_secs(3600), next_ping(&mut off)).await;
        assert!(waited.is_err());

        let period = Duration::from_secs(30);
        let mut on = Some(interval_at(Instant::now() + period, period));
        let started = Instant::now();
        next_ping(&mut on).await;
        assert!(started.elapsed() >= period);
    }

    #[tokio::test]
    async fn test_refused_connection_reports_closed() {
        let settings = TransportSettings {
            connect_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let connector = WsConnector::new(settings);

        // Port 1 is reserved and nothing listens there.
        let (handle, mut events) = connector.connect("ws://127.0.0.1:1/", "");

        match events.recv().await {
            Some(TransportEvent::Closed { code, .. }) => assert_eq!(code, None),
            other => panic!("Expected Closed, got {:?}", other),
        }
        assert!(!handle.is_open());
    }

    #[test]
    fn test_transport_settings_default() {
        let settings = TransportSettings::default();
        assert_eq!(settings.connect_timeout, Duration::from_secs(10));
        assert_eq!(settings.ping_interval, Duration::from_secs(30));
    }
}
