//! # Session Manager
//!
//! Keeps one logical monitor session alive over a sequence of transports.
//!
//! ## State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Session State Machine                            │
//! │                                                                         │
//! │  ┌──────────────┐  connect()   ┌────────────┐   opened    ┌──────────┐ │
//! │  │ Disconnected │ ───────────► │ Connecting │ ──────────► │  Joined  │ │
//! │  └──────────────┘              └─────▲──────┘  joinGroup  └────┬─────┘ │
//! │         ▲                            │                         │       │
//! │         │ shutdown()          delay  │           device_online │       │
//! │         │                    elapsed │       request_initial_  │       │
//! │                               ┌──────┴─────┐        state      ▼       │
//! │                               │  Backoff   │            ┌──────────┐   │
//! │                               └──────▲─────┘            │  Active  │   │
//! │                                      │                  └────┬─────┘   │
//! │            closed (retries remain)   │                       │         │
//! │         ─────────────────────────────┴───────────────────────┘         │
//! │            closed (budget spent)                                        │
//! │         ──────────────────────────────────► ┌──────────┐                │
//! │                                             │  Failed  │ ─ reset() ─►   │
//! │                                             └──────────┘   Connecting   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Event Loop
//! The manager is a single task. One `tokio::select!` consumes handle
//! commands, events of the current transport and the backoff deadline, so the
//! session and the store are never mutated concurrently. Events from a
//! transport that has been replaced are never seen: its receiver is dropped
//! together with the handle.
//!
//! Frames are applied in delivery order. There is no reordering and no
//! deduplication.

use backoff::backoff::Backoff;
use chrono::{DateTime, Utc};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use dunebugger_core::{ListenerId, StateStore, StoreChange, StoreResult, StoreSnapshot};

use crate::config::MonitorConfig;
use crate::error::{MonitorError, MonitorResult};
use crate::protocol::{ClientFrame, DevicePayload, Envelope, SystemEvent};
use crate::transport::{Connector, TransportEvent, TransportHandle};

const COMMAND_BUFFER: usize = 16;

/// State store shared between the session task and views.
///
/// Listeners run while the write lock is held; they get the store as an
/// argument and must not lock it again.
pub type SharedStore = Arc<std::sync::RwLock<StateStore>>;

// =============================================================================
// Session State
// =============================================================================

/// Lifecycle state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Not connected and not trying to.
    #[default]
    Disconnected,

    /// Waiting for a transport to open.
    Connecting,

    /// Transport open, group join sent.
    Joined,

    /// Device announced itself; initial state requested.
    Active,

    /// Waiting out the retry delay.
    Backoff,

    /// Retry budget exhausted. Only `reset()` leaves this state.
    Failed,
}

impl SessionState {
    /// Returns true while a transport is open.
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Joined | SessionState::Active)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Joined => write!(f, "joined"),
            SessionState::Active => write!(f, "active"),
            SessionState::Backoff => write!(f, "backoff"),
            SessionState::Failed => write!(f, "failed"),
        }
    }
}

// =============================================================================
// Session Status
// =============================================================================

/// Read-only snapshot of the session for views.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStatus {
    pub state: SessionState,

    /// Connection id assigned by the endpoint, cleared on disconnect.
    pub connection_id: Option<String>,

    pub is_connected: bool,

    /// Set once the configured device announces itself on this connection.
    pub is_device_online: bool,

    /// Consecutive failed attempts since the last successful open.
    pub retry_count: u32,

    pub last_error: Option<String>,

    pub last_connected_at: Option<DateTime<Utc>>,

    /// Delay of the pending reconnect while in `Backoff`.
    pub next_retry_in: Option<Duration>,
}

// =============================================================================
// Event Emitter Trait
// =============================================================================

/// Receives session notifications (implemented by the host application).
pub trait SessionEventEmitter: Send + Sync {
    /// Called after every status change.
    fn emit_status(&self, status: &SessionStatus);

    /// Called when a connection is lost. `retryable` is false once the
    /// session has failed.
    fn emit_error(&self, message: &str, retryable: bool);
}

/// No-op event emitter.
pub struct NoOpEmitter;

impl SessionEventEmitter for NoOpEmitter {
    fn emit_status(&self, _status: &SessionStatus) {}
    fn emit_error(&self, _message: &str, _retryable: bool) {}
}

// =============================================================================
// Commands
// =============================================================================

#[derive(Debug)]
enum SessionCommand {
    Connect,
    Reset,
    Shutdown(oneshot::Sender<()>),
}

// =============================================================================
// Session Handle
// =============================================================================

/// Cloneable handle for controlling a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands_tx: mpsc::Sender<SessionCommand>,
    status: Arc<RwLock<SessionStatus>>,
    store: SharedStore,
}

impl SessionHandle {
    /// Starts connecting. Ignored unless the session is disconnected.
    pub async fn connect(&self) -> MonitorResult<()> {
        self.send(SessionCommand::Connect).await
    }

    /// Drops any connection or pending retry, zeroes the retry counter and
    /// connects again. Works from every state, including `Failed`.
    pub async fn reset(&self) -> MonitorResult<()> {
        self.send(SessionCommand::Reset).await
    }

    /// Cancels the pending retry, closes the transport and stops the session
    /// task. Returns once the task has torn down.
    pub async fn shutdown(&self) -> MonitorResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send(SessionCommand::Shutdown(ack_tx)).await?;
        ack_rx.await.map_err(|_| MonitorError::ShuttingDown)
    }

    pub async fn status(&self) -> SessionStatus {
        self.status.read().await.clone()
    }

    /// Registers a store listener.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&StoreChange, &StateStore) + Send + Sync + 'static,
    {
        self.store
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> StoreResult<()> {
        self.store
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .unsubscribe(id)
    }

    /// Owned copy of the store contents.
    pub fn snapshot(&self) -> StoreSnapshot {
        self.store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot()
    }

    async fn send(&self, command: SessionCommand) -> MonitorResult<()> {
        self.commands_tx
            .send(command)
            .await
            .map_err(|_| MonitorError::ShuttingDown)
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for spawning a session.
pub struct SessionBuilder {
    config: MonitorConfig,
    emitter: Option<Arc<dyn SessionEventEmitter>>,
    store: Option<SharedStore>,
}

impl SessionBuilder {
    pub fn new(config: MonitorConfig) -> Self {
        SessionBuilder {
            config,
            emitter: None,
            store: None,
        }
    }

    /// Sets the event emitter.
    pub fn with_emitter(mut self, emitter: Arc<dyn SessionEventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Uses an existing store instead of creating one from `[logs]`.
    pub fn with_store(mut self, store: SharedStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Validates the config and spawns the session task.
    ///
    /// The session starts `Disconnected`; call [`SessionHandle::connect`].
    /// Must be called from within a tokio runtime.
    pub fn spawn<C: Connector>(self, connector: C) -> MonitorResult<SessionHandle> {
        self.config.validate()?;

        let store = self.store.unwrap_or_else(|| {
            Arc::new(std::sync::RwLock::new(StateStore::new(self.config.logs.capacity)))
        });
        let emitter = self.emitter.unwrap_or_else(|| Arc::new(NoOpEmitter));
        let status = Arc::new(RwLock::new(SessionStatus::default()));
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);

        let manager = SessionManager {
            backoff: self.config.retry.backoff(),
            config: self.config,
            connector,
            store: store.clone(),
            status: status.clone(),
            emitter,
            commands_rx,
            transport: None,
            events_rx: None,
            retry_at: None,
            session: SessionStatus::default(),
        };

        tokio::spawn(manager.run());

        Ok(SessionHandle {
            commands_tx,
            status,
            store,
        })
    }
}

// =============================================================================
// Session Manager
// =============================================================================

/// The session task. Created through [`SessionBuilder`].
pub struct SessionManager<C: Connector> {
    config: MonitorConfig,
    connector: C,
    store: SharedStore,
    status: Arc<RwLock<SessionStatus>>,
    emitter: Arc<dyn SessionEventEmitter>,
    commands_rx: mpsc::Receiver<SessionCommand>,

    /// Current transport and its events. Both are dropped together.
    transport: Option<TransportHandle>,
    events_rx: Option<mpsc::Receiver<TransportEvent>>,

    /// Deadline of the pending reconnect.
    retry_at: Option<Instant>,
    backoff: Box<dyn Backoff + Send + Sync>,

    /// Authoritative session state, published to `status` on change.
    session: SessionStatus,
}

impl<C: Connector> SessionManager<C> {
    async fn run(mut self) {
        info!(
            device_id = %self.config.device_id(),
            group = %self.config.group(),
            "Session manager started"
        );

        loop {
            tokio::select! {
                command = self.commands_rx.recv() => match command {
                    Some(SessionCommand::Connect) => self.handle_connect().await,
                    Some(SessionCommand::Reset) => self.handle_reset().await,
                    Some(SessionCommand::Shutdown(ack)) => {
                        self.teardown().await;
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        debug!("All session handles dropped");
                        self.teardown().await;
                        break;
                    }
                },

                event = next_event(&mut self.events_rx) => {
                    self.handle_transport_event(event).await;
                }

                _ = retry_deadline(self.retry_at) => {
                    self.retry_at = None;
                    self.start_attempt().await;
                }
            }
        }

        info!("Session manager stopped");
    }

    // =========================================================================
    // Commands
    // =========================================================================

    async fn handle_connect(&mut self) {
        match self.session.state {
            SessionState::Disconnected => self.start_attempt().await,
            SessionState::Failed => {
                warn!("Session has failed, use reset() to reconnect");
            }
            state => debug!(%state, "Connect ignored, session already running"),
        }
    }

    async fn handle_reset(&mut self) {
        info!(state = %self.session.state, "Resetting session");
        self.retry_at = None;
        self.drop_transport();
        self.backoff.reset();
        self.session.retry_count = 0;
        self.session.last_error = None;
        self.start_attempt().await;
    }

    async fn teardown(&mut self) {
        self.retry_at = None;
        self.drop_transport();
        self.session.next_retry_in = None;
        self.set_state(SessionState::Disconnected).await;
    }

    // =========================================================================
    // Connection Lifecycle
    // =========================================================================

    async fn start_attempt(&mut self) {
        self.drop_transport();
        self.session.next_retry_in = None;

        let (handle, events_rx) = self
            .connector
            .connect(self.config.url(), &self.config.endpoint.subprotocol);

        info!(
            transport = %handle.id(),
            attempt = self.session.retry_count + 1,
            max_attempts = self.config.retry.max_attempts,
            "Connecting to endpoint"
        );

        self.transport = Some(handle);
        self.events_rx = Some(events_rx);
        self.set_state(SessionState::Connecting).await;
    }

    async fn handle_transport_event(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Opened) => self.handle_opened().await,
            Some(TransportEvent::Received(text)) => self.handle_frame(&text).await,
            Some(TransportEvent::Closed { code, reason }) => {
                self.handle_closed(code, &reason).await
            }
            None => self.handle_closed(None, "transport stopped").await,
        }
    }

    async fn handle_opened(&mut self) {
        if self.session.state != SessionState::Connecting {
            debug!(state = %self.session.state, "Ignoring opened outside Connecting");
            return;
        }

        info!("Transport opened, joining group");
        self.session.retry_count = 0;
        self.backoff.reset();
        self.session.is_connected = true;
        self.session.last_connected_at = Some(Utc::now());
        self.session.last_error = None;

        self.send_frame(&ClientFrame::join_group(self.config.group()));
        self.set_state(SessionState::Joined).await;
    }

    async fn handle_closed(&mut self, code: Option<u16>, reason: &str) {
        self.drop_transport();
        self.session.connection_id = None;
        self.session.is_connected = false;
        self.session.is_device_online = false;
        self.session.retry_count += 1;

        let message = match code {
            Some(code) => format!("Connection closed ({}): {}", code, reason),
            None => format!("Connection closed: {}", reason),
        };
        self.session.last_error = Some(message.clone());

        if self.session.retry_count >= self.config.retry.max_attempts {
            error!(
                attempts = self.session.retry_count,
                reason = %reason,
                "Retry budget exhausted, session failed"
            );
            self.session.next_retry_in = None;
            self.set_state(SessionState::Failed).await;
            self.emitter.emit_error(&message, false);
            return;
        }

        let delay = self
            .backoff
            .next_backoff()
            .unwrap_or_else(|| self.config.retry.delay());
        warn!(
            ?code,
            reason = %reason,
            attempt = self.session.retry_count,
            ?delay,
            "Connection lost, scheduling reconnect"
        );

        self.retry_at = Some(Instant::now() + delay);
        self.session.next_retry_in = Some(delay);
        self.set_state(SessionState::Backoff).await;
        self.emitter.emit_error(&message, true);
    }

    // =========================================================================
    // Frame Dispatch
    // =========================================================================

    async fn handle_frame(&mut self, text: &str) {
        let envelope = match Envelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                dropped(&e, "envelope");
                return;
            }
        };

        debug!(msg_type = envelope.type_name(), "Received envelope");

        match envelope {
            Envelope::System(event) => self.handle_system(event).await,
            Envelope::Message(message) => match message.payload() {
                Ok(payload) => self.handle_payload(payload).await,
                Err(e) => dropped(&e, "message"),
            },
            Envelope::Ack(ack) => {
                if ack.success {
                    debug!(ack_id = ack.ack_id, "Request acknowledged");
                } else {
                    warn!(ack_id = ack.ack_id, error = ?ack.error, "Request rejected by endpoint");
                }
            }
            Envelope::Unknown => debug!("Ignoring envelope of unknown type"),
        }
    }

    async fn handle_system(&mut self, event: SystemEvent) {
        if event.event.as_deref() == Some("disconnected") {
            info!(message = ?event.message, "Endpoint announced disconnect");
        }

        if let Some(connection_id) = event.connection_id {
            info!(connection_id = %connection_id, "Connection id assigned");
            self.session.connection_id = Some(connection_id);
            self.publish().await;
        }
    }

    async fn handle_payload(&mut self, payload: DevicePayload) {
        let state = self.session.state;
        let accepts_data = matches!(state, SessionState::Joined | SessionState::Active);

        match payload {
            DevicePayload::DeviceOnline { device_id } => {
                if device_id != self.config.device_id() {
                    debug!(device_id = %device_id, "Ignoring device_online for another device");
                    return;
                }
                if !accepts_data {
                    debug!(%state, "Ignoring device_online outside a joined session");
                    return;
                }

                info!(device_id = %device_id, "Device online, requesting initial state");
                self.session.is_device_online = true;
                self.send_frame(&ClientFrame::request_initial_state(self.config.device_id()));
                self.set_state(SessionState::Active).await;
            }

            DevicePayload::InitialState { gpio_states, logs } if accepts_data => {
                debug!(gpio_count = gpio_states.len(), log_count = logs.len(), "Applying initial state");
                if let Err(e) = self.update_store(|store| store.apply_initial_state(gpio_states, logs)) {
                    dropped(&MonitorError::from(e), "initial_state");
                }
            }

            DevicePayload::GpioUpdate { gpio, value } if accepts_data => {
                if let Err(e) = self.update_store(|store| store.apply_gpio_update(gpio, value)) {
                    dropped(&MonitorError::from(e), "gpio_update");
                }
            }

            DevicePayload::Message { data } if accepts_data => {
                self.update_store(|store| store.append_log(data));
            }

            DevicePayload::Unknown => warn!("Dropping device payload of unknown type"),

            other => debug!(
                msg_type = other.type_name(),
                %state,
                "Ignoring device payload outside a joined session"
            ),
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn send_frame(&self, frame: &ClientFrame) {
        let Some(transport) = &self.transport else {
            warn!(msg_type = frame.type_name(), "No transport, dropping frame");
            return;
        };
        if let Err(e) = transport.send_frame(frame) {
            warn!(?e, "Failed to send frame");
        }
    }

    fn update_store<T>(&self, f: impl FnOnce(&mut StateStore) -> T) -> T {
        let mut store = self.store.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut store)
    }

    /// Closes and forgets the current transport, dropping its receiver.
    fn drop_transport(&mut self) {
        if let Some(transport) = self.transport.take() {
            debug!(transport = %transport.id(), "Closing transport");
            transport.close();
        }
        self.events_rx = None;
        self.session.is_connected = false;
    }

    async fn set_state(&mut self, state: SessionState) {
        if self.session.state != state {
            debug!(from = %self.session.state, to = %state, "Session state change");
        }
        self.session.state = state;
        if !state.is_connected() {
            self.session.connection_id = None;
            self.session.is_device_online = false;
        }
        self.publish().await;
    }

    async fn publish(&mut self) {
        *self.status.write().await = self.session.clone();
        self.emitter.emit_status(&self.session);
    }
}

/// Next event of the current transport; pends forever without one.
async fn next_event(
    events_rx: &mut Option<mpsc::Receiver<TransportEvent>>,
) -> Option<TransportEvent> {
    match events_rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Logs a frame the session could not use. The session carries on either way.
fn dropped(err: &MonitorError, frame: &str) {
    if err.is_protocol_error() {
        warn!(error = %err, frame, "Dropping frame");
    } else {
        error!(error = %err, frame, "Dropping frame after unexpected error");
    }
}

/// Sleeps until the retry deadline; pends forever without one.
async fn retry_deadline(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
