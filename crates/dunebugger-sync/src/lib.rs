//! # dunebugger-sync: Session Engine for the Dunebugger Monitor
//!
//! This crate keeps one logical session open to the Web PubSub endpoint the
//! device publishes to, and feeds what it hears into a
//! [`dunebugger_core::StateStore`].
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Session Engine Architecture                        │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                 SessionManager (single tokio task)               │  │
//! │  │                                                                  │  │
//! │  │  commands ──┐                                                    │  │
//! │  │  transport ─┼──► select! ──► dispatch ──► StateStore ──► views   │  │
//! │  │  backoff ───┘                                                    │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │ connect / send / close                  │
//! │                               ▼                                         │
//! │  ┌────────────────────────────────────────────────────────────────┐    │
//! │  │ Connector → TransportHandle                                    │    │
//! │  │ WsConnector: tokio-tungstenite, subprotocol                    │    │
//! │  │ json.webpubsub.azure.v1, one attempt per connect               │    │
//! │  └────────────────────────────────────────────────────────────────┘    │
//! │                                                                         │
//! │  STATUS (to the host via SessionEventEmitter):                         │
//! │  • emit_status - every SessionStatus change                            │
//! │  • emit_error  - lost connection (retryable) or failed (final)         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`config`] - Monitor configuration (endpoint, device, retry, logs)
//! - [`error`] - Monitor error types
//! - [`protocol`] - Outgoing frames, envelopes and device payloads
//! - [`session`] - `SessionManager` state machine and `SessionHandle`
//! - [`transport`] - `Connector` seam and the WebSocket client
//!
//! ## Usage
//!
//! ```rust,ignore
//! use dunebugger_sync::{MonitorConfig, SessionBuilder, WsConnector};
//!
//! let config = MonitorConfig::load(None)?;
//! let connector = WsConnector::new(config.transport_settings());
//!
//! let session = SessionBuilder::new(config).spawn(connector)?;
//! session.subscribe(|change, _store| println!("{change:?}"));
//! session.connect().await?;
//!
//! let status = session.status().await;
//! println!("State: {}", status.state);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod error;
pub mod protocol;
pub mod session;
pub mod transport;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{MonitorConfig, RetryPolicy};
pub use error::{MonitorError, MonitorResult};
pub use protocol::{ClientFrame, DevicePayload, Envelope, WEBPUBSUB_SUBPROTOCOL};
pub use session::{
    NoOpEmitter, SessionBuilder, SessionEventEmitter, SessionHandle, SessionState, SessionStatus,
    SharedStore,
};
pub use transport::{Connector, TransportEvent, TransportHandle, TransportSettings, WsConnector};
