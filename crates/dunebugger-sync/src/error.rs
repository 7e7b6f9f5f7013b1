//! # Monitor Error Types
//!
//! Error types for configuration, transport and protocol handling.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Monitor Error Categories                           │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Protocol            │ │
//! │  │  (fatal)        │  │  (→ Backoff)    │  │  (logged, dropped)      │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Connection     │  │  InvalidMessage         │ │
//! │  │  MissingEndpoint│  │  Disconnected   │  │  InvalidPayload         │ │
//! │  │  MissingDeviceId│  │  Timeout        │  │  Serialization          │ │
//! │  │  InvalidUrl     │  │  WebSocket      │  │  Deserialization        │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  The only terminal failure a view ever sees is SessionState::Failed,   │
//! │  reached by exhausting the retry budget.                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use dunebugger_core::StoreError;
use thiserror::Error;

/// Result type alias for monitor operations.
pub type MonitorResult<T> = Result<T, MonitorError>;

/// Monitor error type covering all failures of the sync layer.
#[derive(Debug, Error)]
pub enum MonitorError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid monitor configuration.
    #[error("Invalid monitor configuration: {0}")]
    InvalidConfig(String),

    /// No pub/sub endpoint URL configured.
    #[error("Endpoint URL not configured. Set DUNEBUGGER_WSS_URL or [endpoint].url")]
    MissingEndpoint,

    /// No device id configured.
    #[error("Device ID not configured. Set DUNEBUGGER_DEVICE_ID or [device].id")]
    MissingDeviceId,

    /// No group name configured.
    #[error("Group name not configured. Set DUNEBUGGER_GROUP or [device].group")]
    MissingGroup,

    /// Endpoint URL is malformed or not a WebSocket URL.
    #[error("Invalid endpoint URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Failed to establish the WebSocket connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// WebSocket disconnected unexpectedly.
    #[error("Disconnected from endpoint")]
    Disconnected,

    /// Connection timeout.
    #[error("Connection timeout after {0} seconds")]
    Timeout(u64),

    /// TLS/SSL error.
    #[error("TLS error: {0}")]
    TlsError(String),

    /// WebSocket protocol error.
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Frame could not be decoded as an envelope.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Device payload decoded but could not be applied.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Failed to serialize an outgoing frame.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Failed to deserialize an incoming frame.
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// The session task has stopped.
    #[error("Session is shutting down")]
    ShuttingDown,
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<serde_json::Error> for MonitorError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            MonitorError::DeserializationFailed(err.to_string())
        } else {
            MonitorError::SerializationFailed(err.to_string())
        }
    }
}

impl From<url::ParseError> for MonitorError {
    fn from(err: url::ParseError) -> Self {
        MonitorError::InvalidUrl(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for MonitorError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed => MonitorError::Disconnected,
            WsError::AlreadyClosed => MonitorError::Disconnected,
            WsError::Protocol(p) => MonitorError::WebSocketError(p.to_string()),
            WsError::Io(io) => MonitorError::ConnectionFailed(io.to_string()),
            WsError::Tls(tls) => MonitorError::TlsError(tls.to_string()),
            other => MonitorError::WebSocketError(other.to_string()),
        }
    }
}

impl From<std::io::Error> for MonitorError {
    fn from(err: std::io::Error) -> Self {
        MonitorError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for MonitorError {
    fn from(err: toml::de::Error) -> Self {
        MonitorError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for MonitorError {
    fn from(err: toml::ser::Error) -> Self {
        MonitorError::ConfigSaveFailed(err.to_string())
    }
}

impl From<StoreError> for MonitorError {
    fn from(err: StoreError) -> Self {
        MonitorError::InvalidPayload(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl MonitorError {
    /// Returns true if the session may recover by reconnecting.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MonitorError::ConnectionFailed(_)
                | MonitorError::Disconnected
                | MonitorError::Timeout(_)
                | MonitorError::TlsError(_)
                | MonitorError::WebSocketError(_)
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            MonitorError::InvalidConfig(_)
                | MonitorError::MissingEndpoint
                | MonitorError::MissingDeviceId
                | MonitorError::MissingGroup
                | MonitorError::InvalidUrl(_)
                | MonitorError::ConfigLoadFailed(_)
                | MonitorError::ConfigSaveFailed(_)
        )
    }

    /// Returns true if this error comes from a malformed or unusable frame.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            MonitorError::InvalidMessage(_)
                | MonitorError::InvalidPayload(_)
                | MonitorError::SerializationFailed(_)
                | MonitorError::DeserializationFailed(_)
        )
    }
}
