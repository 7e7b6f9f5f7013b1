//! # Pub/Sub Protocol Messages
//!
//! Frames exchanged with the pub/sub endpoint and the device payloads they
//! carry.
//!
//! ## Protocol Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Monitor ⇄ Endpoint Frames                           │
//! │                                                                         │
//! │  OUTGOING (ClientFrame)                                                │
//! │  ──────────────────────                                                │
//! │  { "type": "joinGroup", "group": "..." }                               │
//! │  { "type": "request_initial_state", "device_id": "..." }               │
//! │                                                                         │
//! │  INCOMING (Envelope, outer level)                                      │
//! │  ────────────────────────────────                                      │
//! │  { "type": "system", "event": "connected", "connectionId": "..." }     │
//! │  { "type": "message", "data": "<JSON text>" | { ... } }                │
//! │  { "type": "ack", "ackId": 1, "success": true }                        │
//! │                                                                         │
//! │  DEVICE PAYLOAD (inside message.data, inner level)                     │
//! │  ─────────────────────────────────────────────                         │
//! │  { "type": "device_online", "device_id": "..." }                       │
//! │  { "type": "initial_state", "gpio_states": {..}, "logs": [..] }        │
//! │  { "type": "gpio_update", "gpio": "...", "value": ... }                │
//! │  { "type": "message", "data": "log line" }                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The two `type` fields live at different levels and are decoded by two
//! different enums. A `message` envelope is only unwrapped into a
//! [`DevicePayload`] by [`MessageEnvelope::payload`].

use dunebugger_core::{GpioMap, GpioValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MonitorError, MonitorResult};

/// Subprotocol requested during the WebSocket handshake.
pub const WEBPUBSUB_SUBPROTOCOL: &str = "json.webpubsub.azure.v1";

// =============================================================================
// Outgoing Frames
// =============================================================================

/// Frames sent by the monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    /// Join the pub/sub group the device publishes to.
    #[serde(rename = "joinGroup")]
    JoinGroup {
        group: String,
        #[serde(rename = "ackId", default, skip_serializing_if = "Option::is_none")]
        ack_id: Option<u64>,
    },

    /// Ask the device to publish its full state.
    #[serde(rename = "request_initial_state")]
    RequestInitialState { device_id: String },
}

impl ClientFrame {
    pub fn join_group(group: &str) -> Self {
        ClientFrame::JoinGroup {
            group: group.to_string(),
            ack_id: None,
        }
    }

    pub fn request_initial_state(device_id: &str) -> Self {
        ClientFrame::RequestInitialState {
            device_id: device_id.to_string(),
        }
    }

    /// Serializes the frame to JSON text.
    pub fn to_json(&self) -> MonitorResult<String> {
        serde_json::to_string(self).map_err(|e| MonitorError::SerializationFailed(e.to_string()))
    }

    /// Short name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            ClientFrame::JoinGroup { .. } => "joinGroup",
            ClientFrame::RequestInitialState { .. } => "request_initial_state",
        }
    }
}

// =============================================================================
// Incoming Envelopes
// =============================================================================

/// Outer frame delivered by the endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    /// Connection lifecycle notice from the endpoint itself.
    System(SystemEvent),

    /// Data published to a group.
    Message(MessageEnvelope),

    /// Acknowledgement of a frame sent with an `ackId`.
    Ack(AckEvent),

    /// Any other outer type. Logged and dropped.
    #[serde(other)]
    Unknown,
}

impl Envelope {
    /// Decodes one text frame.
    pub fn from_json(text: &str) -> MonitorResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Envelope::System(_) => "system",
            Envelope::Message(_) => "message",
            Envelope::Ack(_) => "ack",
            Envelope::Unknown => "unknown",
        }
    }
}

/// `system` envelope body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemEvent {
    /// `connected` or `disconnected`.
    #[serde(default)]
    pub event: Option<String>,

    #[serde(default)]
    pub connection_id: Option<String>,

    #[serde(default)]
    pub user_id: Option<String>,

    /// Reason text on `disconnected`.
    #[serde(default)]
    pub message: Option<String>,
}

/// `message` envelope body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    /// `group` or `server`.
    #[serde(default)]
    pub from: Option<String>,

    #[serde(default)]
    pub group: Option<String>,

    /// `json`, `text` or `binary`.
    #[serde(default)]
    pub data_type: Option<String>,

    /// Device payload, either as JSON text or inline JSON.
    pub data: Value,
}

impl MessageEnvelope {
    /// Wraps a device payload the way the device publishes it (JSON text).
    pub fn from_payload(payload: &DevicePayload) -> MonitorResult<Self> {
        Ok(MessageEnvelope {
            from: Some("group".to_string()),
            group: None,
            data_type: Some("text".to_string()),
            data: Value::String(payload.to_json()?),
        })
    }

    /// Decodes the nested device payload.
    pub fn payload(&self) -> MonitorResult<DevicePayload> {
        let decoded = match &self.data {
            Value::String(text) => serde_json::from_str(text),
            inline => DevicePayload::deserialize(inline),
        };
        decoded.map_err(|e| MonitorError::InvalidMessage(format!("device payload: {}", e)))
    }
}

/// `ack` envelope body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckEvent {
    pub ack_id: u64,
    pub success: bool,
    #[serde(default)]
    pub error: Option<AckError>,
}

/// Failure detail of an `ack`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckError {
    pub name: String,
    #[serde(default)]
    pub message: String,
}

// =============================================================================
// Device Payloads
// =============================================================================

/// Payload published by the device, nested in a `message` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DevicePayload {
    /// The device (re)connected to the group.
    DeviceOnline { device_id: String },

    /// Full GPIO map and log history, in reply to `request_initial_state`.
    InitialState {
        #[serde(default)]
        gpio_states: GpioMap,
        #[serde(default)]
        logs: Vec<String>,
    },

    /// One GPIO changed.
    GpioUpdate { gpio: String, value: GpioValue },

    /// One log line.
    Message { data: String },

    /// Unrecognized inner type.
    #[serde(other)]
    Unknown,
}

impl DevicePayload {
    pub fn to_json(&self) -> MonitorResult<String> {
        serde_json::to_string(self).map_err(|e| MonitorError::SerializationFailed(e.to_string()))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            DevicePayload::DeviceOnline { .. } => "device_online",
            DevicePayload::InitialState { .. } => "initial_state",
            DevicePayload::GpioUpdate { .. } => "gpio_update",
            DevicePayload::Message { .. } => "message",
            DevicePayload::Unknown => "unknown",
        }
    }
}
