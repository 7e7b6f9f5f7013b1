//! # Monitor Configuration
//!
//! Configuration for the monitor session.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     DUNEBUGGER_WSS_URL=wss://hub.example.net/client/hubs/dunebugger    │
//! │     DUNEBUGGER_DEVICE_ID=raspberry123                                  │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     --config <path>, or                                                │
//! │     ~/.config/dunebugger/monitor.toml (Linux)                          │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     fixed 5000 ms retry, 5 attempts, 1000 log lines                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [endpoint]
//! url = "wss://hub.example.net/client/hubs/dunebugger?access_token=..."
//! subprotocol = "json.webpubsub.azure.v1"
//! connect_timeout_secs = 10
//! ping_interval_secs = 30
//!
//! [device]
//! id = "raspberry123"
//! group = "velasquez"
//!
//! [retry]
//! policy = "fixed"     # fixed | exponential
//! delay_ms = 5000
//! max_attempts = 5
//! max_delay_secs = 60  # exponential only
//!
//! [logs]
//! capacity = 1000      # 0 keeps every line
//! ```

use backoff::backoff::{Backoff, Constant};
use backoff::ExponentialBackoffBuilder;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{MonitorError, MonitorResult};
use crate::protocol::WEBPUBSUB_SUBPROTOCOL;
use crate::transport::{subprotocol_header, TransportSettings};

// =============================================================================
// Endpoint Settings
// =============================================================================

/// Where and how to connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSettings {
    /// Pre-authorized `ws://` or `wss://` URL of the pub/sub service.
    #[serde(default)]
    pub url: Option<String>,

    /// Subprotocol requested during the handshake. Empty requests none.
    #[serde(default = "default_subprotocol")]
    pub subprotocol: String,

    /// Handshake timeout (seconds). Must be non-zero.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Keepalive ping interval (seconds). Must be non-zero.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
}

fn default_subprotocol() -> String {
    WEBPUBSUB_SUBPROTOCOL.to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_ping_interval() -> u64 {
    30
}

impl Default for EndpointSettings {
    fn default() -> Self {
        EndpointSettings {
            url: None,
            subprotocol: default_subprotocol(),
            connect_timeout_secs: default_connect_timeout(),
            ping_interval_secs: default_ping_interval(),
        }
    }
}

// =============================================================================
// Device Settings
// =============================================================================

/// The device being watched and the group it publishes to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Identifier the device announces in `device_online`.
    #[serde(default = "default_device_id")]
    pub id: String,

    /// Pub/sub group shared with the device.
    #[serde(default = "default_group")]
    pub group: String,
}

fn default_device_id() -> String {
    "raspberry123".to_string()
}

fn default_group() -> String {
    "velasquez".to_string()
}

impl Default for DeviceSettings {
    fn default() -> Self {
        DeviceSettings {
            id: default_device_id(),
            group: default_group(),
        }
    }
}

// =============================================================================
// Retry Settings
// =============================================================================

/// Delay schedule between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Same delay before every attempt.
    #[default]
    Fixed,

    /// Growing, jittered delay capped at `max_delay_secs`.
    Exponential,
}

impl std::fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryPolicy::Fixed => write!(f, "fixed"),
            RetryPolicy::Exponential => write!(f, "exponential"),
        }
    }
}

impl std::str::FromStr for RetryPolicy {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fixed" | "constant" => Ok(RetryPolicy::Fixed),
            "exponential" | "backoff" => Ok(RetryPolicy::Exponential),
            other => Err(MonitorError::InvalidConfig(format!(
                "Unknown retry policy: '{}'. Valid options: fixed, exponential",
                other
            ))),
        }
    }
}

/// Reconnect behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default)]
    pub policy: RetryPolicy,

    /// Delay before a reconnect (milliseconds). Initial delay for
    /// the exponential policy.
    #[serde(default = "default_retry_delay")]
    pub delay_ms: u64,

    /// Consecutive failed attempts tolerated before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Upper bound on a single exponential delay (seconds).
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
}

fn default_retry_delay() -> u64 {
    5000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_max_delay() -> u64 {
    60
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            policy: RetryPolicy::default(),
            delay_ms: default_retry_delay(),
            max_attempts: default_max_attempts(),
            max_delay_secs: default_max_delay(),
        }
    }
}

impl RetrySettings {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Builds the delay schedule for this policy.
    ///
    /// Neither schedule gives up on its own; the attempt budget is
    /// `max_attempts`.
    pub fn backoff(&self) -> Box<dyn Backoff + Send + Sync> {
        match self.policy {
            RetryPolicy::Fixed => Box::new(Constant::new(self.delay())),
            RetryPolicy::Exponential => Box::new(
                ExponentialBackoffBuilder::new()
                    .with_initial_interval(self.delay())
                    .with_max_interval(Duration::from_secs(self.max_delay_secs))
                    .with_max_elapsed_time(None)
                    .build(),
            ),
        }
    }
}

// =============================================================================
// Log Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    /// Lines kept in the log buffer. 0 keeps every line.
    #[serde(default = "default_log_capacity")]
    pub capacity: usize,
}

fn default_log_capacity() -> usize {
    dunebugger_core::DEFAULT_LOG_CAPACITY
}

impl Default for LogSettings {
    fn default() -> Self {
        LogSettings {
            capacity: default_log_capacity(),
        }
    }
}

// =============================================================================
// Main Monitor Configuration
// =============================================================================

/// Complete monitor configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub endpoint: EndpointSettings,

    #[serde(default)]
    pub device: DeviceSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub logs: LogSettings,
}

impl MonitorConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (monitor.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> MonitorResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading monitor config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> MonitorResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| MonitorError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| MonitorError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| MonitorError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Monitor config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> MonitorResult<()> {
        let raw = self
            .endpoint
            .url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or(MonitorError::MissingEndpoint)?;

        let parsed = url::Url::parse(raw)?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(MonitorError::InvalidUrl(format!(
                "Endpoint URL must start with ws:// or wss://, got scheme: {}",
                parsed.scheme()
            )));
        }

        subprotocol_header(&self.endpoint.subprotocol)?;

        if self.endpoint.connect_timeout_secs == 0 {
            return Err(MonitorError::InvalidConfig(
                "connect_timeout_secs must be greater than 0".into(),
            ));
        }

        if self.endpoint.ping_interval_secs == 0 {
            return Err(MonitorError::InvalidConfig(
                "ping_interval_secs must be greater than 0".into(),
            ));
        }

        if self.device.id.trim().is_empty() {
            return Err(MonitorError::MissingDeviceId);
        }

        if self.device.group.trim().is_empty() {
            return Err(MonitorError::MissingGroup);
        }

        if self.retry.max_attempts == 0 {
            return Err(MonitorError::InvalidConfig(
                "max_attempts must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies `DUNEBUGGER_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from an arbitrary key lookup.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("DUNEBUGGER_WSS_URL") {
            debug!("Overriding endpoint URL from environment");
            self.endpoint.url = Some(url);
        }

        if let Some(subprotocol) = lookup("DUNEBUGGER_SUBPROTOCOL") {
            self.endpoint.subprotocol = subprotocol;
        }

        if let Some(id) = lookup("DUNEBUGGER_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = id;
        }

        if let Some(group) = lookup("DUNEBUGGER_GROUP") {
            debug!(group = %group, "Overriding group from environment");
            self.device.group = group;
        }

        if let Some(attempts) = lookup("DUNEBUGGER_MAX_ATTEMPTS") {
            match attempts.parse::<u32>() {
                Ok(n) => self.retry.max_attempts = n,
                Err(_) => warn!(value = %attempts, "Ignoring invalid DUNEBUGGER_MAX_ATTEMPTS"),
            }
        }

        if let Some(delay) = lookup("DUNEBUGGER_RETRY_DELAY_MS") {
            match delay.parse::<u64>() {
                Ok(ms) => self.retry.delay_ms = ms,
                Err(_) => warn!(value = %delay, "Ignoring invalid DUNEBUGGER_RETRY_DELAY_MS"),
            }
        }

        if let Some(policy) = lookup("DUNEBUGGER_RETRY_POLICY") {
            match policy.parse() {
                Ok(parsed) => self.retry.policy = parsed,
                Err(e) => warn!(error = %e, "Ignoring invalid DUNEBUGGER_RETRY_POLICY"),
            }
        }

        if let Some(capacity) = lookup("DUNEBUGGER_LOG_CAPACITY") {
            match capacity.parse::<usize>() {
                Ok(n) => self.logs.capacity = n,
                Err(_) => warn!(value = %capacity, "Ignoring invalid DUNEBUGGER_LOG_CAPACITY"),
            }
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("net", "dunebugger", "dunebugger")
            .map(|dirs| dirs.config_dir().join("monitor.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Returns the endpoint URL, or an empty string when unset.
    pub fn url(&self) -> &str {
        self.endpoint.url.as_deref().unwrap_or_default()
    }

    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    pub fn group(&self) -> &str {
        &self.device.group
    }

    /// Transport timing derived from `[endpoint]`.
    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            connect_timeout: Duration::from_secs(self.endpoint.connect_timeout_secs),
            ping_interval: Duration::from_secs(self.endpoint.ping_interval_secs),
        }
    }
}
