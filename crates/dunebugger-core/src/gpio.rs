//! # GPIO Values
//!
//! The device reports each GPIO line as a loose JSON token: usually a string
//! such as `"HIGH"` or `"LOW"`, sometimes a number or a boolean. The monitor
//! stores whatever arrives and never interprets it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Mapping from GPIO identifier to its last reported value.
pub type GpioMap = HashMap<String, GpioValue>;

/// Last reported value of one GPIO line.
///
/// Deserialized untagged, so `"HIGH"`, `1` and `true` all decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GpioValue {
    /// Boolean level.
    Bool(bool),

    /// Numeric level or reading.
    Number(serde_json::Number),

    /// Symbolic value (`"HIGH"`, `"LOW"`, `"on"`, ...).
    Text(String),
}

impl fmt::Display for GpioValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpioValue::Bool(b) => write!(f, "{}", b),
            GpioValue::Number(n) => write!(f, "{}", n),
            GpioValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for GpioValue {
    fn from(value: &str) -> Self {
        GpioValue::Text(value.to_string())
    }
}

impl From<String> for GpioValue {
    fn from(value: String) -> Self {
        GpioValue::Text(value)
    }
}

impl From<i64> for GpioValue {
    fn from(value: i64) -> Self {
        GpioValue::Number(value.into())
    }
}

impl From<bool> for GpioValue {
    fn from(value: bool) -> Self {
        GpioValue::Bool(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untagged_decoding() {
        let v: GpioValue = serde_json::from_str("\"HIGH\"").unwrap();
        assert_eq!(v, GpioValue::from("HIGH"));

        let v: GpioValue = serde_json::from_str("1").unwrap();
        assert_eq!(v, GpioValue::from(1i64));

        let v: GpioValue = serde_json::from_str("false").unwrap();
        assert_eq!(v, GpioValue::from(false));
    }

    #[test]
    fn test_display() {
        assert_eq!(GpioValue::from("LOW").to_string(), "LOW");
        assert_eq!(GpioValue::from(0i64).to_string(), "0");
        assert_eq!(GpioValue::from(true).to_string(), "true");
    }

    #[test]
    fn test_serializes_back_to_plain_token() {
        let json = serde_json::to_string(&GpioValue::from("HIGH")).unwrap();
        assert_eq!(json, "\"HIGH\"");
        let json = serde_json::to_string(&GpioValue::from(3i64)).unwrap();
        assert_eq!(json, "3");
    }
}
