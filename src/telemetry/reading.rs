//! Telemetry reading model shared by the history and live paths

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

/// Numeric fields carried by a telemetry payload. Either field may be unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Measurements {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
}

/// Outcome of decoding the payload of a reading
///
/// A payload that fails to decode does not drop the reading: it is kept as
/// `RawOnly` with the decode failure, and the numeric fields read as unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PayloadValues {
    Decoded(Measurements),
    RawOnly { reason: String },
}

/// One telemetry sample, decoded or partially decoded
///
/// `timestamp` is `None` when the source sent a time that could not be
/// parsed; the reading is still kept in its arrival position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub device_id: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub raw_payload: String,
    pub values: PayloadValues,
}

impl Reading {
    pub fn temperature(&self) -> Option<f64> {
        match &self.values {
            PayloadValues::Decoded(m) => m.temperature,
            PayloadValues::RawOnly { .. } => None,
        }
    }

    pub fn humidity(&self) -> Option<f64> {
        match &self.values {
            PayloadValues::Decoded(m) => m.humidity,
            PayloadValues::RawOnly { .. } => None,
        }
    }

    /// True when the payload decoded cleanly
    pub fn is_decoded(&self) -> bool {
        matches!(self.values, PayloadValues::Decoded(_))
    }

    /// Local wall-clock time used on chart axes (HH:MM:SS)
    pub fn display_time(&self) -> String {
        match self.timestamp {
            Some(ts) => ts.with_timezone(&Local).format("%H:%M:%S").to_string(),
            None => "--:--:--".to_string(),
        }
    }
}

/// Which devices a history query or subscription covers
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    AllDevices,
    Device(String),
}

impl Scope {
    /// Build a scope from an optional device id (empty ids mean all devices)
    pub fn from_device_id(device_id: Option<String>) -> Self {
        match device_id {
            Some(id) if !id.trim().is_empty() => Scope::Device(id.trim().to_string()),
            _ => Scope::AllDevices,
        }
    }

    /// Push topic for this scope
    pub fn topic(&self) -> String {
        match self {
            Scope::AllDevices => "/topic/telemetry".to_string(),
            Scope::Device(id) => format!("/topic/telemetry/{}", id),
        }
    }

    /// Query path (relative to the API base URL) for this scope
    pub fn query_path(&self) -> String {
        match self {
            Scope::AllDevices => "/api/devices/telemetry".to_string(),
            Scope::Device(id) => format!("/api/telemetry/device/{}", id),
        }
    }

    pub fn device_id(&self) -> Option<&str> {
        match self {
            Scope::AllDevices => None,
            Scope::Device(id) => Some(id.as_str()),
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::AllDevices => write!(f, "all devices"),
            Scope::Device(id) => write!(f, "device {}", id),
        }
    }
}
