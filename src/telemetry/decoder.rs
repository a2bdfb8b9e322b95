//! Payload decoding for telemetry records and push messages
//!
//! Two layers are decoded here:
//! - the envelope `{deviceId, timestamp, payload}` delivered by both endpoints
//! - the payload itself, a JSON-encoded string with numeric `temperature` and `humidity`
//!
//! Payload failures never drop a reading. A live message is dropped only when
//! it is not a JSON object naming a device; history elements are always kept.

use super::reading::{Measurements, PayloadValues, Reading};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Payload is not a JSON object
    Malformed { raw: String, reason: String },
    /// A measurement field holds something other than a number
    NonNumeric { raw: String, field: &'static str },
    /// Live message is unusable (not a JSON object, or no device id)
    Envelope { raw: String, reason: String },
}

impl DecodeError {
    /// The undecoded input that caused the failure
    pub fn raw(&self) -> &str {
        match self {
            DecodeError::Malformed { raw, .. } => raw,
            DecodeError::NonNumeric { raw, .. } => raw,
            DecodeError::Envelope { raw, .. } => raw,
        }
    }
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Malformed { reason, .. } => write!(f, "Malformed payload: {}", reason),
            DecodeError::NonNumeric { field, .. } => {
                write!(f, "Payload field '{}' is not numeric", field)
            }
            DecodeError::Envelope { reason, .. } => write!(f, "Unusable telemetry envelope: {}", reason),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Decode a raw payload string into its measurements
///
/// Absent or `null` fields are unset. Numbers and strings holding a finite
/// number are accepted; any other value is a `NonNumeric` error.
pub fn decode(raw: &str) -> Result<Measurements, DecodeError> {
    let value: Value = serde_json::from_str(raw).map_err(|e| DecodeError::Malformed {
        raw: raw.to_string(),
        reason: e.to_string(),
    })?;

    let object = value.as_object().ok_or_else(|| DecodeError::Malformed {
        raw: raw.to_string(),
        reason: "expected a JSON object".to_string(),
    })?;

    Ok(Measurements {
        temperature: numeric_field(object, "temperature", raw)?,
        humidity: numeric_field(object, "humidity", raw)?,
    })
}

fn numeric_field(
    object: &Map<String, Value>,
    field: &'static str,
    raw: &str,
) -> Result<Option<f64>, DecodeError> {
    let non_numeric = || DecodeError::NonNumeric {
        raw: raw.to_string(),
        field,
    };

    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_f64().map(Some).ok_or_else(non_numeric),
        Some(Value::String(s)) => match s.trim().parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(Some(v)),
            _ => Err(non_numeric()),
        },
        Some(_) => Err(non_numeric()),
    }
}

/// Decode a payload and wrap the outcome for a reading
///
/// Returns the error alongside so the caller can log it.
pub fn decode_values(raw: &str) -> (PayloadValues, Option<DecodeError>) {
    match decode(raw) {
        Ok(m) => (PayloadValues::Decoded(m), None),
        Err(e) => (
            PayloadValues::RawOnly {
                reason: e.to_string(),
            },
            Some(e),
        ),
    }
}

/// Device id used for history records that carry none and have no scope device
pub const UNKNOWN_DEVICE: &str = "unknown";

/// Build a reading from a push message body (`{deviceId, timestamp, payload}` as a string)
///
/// A message that is not a JSON object or names no device cannot be placed
/// and is an `Envelope` error. An unparseable timestamp is not: the reading
/// is kept with `timestamp: None`.
pub fn reading_from_message(body: &str) -> Result<Reading, DecodeError> {
    let envelope = |reason: String| DecodeError::Envelope {
        raw: body.to_string(),
        reason,
    };

    let value: Value = serde_json::from_str(body).map_err(|e| envelope(e.to_string()))?;
    let object = value
        .as_object()
        .ok_or_else(|| envelope("message is not a JSON object".to_string()))?;
    let device_id = device_id_of(object).ok_or_else(|| envelope("missing deviceId".to_string()))?;

    Ok(build_reading(device_id, object))
}

/// Build a reading from one element of a history response
///
/// Every element becomes a reading so the history keeps the endpoint's count
/// and order. A missing device id falls back to `fallback_device` (the
/// per-device endpoint omits it), then to `UNKNOWN_DEVICE`. An element that
/// is not an object is kept raw-only with its JSON text as the payload.
pub fn reading_from_record(record: &Value, fallback_device: Option<&str>) -> Reading {
    let fallback = || {
        fallback_device
            .filter(|d| !d.is_empty())
            .unwrap_or(UNKNOWN_DEVICE)
            .to_string()
    };

    match record.as_object() {
        Some(object) => build_reading(device_id_of(object).unwrap_or_else(fallback), object),
        None => Reading {
            device_id: fallback(),
            timestamp: None,
            raw_payload: match record {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            values: PayloadValues::RawOnly {
                reason: "record is not a JSON object".to_string(),
            },
        },
    }
}

fn device_id_of(object: &Map<String, Value>) -> Option<String> {
    match object.get("deviceId") {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn build_reading(device_id: String, object: &Map<String, Value>) -> Reading {
    let timestamp = object.get("timestamp").and_then(parse_timestamp);
    if timestamp.is_none() {
        log::debug!(
            "Keeping reading from {} without a usable timestamp: {:?}",
            device_id,
            object.get("timestamp")
        );
    }

    let raw_payload = match object.get("payload") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };

    let (values, error) = decode_values(&raw_payload);
    if let Some(e) = error {
        log::debug!("Keeping undecodable payload from {}: {}", device_id, e);
    }

    Reading {
        device_id,
        timestamp,
        raw_payload,
        values,
    }
}

/// Parse a timestamp in any of the shapes the backend emits
///
/// - RFC 3339 strings
/// - ISO date-times with a colon-less offset (`2024-05-01T12:00:00.000+0000`)
/// - ISO local date-times without offset (taken as UTC)
/// - epoch milliseconds, as a number or numeric string
/// - `[year, month, day, hour, minute, second, nanos]` arrays
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp_str(s.trim()),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        Value::Array(parts) => parse_timestamp_parts(parts),
        _ => None,
    }
}

fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    s.parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

fn parse_timestamp_parts(parts: &[Value]) -> Option<DateTime<Utc>> {
    let nums: Vec<i64> = parts.iter().map(Value::as_i64).collect::<Option<_>>()?;
    if nums.len() < 3 {
        return None;
    }
    let part = |i: usize| nums.get(i).copied().unwrap_or(0);

    let date = NaiveDate::from_ymd_opt(
        i32::try_from(part(0)).ok()?,
        u32::try_from(part(1)).ok()?,
        u32::try_from(part(2)).ok()?,
    )?;
    let naive = date.and_hms_nano_opt(
        u32::try_from(part(3)).ok()?,
        u32::try_from(part(4)).ok()?,
        u32::try_from(part(5)).ok()?,
        u32::try_from(part(6)).ok()?,
    )?;
    Some(Utc.from_utc_datetime(&naive))
}
