//! Telemetry Core - readings, payload decoding and the bounded window
//!
//! ```text
//! raw record / push message → decoder → Reading → TelemetryBuffer → Snapshot
//! ```

pub mod buffer;
pub mod decoder;
pub mod reading;

pub use buffer::{Snapshot, TelemetryBuffer, DEFAULT_CAPACITY};
pub use decoder::{decode, reading_from_message, reading_from_record, DecodeError, UNKNOWN_DEVICE};
pub use reading::{Measurements, PayloadValues, Reading, Scope};
