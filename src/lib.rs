//! Telemetry stream aggregation
//!
//! Keeps a bounded, ordered window of recent device telemetry readings,
//! seeded from a historical query and extended by a live STOMP push
//! subscription.

pub mod aggregator;
pub mod config;
pub mod history;
pub mod stream_core;
pub mod telemetry;

pub use aggregator::{AggregatorError, AggregatorHandle, TelemetryAggregator};
pub use config::{AggregatorConfig, ConfigError};
pub use telemetry::{Measurements, PayloadValues, Reading, Scope, Snapshot};
