//! Historical telemetry: query endpoint client and the seed loader

pub mod client;
pub mod loader;

pub use client::{CredentialProvider, FetchError, StaticToken, TelemetryClient, TelemetrySource};
pub use loader::load_history;
