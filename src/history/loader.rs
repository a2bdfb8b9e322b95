//! Historical Loader - one request/response call turned into readings

use super::client::{FetchError, TelemetrySource};
use crate::telemetry::{reading_from_record, Reading, Scope};

/// Fetch and decode the existing readings for a scope
///
/// Every element of the response becomes a reading, in the endpoint's order.
/// Undecodable payloads are kept raw-only, unparseable timestamps are kept as
/// `None`, and elements without a device id take the scope's device.
pub async fn load_history(
    source: &dyn TelemetrySource,
    scope: &Scope,
) -> Result<Vec<Reading>, FetchError> {
    log::info!("📥 Loading telemetry history for {}", scope);

    let records = source.fetch_records(scope).await.map_err(|e| {
        log::error!("❌ History load failed for {}: {}", scope, e);
        e
    })?;

    let readings: Vec<Reading> = records
        .iter()
        .map(|record| reading_from_record(record, scope.device_id()))
        .collect();

    let raw_only = readings.iter().filter(|r| !r.is_decoded()).count();
    let untimed = readings.iter().filter(|r| r.timestamp.is_none()).count();
    if untimed > 0 {
        log::warn!("⚠️  {} history records for {} have no usable timestamp", untimed, scope);
    }

    log::info!(
        "✅ Loaded {} readings for {} ({} undecodable payloads)",
        readings.len(),
        scope,
        raw_only
    );

    Ok(readings)
}
