//! Capacity-bounded, arrival-ordered reading buffer
//!
//! The buffer keeps the most recent readings in the order they arrived (not
//! re-sorted by timestamp) and evicts from the head once capacity is exceeded.
//!
//! Readers get an immutable `Snapshot` that shares storage with the buffer until
//! the next mutation, which copies on write. A snapshot therefore never observes
//! a partially applied append and does not change after later mutations.

use super::reading::Reading;
use std::collections::VecDeque;
use std::sync::{Arc, PoisonError, RwLock};

/// Number of readings kept for live charting
pub const DEFAULT_CAPACITY: usize = 50;

pub struct TelemetryBuffer {
    capacity: usize,
    readings: RwLock<Arc<VecDeque<Reading>>>,
}

impl TelemetryBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a buffer holding at most `capacity` readings (minimum 1)
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            readings: RwLock::new(Arc::new(VecDeque::with_capacity(capacity))),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Replace the contents wholesale, keeping only the newest `capacity` entries
    pub fn seed(&self, readings: Vec<Reading>) {
        let skip = readings.len().saturating_sub(self.capacity);
        let seeded: VecDeque<Reading> = readings.into_iter().skip(skip).collect();

        let mut guard = self.readings.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(seeded);
    }

    /// Add a reading to the tail, evicting from the head past capacity
    ///
    /// Returns the number of evicted readings.
    pub fn append(&self, reading: Reading) -> usize {
        let mut guard = self.readings.write().unwrap_or_else(PoisonError::into_inner);
        let readings = Arc::make_mut(&mut guard);

        readings.push_back(reading);
        let mut evicted = 0;
        while readings.len() > self.capacity {
            readings.pop_front();
            evicted += 1;
        }
        evicted
    }

    /// Current contents as an immutable view
    pub fn snapshot(&self) -> Snapshot {
        let guard = self.readings.read().unwrap_or_else(PoisonError::into_inner);
        Snapshot {
            readings: Arc::clone(&guard),
        }
    }

    pub fn len(&self) -> usize {
        self.readings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TelemetryBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of a buffer, oldest reading first
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    readings: Arc<VecDeque<Reading>>,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Reading> {
        self.readings.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Reading> {
        self.readings.get(index)
    }

    pub fn latest(&self) -> Option<&Reading> {
        self.readings.back()
    }

    /// Newest `n` readings, oldest first (the "recent telemetry" list)
    pub fn recent(&self, n: usize) -> Vec<Reading> {
        let skip = self.readings.len().saturating_sub(n);
        self.readings.iter().skip(skip).cloned().collect()
    }

    /// Readings from a single device, for views over an all-devices buffer
    pub fn for_device(&self, device_id: &str) -> Vec<Reading> {
        self.readings
            .iter()
            .filter(|r| r.device_id == device_id)
            .cloned()
            .collect()
    }

    pub fn to_vec(&self) -> Vec<Reading> {
        self.readings.iter().cloned().collect()
    }
}

impl PartialEq<[Reading]> for Snapshot {
    fn eq(&self, other: &[Reading]) -> bool {
        self.readings.iter().eq(other.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::reading::{Measurements, PayloadValues};
    use chrono::{TimeZone, Utc};
    use std::thread;

    fn create_test_reading(seq: i64) -> Reading {
        Reading {
            device_id: format!("dev-{}", seq % 3),
            timestamp: Utc.timestamp_opt(1_700_000_000 + seq, 0).single(),
            raw_payload: format!("{{\"temperature\":{}}}", seq),
            values: PayloadValues::Decoded(Measurements {
                temperature: Some(seq as f64),
                humidity: None,
            }),
        }
    }

    #[test]
    fn test_append_evicts_oldest_first() {
        let buffer = TelemetryBuffer::new();
        let readings: Vec<Reading> = (1..=51).map(create_test_reading).collect();

        for r in &readings {
            buffer.append(r.clone());
        }

        let snapshot = buffer.snapshot();
        assert_eq!(snapshot.len(), 50);
        assert_eq!(snapshot, readings[1..]);
    }

    #[test]
    fn test_length_never_exceeds_capacity() {
        let buffer = TelemetryBuffer::with_capacity(5);
        for seq in 0..20 {
            buffer.append(create_test_reading(seq));
            assert!(buffer.len() <= 5);
        }
        assert_eq!(buffer.append(create_test_reading(20)), 1);
    }

    #[test]
    fn test_seed_preserves_order() {
        let buffer = TelemetryBuffer::new();
        let seed: Vec<Reading> = (0..3).map(create_test_reading).collect();

        buffer.seed(seed.clone());
        assert_eq!(buffer.snapshot(), seed[..]);
    }

    #[test]
    fn test_seed_overwrites_and_truncates() {
        let buffer = TelemetryBuffer::with_capacity(4);
        buffer.append(create_test_reading(100));

        let seed: Vec<Reading> = (0..10).map(create_test_reading).collect();
        buffer.seed(seed.clone());

        assert_eq!(buffer.snapshot(), seed[6..]);

        buffer.seed(Vec::new());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_out_of_order_timestamps_are_not_resorted() {
        let buffer = TelemetryBuffer::new();
        let late = create_test_reading(10);
        let early = create_test_reading(1);

        buffer.append(late.clone());
        buffer.append(early.clone());

        assert_eq!(buffer.snapshot(), [late, early][..]);
    }

    #[test]
    fn test_snapshot_is_not_affected_by_later_appends() {
        let buffer = TelemetryBuffer::with_capacity(2);
        buffer.append(create_test_reading(1));
        let before = buffer.snapshot();

        buffer.append(create_test_reading(2));
        buffer.append(create_test_reading(3));

        assert_eq!(before.len(), 1);
        assert_eq!(before.latest(), Some(&create_test_reading(1)));
        assert_eq!(buffer.snapshot().latest(), Some(&create_test_reading(3)));
    }

    #[test]
    fn test_concurrent_append_and_snapshot() {
        let buffer = Arc::new(TelemetryBuffer::with_capacity(10));

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let buffer = Arc::clone(&buffer);
                thread::spawn(move || {
                    for seq in 0..200 {
                        buffer.append(create_test_reading(w * 1000 + seq));
                    }
                })
            })
            .collect();

        for _ in 0..500 {
            let snapshot = buffer.snapshot();
            assert!(snapshot.len() <= 10);
        }

        for w in writers {
            w.join().unwrap();
        }
        assert_eq!(buffer.len(), 10);
    }

    #[test]
    fn test_snapshot_views() {
        let buffer = TelemetryBuffer::new();
        for seq in 0..6 {
            buffer.append(create_test_reading(seq));
        }
        let snapshot = buffer.snapshot();

        let recent = snapshot.recent(2);
        assert_eq!(recent, vec![create_test_reading(4), create_test_reading(5)]);

        let dev0 = snapshot.for_device("dev-0");
        assert_eq!(dev0, vec![create_test_reading(0), create_test_reading(3)]);
        assert_eq!(snapshot.get(0), Some(&create_test_reading(0)));
    }
}
