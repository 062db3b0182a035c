//! Latest-reading cache.
//!
//! Telemetry is read-only from the device, so there is nothing to reconcile:
//! every successful fetch replaces what was stored. Readings are never mutated
//! in place.

use std::collections::{HashMap, VecDeque};

use heatbeat_types::Reading;

/// Bounded per-device store of recent readings, newest last.
#[derive(Debug, Clone)]
pub struct TelemetryCache {
    capacity: usize,
    readings: HashMap<String, VecDeque<Reading>>,
}

impl Default for TelemetryCache {
    fn default() -> Self {
        Self::new(1)
    }
}

impl TelemetryCache {
    /// Create a cache keeping up to `capacity` readings per device (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            readings: HashMap::new(),
        }
    }

    /// Readings retained per device.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Record a freshly fetched reading.
    ///
    /// A reading older than the newest stored one is ignored, so a slow fetch
    /// resolving late cannot roll the display back. Returns whether the cache
    /// changed.
    pub fn replace(&mut self, device_id: &str, reading: Reading) -> bool {
        let ring = self.readings.entry(device_id.to_string()).or_default();
        if let Some(newest) = ring.back() {
            if reading.observed_at < newest.observed_at {
                return false;
            }
            if *newest == reading {
                return false;
            }
        }
        ring.push_back(reading);
        while ring.len() > self.capacity {
            ring.pop_front();
        }
        true
    }

    /// Replace a device's history wholesale.
    ///
    /// `readings` may be in any order; only the newest `capacity` are kept.
    pub fn replace_history(&mut self, device_id: &str, mut readings: Vec<Reading>) {
        readings.sort_by_key(|r| r.observed_at);
        let skip = readings.len().saturating_sub(self.capacity);
        let ring: VecDeque<Reading> = readings.into_iter().skip(skip).collect();
        if ring.is_empty() {
            self.readings.remove(device_id);
        } else {
            self.readings.insert(device_id.to_string(), ring);
        }
    }

    /// Newest reading for a device.
    pub fn latest(&self, device_id: &str) -> Option<Reading> {
        self.readings.get(device_id).and_then(|r| r.back().copied())
    }

    /// All retained readings for a device, newest first.
    pub fn history(&self, device_id: &str) -> Vec<Reading> {
        self.readings
            .get(device_id)
            .map(|r| r.iter().rev().copied().collect())
            .unwrap_or_default()
    }

    /// Forget a device.
    pub fn remove(&mut self, device_id: &str) {
        self.readings.remove(device_id);
    }

    /// Forget every device.
    pub fn clear(&mut self) {
        self.readings.clear();
    }
}
