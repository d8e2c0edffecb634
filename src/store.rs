//! In-memory cache of the latest reading and a bounded history per sensor.

use crate::mac_address::canonical_id;
use crate::reading::Reading;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

/// Maximum readings kept per sensor (about one per 45 s over a day).
pub const MAX_READINGS_PER_SENSOR: usize = 2000;

/// Readings older than this are pruned from history.
pub const HISTORY_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Default)]
struct Inner {
    latest: HashMap<String, Reading>,
    history: HashMap<String, VecDeque<Reading>>,
}

/// Thread-safe store of sensor readings.
///
/// One mutex guards both the latest map and the history buffers, so a reader
/// never sees a latest value that is missing from history or vice versa.
#[derive(Debug)]
pub struct SensorStore {
    inner: Mutex<Inner>,
    capacity: usize,
    retention: Duration,
}

impl Default for SensorStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorStore {
    pub fn new() -> Self {
        Self::with_limits(MAX_READINGS_PER_SENSOR, HISTORY_RETENTION)
    }

    /// Create a store with a custom per-sensor capacity and retention window.
    pub fn with_limits(capacity: usize, retention: Duration) -> Self {
        SensorStore {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
            retention,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a reading as the sensor's latest value and append it to history.
    ///
    /// The oldest entry is evicted once the sensor's buffer is full, and
    /// entries older than the retention window are pruned on every insert.
    pub fn add(&self, mut reading: Reading) {
        reading.sensor_id = canonical_id(&reading.sensor_id);
        let id = reading.sensor_id.clone();
        let cutoff = SystemTime::now().checked_sub(self.retention);

        let mut inner = self.lock();
        let history = inner
            .history
            .entry(id.clone())
            .or_insert_with(|| VecDeque::with_capacity(self.capacity.min(64)));

        if history.len() == self.capacity {
            history.pop_front();
        }
        history.push_back(reading.clone());

        if let Some(cutoff) = cutoff {
            history.retain(|r| r.timestamp >= cutoff);
        }

        log::trace!("Stored reading: {} = {:.1}°C", id, reading.temperature);
        inner.latest.insert(id, reading);
    }

    /// Latest reading for a sensor.
    pub fn get_latest(&self, sensor_id: &str) -> Option<Reading> {
        self.lock().latest.get(&canonical_id(sensor_id)).cloned()
    }

    /// Snapshot of the latest reading for every sensor.
    pub fn get_all_latest(&self) -> HashMap<String, Reading> {
        self.lock().latest.clone()
    }

    /// Readings from the last `duration`, oldest first.
    pub fn get_history(&self, sensor_id: &str, duration: Duration) -> Vec<Reading> {
        match SystemTime::now().checked_sub(duration) {
            Some(cutoff) => self.history_since(sensor_id, cutoff),
            None => self.history_since(sensor_id, SystemTime::UNIX_EPOCH),
        }
    }

    /// Readings with a timestamp at or after `cutoff`, oldest first.
    pub fn history_since(&self, sensor_id: &str, cutoff: SystemTime) -> Vec<Reading> {
        self.lock()
            .history
            .get(&canonical_id(sensor_id))
            .map(|history| {
                history
                    .iter()
                    .filter(|r| r.timestamp >= cutoff)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Ids of all sensors that have reported at least once.
    pub fn sensor_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().latest.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Age of a sensor's latest reading.
    pub fn reading_age(&self, sensor_id: &str) -> Option<Duration> {
        let reading = self.get_latest(sensor_id)?;
        Some(
            SystemTime::now()
                .duration_since(reading.timestamp)
                .unwrap_or_default(),
        )
    }
}
