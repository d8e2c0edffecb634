//! Storage collaborator interface and an in-memory implementation.
//!
//! The durable engine lives outside this crate. The pipeline only needs the
//! narrow surface of [`Storage`]: idempotent bucket upserts, a string
//! key-value settings table, peer cache blobs and the device registry.

use crate::decoder::SensorKind;
use crate::mac_address::canonical_id;
use crate::reading::{AggregatedBucket, DeviceRecord};
use crate::weather::WeatherBucket;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;
use thiserror::Error;

/// Settings key prefix for cached peer and remote site state.
pub const SITE_CACHE_PREFIX: &str = "site_cache_";

/// Errors reported by a storage backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    /// The backend failed to read or write
    #[error("Storage backend error: {0}")]
    Backend(String),
    /// The referenced device is not registered
    #[error("Unknown device: {0}")]
    UnknownDevice(String),
}

/// Persistence surface consumed by the aggregator, scanner and peer engine.
///
/// Implementations serialize their own writes; callers may share one instance
/// across tasks.
pub trait Storage: Send + Sync {
    /// Insert or replace the bucket keyed by `(sensor_id, bucket_start)`.
    fn upsert_aggregated_reading(&self, bucket: &AggregatedBucket) -> Result<(), StorageError>;

    /// Insert or replace the weather bucket keyed by its start time.
    fn upsert_weather(&self, bucket: &WeatherBucket) -> Result<(), StorageError>;

    fn get_setting(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set_setting(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Cached site state blob (JSON) for a peer or remote site.
    fn get_site_cache(&self, site_key: &str) -> Result<Option<String>, StorageError> {
        self.get_setting(&format!("{SITE_CACHE_PREFIX}{site_key}"))
    }

    fn set_site_cache(&self, site_key: &str, json: &str) -> Result<(), StorageError> {
        self.set_setting(&format!("{SITE_CACHE_PREFIX}{site_key}"), json)
    }

    /// All registered devices, ordered by `display_order`.
    fn devices(&self) -> Result<Vec<DeviceRecord>, StorageError>;

    /// Register a device if it is not yet known and return its record.
    ///
    /// A new device gets the next free `display_order`. Registering a known
    /// device leaves its alias and order untouched.
    fn register_device(
        &self,
        sensor_id: &str,
        kind: SensorKind,
        name: &str,
        configured: bool,
    ) -> Result<DeviceRecord, StorageError>;

    fn set_alias(&self, sensor_id: &str, alias: Option<&str>) -> Result<(), StorageError>;

    /// Move a device to `order`, swapping with the device that held it.
    fn set_order(&self, sensor_id: &str, order: u32) -> Result<(), StorageError>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    aggregated: BTreeMap<(String, SystemTime), AggregatedBucket>,
    weather: BTreeMap<SystemTime, WeatherBucket>,
    settings: HashMap<String, String>,
    devices: HashMap<String, DeviceRecord>,
}

/// Mutex-guarded in-memory [`Storage`].
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: Mutex<MemoryInner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// All aggregated buckets, ordered by sensor and start time.
    pub fn aggregated_buckets(&self) -> Vec<AggregatedBucket> {
        self.lock().aggregated.values().cloned().collect()
    }

    /// All weather buckets, ordered by start time.
    pub fn weather_buckets(&self) -> Vec<WeatherBucket> {
        self.lock().weather.values().cloned().collect()
    }
}

impl Storage for MemoryStorage {
    fn upsert_aggregated_reading(&self, bucket: &AggregatedBucket) -> Result<(), StorageError> {
        let key = (canonical_id(&bucket.sensor_id), bucket.bucket_start);
        self.lock().aggregated.insert(key, bucket.clone());
        Ok(())
    }

    fn upsert_weather(&self, bucket: &WeatherBucket) -> Result<(), StorageError> {
        let mut inner = self.lock();
        inner.weather.insert(bucket.bucket_start, bucket.clone());
        Ok(())
    }

    fn get_setting(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.lock().settings.get(key).cloned())
    }

    fn set_setting(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.lock()
            .settings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn devices(&self) -> Result<Vec<DeviceRecord>, StorageError> {
        let mut devices: Vec<DeviceRecord> = self.lock().devices.values().cloned().collect();
        devices.sort_by_key(|d| d.display_order);
        Ok(devices)
    }

    fn register_device(
        &self,
        sensor_id: &str,
        kind: SensorKind,
        name: &str,
        configured: bool,
    ) -> Result<DeviceRecord, StorageError> {
        let id = canonical_id(sensor_id);
        let mut inner = self.lock();
        if let Some(existing) = inner.devices.get(&id) {
            return Ok(existing.clone());
        }

        let display_order = inner
            .devices
            .values()
            .map(|d| d.display_order)
            .max()
            .map_or(1, |max| max + 1);
        let record = DeviceRecord {
            sensor_id: id.clone(),
            kind,
            name: name.to_string(),
            alias: None,
            display_order,
            configured,
        };
        inner.devices.insert(id, record.clone());
        Ok(record)
    }

    fn set_alias(&self, sensor_id: &str, alias: Option<&str>) -> Result<(), StorageError> {
        let id = canonical_id(sensor_id);
        let mut inner = self.lock();
        let device = inner
            .devices
            .get_mut(&id)
            .ok_or(StorageError::UnknownDevice(id.clone()))?;
        device.alias = alias.map(str::to_string);
        Ok(())
    }

    fn set_order(&self, sensor_id: &str, order: u32) -> Result<(), StorageError> {
        let id = canonical_id(sensor_id);
        let mut inner = self.lock();
        let previous = inner
            .devices
            .get(&id)
            .map(|d| d.display_order)
            .ok_or(StorageError::UnknownDevice(id.clone()))?;

        for device in inner.devices.values_mut() {
            if device.sensor_id == id {
                device.display_order = order;
            } else if device.display_order == order {
                device.display_order = previous;
            }
        }
        Ok(())
    }
}
