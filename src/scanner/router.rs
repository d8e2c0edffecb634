//! Routes advertisements to decoders and registers newly seen sensors.

use crate::decoder::{AdvertisementRecord, SensorKind};
use crate::mac_address::{address_tail, canonical_id};
use crate::storage::Storage;
use crate::store::SensorStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

/// Decides which decoder handles each advertisement.
///
/// Known sensors take the fast path through their registered decoder. Unknown
/// addresses are tried against every family; the first successful decode
/// registers the device so it is never tried again.
pub struct DeviceRouter {
    store: Arc<SensorStore>,
    storage: Option<Arc<dyn Storage>>,
    known: HashMap<String, SensorKind>,
}

impl DeviceRouter {
    /// Create a router seeded with every device already in the registry.
    pub fn new(store: Arc<SensorStore>, storage: Option<Arc<dyn Storage>>) -> Self {
        let mut known = HashMap::new();
        if let Some(storage) = &storage {
            match storage.devices() {
                Ok(devices) => {
                    known.extend(devices.into_iter().map(|d| (d.sensor_id, d.kind)));
                }
                Err(e) => log::warn!("Could not load device registry: {}", e),
            }
        }

        DeviceRouter {
            store,
            storage,
            known,
        }
    }

    /// Add a sensor to the fast path without touching the registry.
    pub fn declare(&mut self, sensor_id: &str, kind: SensorKind) {
        self.known.insert(canonical_id(sensor_id), kind);
    }

    pub fn known_count(&self) -> usize {
        self.known.len()
    }

    pub fn kind_of(&self, sensor_id: &str) -> Option<SensorKind> {
        self.known.get(&canonical_id(sensor_id)).copied()
    }

    /// Decode `record` and store the reading.
    ///
    /// Returns `true` when a reading reached the store.
    pub fn handle(&mut self, record: &AdvertisementRecord, received_at: SystemTime) -> bool {
        let id = canonical_id(&record.address);

        if let Some(kind) = self.known.get(&id).copied() {
            return match kind.decode(record, received_at) {
                Some(reading) => {
                    log::debug!(
                        "Received reading from {} ({}): {:.1}°C",
                        id,
                        kind,
                        reading.temperature
                    );
                    self.store.add(reading);
                    true
                }
                None => false,
            };
        }

        for kind in SensorKind::ALL {
            if !kind.can_decode(record) {
                continue;
            }
            let Some(reading) = kind.decode(record, received_at) else {
                continue;
            };

            self.register(&id, kind);
            self.store.add(reading);
            return true;
        }

        false
    }

    fn register(&mut self, sensor_id: &str, kind: SensorKind) {
        let name = format!("{}_{}", kind, address_tail(sensor_id));
        self.known.insert(sensor_id.to_string(), kind);

        if let Some(storage) = &self.storage
            && let Err(e) = storage.register_device(sensor_id, kind, &name, false)
        {
            log::warn!("Failed to persist discovered sensor {}: {}", sensor_id, e);
        }

        log::info!("Discovered {} sensor: {} ({})", kind, name, sensor_id);
    }
}
