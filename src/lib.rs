//! `sitewatch` library.
//!
//! Listens for BLE environmental sensors (Ruuvi, Xiaomi ATC/PVVX), keeps live
//! readings in a bounded [`SensorStore`](store::SensorStore), rolls them into
//! five-minute aggregates and mirrors site state with peer instances.
//!
//! The binary (`src/main.rs`) is responsible for CLI parsing and process exit codes.
//! The pipeline itself lives in [`crate::app`] where it can be tested
//! deterministically with an injected scan backend, storage and HTTP transport.

pub mod aggregator;
pub mod app;
pub mod config;
pub mod decoder;
pub mod mac_address;
pub mod peer;
pub mod reading;
pub mod scanner;
pub mod status;
pub mod storage;
pub mod store;
pub mod weather;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use aggregator::Aggregator;
pub use decoder::{AdvertisementRecord, DecodeError, SensorKind};
pub use mac_address::MacAddress;
pub use peer::{PeerSiteState, PeerSyncEngine};
pub use reading::{AggregatedBucket, DeviceRecord, Reading};
pub use scanner::{Backend, ScanError, ScannerState, ScannerSupervisor};
pub use storage::{MemoryStorage, Storage, StorageError};
pub use store::SensorStore;
