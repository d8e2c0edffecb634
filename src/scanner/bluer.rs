//! BlueZ D-Bus scan backend.
//!
//! This backend uses the `bluer` crate to communicate with the BlueZ daemon
//! via D-Bus. It requires the `bluetoothd` daemon to be running.

use super::{AdvertisementResult, ScanBackend, ScanError, ScanSession};
use crate::decoder::AdvertisementRecord;
use crate::mac_address::MacAddress;
use bluer::{Adapter, AdapterEvent, Address, DiscoveryFilter, DiscoveryTransport, Session, Uuid};
use futures::StreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;

impl From<bluer::Error> for ScanError {
    fn from(err: bluer::Error) -> Self {
        ScanError::Bluetooth(err.to_string())
    }
}

/// Scans the default adapter through BlueZ.
#[derive(Debug, Default, Clone, Copy)]
pub struct BluerBackend;

impl ScanBackend for BluerBackend {
    fn start_scan(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<ScanSession, ScanError>> + Send + '_>> {
        Box::pin(start_scan())
    }

    fn reset_adapter(&self) -> Pin<Box<dyn Future<Output = Result<(), ScanError>> + Send + '_>> {
        Box::pin(power_cycle())
    }
}

/// Start LE discovery and stream every advertisement update.
///
/// Duplicate data is enabled so repeated advertisements from the same sensor
/// are reported as property changes instead of being filtered by BlueZ.
async fn start_scan() -> Result<ScanSession, ScanError> {
    let session = Session::new().await?;
    let adapter = session.default_adapter().await?;
    adapter.set_powered(true).await?;

    let filter = DiscoveryFilter {
        transport: DiscoveryTransport::Le,
        duplicate_data: true,
        ..Default::default()
    };
    if let Err(e) = adapter.set_discovery_filter(filter).await {
        log::warn!("Failed to set discovery filter: {}", e);
    }

    let discovery = adapter.discover_devices_with_changes().await?;
    log::debug!("Discovery started on {}", adapter.name());

    // The worker owns all Bluetooth state; discovery ends when it is dropped
    Ok(ScanSession::spawn(move |tx, mut shutdown| async move {
        let _session = session;
        let mut events = Box::pin(discovery);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                event = events.next() => match event {
                    Some(AdapterEvent::DeviceAdded(address)) => {
                        if !forward_device(&adapter, address, &tx).await {
                            break;
                        }
                    }
                    Some(_) => {}
                    None => break,
                },
            }
        }
        log::debug!("Discovery stopped on {}", adapter.name());
    }))
}

/// Read the advertisement data of `address` and forward it.
///
/// Returns `false` once the receiving side is gone.
async fn forward_device(
    adapter: &Adapter,
    address: Address,
    tx: &mpsc::Sender<AdvertisementResult>,
) -> bool {
    let record = match read_record(adapter, address).await {
        Ok(record) => record,
        Err(e) => {
            log::debug!("Could not read {}: {}", address, e);
            return true;
        }
    };
    if record.manufacturer_data.is_empty() && record.service_data.is_empty() {
        return true;
    }
    tx.send(Ok(record)).await.is_ok()
}

async fn read_record(
    adapter: &Adapter,
    address: Address,
) -> Result<AdvertisementRecord, ScanError> {
    let device = adapter.device(address)?;
    let manufacturer_data = device.manufacturer_data().await?.unwrap_or_default();
    let service_data = device
        .service_data()
        .await?
        .map(service_data_by_key)
        .unwrap_or_default();
    let rssi = device.rssi().await?;

    Ok(AdvertisementRecord {
        address: MacAddress::from(address).to_string(),
        manufacturer_data,
        service_data,
        rssi,
    })
}

/// Key service data by lowercase hyphenated UUID string.
fn service_data_by_key(data: HashMap<Uuid, Vec<u8>>) -> HashMap<String, Vec<u8>> {
    data.into_iter()
        .map(|(uuid, payload)| (uuid.to_string().to_lowercase(), payload))
        .collect()
}

/// Power-cycle the default adapter to clear a stalled discovery.
async fn power_cycle() -> Result<(), ScanError> {
    let session = Session::new().await?;
    let adapter = session.default_adapter().await?;

    log::info!("Power cycling adapter {}", adapter.name());
    adapter.set_powered(false).await?;
    tokio::time::sleep(Duration::from_secs(1)).await;
    adapter.set_powered(true).await?;
    tokio::time::sleep(Duration::from_secs(2)).await;
    Ok(())
}
