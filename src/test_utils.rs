use crate::decoder::AdvertisementRecord;
use crate::mac_address::MacAddress;
use crate::reading::Reading;
use std::collections::HashMap;
use std::time::SystemTime;

/// A stable MAC address for unit tests.
pub const TEST_MAC: MacAddress = MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

/// Canonical sensor id of [`TEST_MAC`].
pub const TEST_ID: &str = "AA:BB:CC:DD:EE:FF";

/// Build a `Reading` with all optional fields set to `None`.
///
/// Tests can override just the fields they care about.
pub fn base_reading(sensor_id: &str, timestamp: SystemTime, temperature: f64) -> Reading {
    Reading {
        sensor_id: sensor_id.to_string(),
        timestamp,
        temperature,
        humidity: None,
        pressure: None,
        battery_voltage: None,
        battery_percent: None,
        rssi: None,
    }
}

/// An advertisement carrying a single manufacturer data entry.
pub fn manufacturer_record(address: &str, company_id: u16, payload: &[u8]) -> AdvertisementRecord {
    AdvertisementRecord {
        address: address.to_string(),
        manufacturer_data: HashMap::from([(company_id, payload.to_vec())]),
        service_data: HashMap::new(),
        rssi: Some(-70),
    }
}

/// An advertisement carrying a single service data entry.
pub fn service_record(address: &str, uuid: &str, payload: &[u8]) -> AdvertisementRecord {
    AdvertisementRecord {
        address: address.to_string(),
        manufacturer_data: HashMap::new(),
        service_data: HashMap::from([(uuid.to_string(), payload.to_vec())]),
        rssi: Some(-80),
    }
}

/// Ruuvi format 5 payload for 24.30 °C, 53.49 %, 1000.44 hPa, 2.977 V.
pub fn df5_payload() -> Vec<u8> {
    vec![
        0x05, // Format 5
        0x12, 0xFC, // Temperature: 0x12FC = 4860 * 0.005 = 24.30
        0x53, 0x94, // Humidity: 0x5394 = 21396 * 0.0025 = 53.49
        0xC3, 0x7C, // Pressure: 0xC37C = 50044 + 50000 = 100044 Pa
        0x00, 0x04, // Acceleration X
        0xFF, 0xFC, // Acceleration Y
        0x04, 0x0C, // Acceleration Z
        0xAC, 0x36, // Power: 1377 + 1600 = 2977 mV, TX power bits ignored
        0x42, // Movement counter
        0x00, 0xCD, // Sequence
    ]
}
