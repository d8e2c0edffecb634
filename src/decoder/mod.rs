//! Advertisement decoders for the supported sensor families.
//!
//! Every family is one variant of [`SensorKind`]; dispatch is an exhaustive
//! `match`, so adding a family means the compiler points at every call site
//! that has to learn about it. Decoding is pure: the caller passes the receipt
//! time and gets a [`Reading`] back, or `None` when the frame is not usable.

pub mod ruuvi;
pub mod xiaomi;

use crate::mac_address::canonical_id;
use crate::reading::Reading;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;
use thiserror::Error;

/// Error types for decoding a sensor payload.
///
/// These never leave the decoder: [`SensorKind::decode`] logs them at debug
/// level and returns `None`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Payload data format byte or length not handled by this decoder
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
    /// Payload shorter than the format requires
    #[error("Payload too short: {format} needs {needed} bytes, got {actual}")]
    TooShort {
        format: &'static str,
        needed: usize,
        actual: usize,
    },
    /// Frame carries the "not available" marker for a mandatory field
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// One raw advertisement as delivered by a scan backend.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AdvertisementRecord {
    /// Device address as reported by the platform
    pub address: String,
    /// Manufacturer-specific data keyed by company identifier
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    /// Service data keyed by lowercase hyphenated 128-bit UUID
    pub service_data: HashMap<String, Vec<u8>>,
    /// Signal strength in dBm
    pub rssi: Option<i16>,
}

/// Measurement values decoded from a payload, before a sensor id and receipt
/// time are attached.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Sample {
    pub temperature: f64,
    pub humidity: Option<f64>,
    pub pressure: Option<f64>,
    pub battery_voltage: Option<f64>,
    pub battery_percent: Option<u8>,
}

/// Sensor families this system can decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    /// RuuviTag, data formats 3 and 5 in manufacturer data
    Ruuvi,
    /// Xiaomi LYWSD03MMC running ATC or PVVX firmware, service data 0x181A
    Xiaomi,
}

impl SensorKind {
    /// All families, in auto-discovery order.
    pub const ALL: [SensorKind; 2] = [SensorKind::Ruuvi, SensorKind::Xiaomi];

    /// Cheap check whether `record` carries a payload for this family.
    pub fn can_decode(&self, record: &AdvertisementRecord) -> bool {
        match self {
            SensorKind::Ruuvi => ruuvi::can_decode(record),
            SensorKind::Xiaomi => xiaomi::can_decode(record),
        }
    }

    /// Decode `record` into a reading stamped with `received_at`.
    ///
    /// Returns `None` when the advertisement is not from this family, is too
    /// short or malformed, or carries an invalid mandatory field.
    pub fn decode(&self, record: &AdvertisementRecord, received_at: SystemTime) -> Option<Reading> {
        let result = match self {
            SensorKind::Ruuvi => ruuvi::decode(record),
            SensorKind::Xiaomi => xiaomi::decode(record),
        };

        match result {
            Ok(sample) => Some(Reading {
                sensor_id: canonical_id(&record.address),
                timestamp: received_at,
                temperature: sample.temperature,
                humidity: sample.humidity,
                pressure: sample.pressure,
                battery_voltage: sample.battery_voltage,
                battery_percent: sample.battery_percent,
                rssi: record.rssi,
            }),
            Err(e) => {
                log::debug!("{} {}: {}", self, record.address, e);
                None
            }
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorKind::Ruuvi => write!(f, "ruuvi"),
            SensorKind::Xiaomi => write!(f, "xiaomi"),
        }
    }
}

impl FromStr for SensorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ruuvi" | "ruuvitag" => Ok(SensorKind::Ruuvi),
            "xiaomi" | "atc" | "pvvx" => Ok(SensorKind::Xiaomi),
            _ => Err(format!("Unknown sensor kind: {}", s)),
        }
    }
}

pub(crate) fn be_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

pub(crate) fn be_i16(data: &[u8], offset: usize) -> i16 {
    i16::from_be_bytes([data[offset], data[offset + 1]])
}

pub(crate) fn le_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

pub(crate) fn le_i16(data: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes([data[offset], data[offset + 1]])
}

pub(crate) fn ensure_len(
    format: &'static str,
    data: &[u8],
    needed: usize,
) -> Result<(), DecodeError> {
    if data.len() < needed {
        return Err(DecodeError::TooShort {
            format,
            needed,
            actual: data.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{TEST_ID, df5_payload, manufacturer_record, service_record};
    use std::time::Duration;

    #[test]
    fn test_decode_assigns_receipt_time_and_id() {
        let received_at = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let record =
            manufacturer_record("aa:bb:cc:dd:ee:ff", ruuvi::MANUFACTURER_ID, &df5_payload());

        let reading = SensorKind::Ruuvi.decode(&record, received_at).unwrap();
        assert_eq!(reading.sensor_id, TEST_ID);
        assert_eq!(reading.timestamp, received_at);
        assert_eq!(reading.rssi, Some(-70));
    }

    #[test]
    fn test_decode_wrong_family_is_absent() {
        let record = manufacturer_record(TEST_ID, ruuvi::MANUFACTURER_ID, &df5_payload());
        assert!(!SensorKind::Xiaomi.can_decode(&record));
        let reading = SensorKind::Xiaomi.decode(&record, SystemTime::now());
        assert!(reading.is_none());
    }

    #[test]
    fn test_decode_empty_record_is_absent() {
        let record = AdvertisementRecord::default();
        for kind in SensorKind::ALL {
            assert!(!kind.can_decode(&record));
            assert!(kind.decode(&record, SystemTime::now()).is_none());
        }
    }

    #[test]
    fn test_can_decode_routes_by_payload() {
        let ruuvi = manufacturer_record(TEST_ID, ruuvi::MANUFACTURER_ID, &df5_payload());
        let xiaomi = service_record(TEST_ID, xiaomi::SERVICE_UUID, &[0u8; 13]);
        assert!(SensorKind::Ruuvi.can_decode(&ruuvi));
        assert!(!SensorKind::Ruuvi.can_decode(&xiaomi));
        assert!(SensorKind::Xiaomi.can_decode(&xiaomi));
    }

    #[test]
    fn test_sensor_kind_from_str() {
        assert_eq!(SensorKind::from_str("ruuvi").unwrap(), SensorKind::Ruuvi);
        assert_eq!(SensorKind::from_str("RuuviTag").unwrap(), SensorKind::Ruuvi);
        assert_eq!(SensorKind::from_str("xiaomi").unwrap(), SensorKind::Xiaomi);
        assert!(SensorKind::from_str("govee").is_err());
    }

    #[test]
    fn test_sensor_kind_display_matches_wire_name() {
        for kind in SensorKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind));
        }
    }

    #[test]
    fn test_decode_error_display() {
        let err = DecodeError::TooShort {
            format: "Ruuvi DF5",
            needed: 18,
            actual: 4,
        };
        assert_eq!(
            format!("{}", err),
            "Payload too short: Ruuvi DF5 needs 18 bytes, got 4"
        );
        let err = DecodeError::UnsupportedFormat("Ruuvi DF2".to_string());
        assert_eq!(format!("{}", err), "Unsupported format: Ruuvi DF2");
    }
}
