//! Xiaomi LYWSD03MMC thermometers running custom firmware.
//!
//! Both firmwares advertise on the Environmental Sensing service (0x181A):
//! ATC (atc1441) as a 13-byte big-endian frame, PVVX as a frame of 15 bytes or
//! more in little-endian order. Bytes 0-5 carry the device MAC in both.

use super::{AdvertisementRecord, DecodeError, Sample, be_i16, be_u16, le_i16, le_u16};

/// Environmental Sensing service UUID used by ATC and PVVX firmware.
pub const SERVICE_UUID: &str = "0000181a-0000-1000-8000-00805f9b34fb";

const ATC_LEN: usize = 13;
const PVVX_MIN_LEN: usize = 15;

fn payload(record: &AdvertisementRecord) -> Option<&[u8]> {
    record
        .service_data
        .iter()
        .find(|(uuid, _)| uuid.eq_ignore_ascii_case(SERVICE_UUID))
        .map(|(_, data)| data.as_slice())
}

pub(crate) fn can_decode(record: &AdvertisementRecord) -> bool {
    payload(record).is_some_and(|data| data.len() == ATC_LEN || data.len() >= PVVX_MIN_LEN)
}

pub(crate) fn decode(record: &AdvertisementRecord) -> Result<Sample, DecodeError> {
    let data = payload(record)
        .ok_or_else(|| DecodeError::UnsupportedFormat("no 0x181A service data".into()))?;
    decode_payload(data)
}

/// Decode a 0x181A service data payload, choosing the firmware by length.
pub fn decode_payload(data: &[u8]) -> Result<Sample, DecodeError> {
    match data.len() {
        ATC_LEN => Ok(decode_atc(data)),
        len if len >= PVVX_MIN_LEN => Ok(decode_pvvx(data)),
        len if len < ATC_LEN => Err(DecodeError::TooShort {
            format: "Xiaomi ATC",
            needed: ATC_LEN,
            actual: len,
        }),
        len => {
            let detail = format!("Xiaomi service data of {len} bytes");
            Err(DecodeError::UnsupportedFormat(detail))
        }
    }
}

/// ATC: temperature in tenths of a degree, whole-percent humidity and battery,
/// battery voltage in mV.
fn decode_atc(data: &[u8]) -> Sample {
    Sample {
        temperature: f64::from(be_i16(data, 6)) / 10.0,
        humidity: Some(f64::from(data[8])),
        pressure: None,
        battery_voltage: Some(f64::from(be_u16(data, 10)) / 1000.0),
        battery_percent: Some(data[9]),
    }
}

/// PVVX: temperature and humidity in hundredths, battery voltage in mV.
fn decode_pvvx(data: &[u8]) -> Sample {
    Sample {
        temperature: f64::from(le_i16(data, 6)) / 100.0,
        humidity: Some(f64::from(le_u16(data, 8)) / 100.0),
        pressure: None,
        battery_voltage: Some(f64::from(le_u16(data, 10)) / 1000.0),
        battery_percent: Some(data[12]),
    }
}
