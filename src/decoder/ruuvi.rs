//! RuuviTag manufacturer data, formats 3 (RAWv1) and 5 (RAWv2).
//!
//! See: https://github.com/ruuvi/ruuvi-sensor-protocols

use super::{AdvertisementRecord, DecodeError, Sample, be_i16, be_u16, ensure_len};

/// Ruuvi Innovations company identifier.
pub const MANUFACTURER_ID: u16 = 0x0499;

const DF3_LEN: usize = 14;
const DF5_LEN: usize = 18;

const DF5_TEMPERATURE_INVALID: i16 = i16::MIN;
const DF5_HUMIDITY_INVALID: u16 = u16::MAX;
const DF5_PRESSURE_INVALID: u16 = u16::MAX;
const DF5_VOLTAGE_INVALID: u16 = 2047;

pub(crate) fn can_decode(record: &AdvertisementRecord) -> bool {
    matches!(
        record
            .manufacturer_data
            .get(&MANUFACTURER_ID)
            .and_then(|data| data.first()),
        Some(3 | 5)
    )
}

pub(crate) fn decode(record: &AdvertisementRecord) -> Result<Sample, DecodeError> {
    let data = record
        .manufacturer_data
        .get(&MANUFACTURER_ID)
        .ok_or_else(|| DecodeError::UnsupportedFormat("no Ruuvi manufacturer data".into()))?;
    decode_payload(data)
}

/// Decode a Ruuvi manufacturer payload (without the company id prefix).
pub fn decode_payload(data: &[u8]) -> Result<Sample, DecodeError> {
    match data.first() {
        Some(3) => decode_df3(data),
        Some(5) => decode_df5(data),
        Some(other) => Err(DecodeError::UnsupportedFormat(format!(
            "Ruuvi DF{} (only 3 and 5 supported)",
            other
        ))),
        None => Err(DecodeError::InvalidData("empty Ruuvi payload".into())),
    }
}

/// Format 3: humidity in half percent, temperature as signed integer part plus
/// a hundredths fraction, pressure offset by 50000 Pa, battery in mV.
fn decode_df3(data: &[u8]) -> Result<Sample, DecodeError> {
    ensure_len("Ruuvi DF3", data, DF3_LEN)?;

    let humidity = f64::from(data[1]) * 0.5;

    // The fraction takes the sign of the integer part, so -0.xx reads as +0.xx.
    let whole = data[2] as i8;
    let fraction = f64::from(data[3]) / 100.0;
    let temperature = if whole >= 0 {
        f64::from(whole) + fraction
    } else {
        f64::from(whole) - fraction
    };

    let pressure = (f64::from(be_u16(data, 4)) + 50_000.0) / 100.0;
    let battery_voltage = f64::from(be_u16(data, 12)) / 1000.0;

    Ok(Sample {
        temperature,
        humidity: Some(humidity),
        pressure: Some(pressure),
        battery_voltage: Some(battery_voltage),
        battery_percent: None,
    })
}

/// Format 5: 0.005 °C temperature steps, 0.0025 % humidity steps, pressure
/// offset by 50000 Pa and an 11-bit battery voltage above 1600 mV. Every field
/// has a reserved "not available" value.
fn decode_df5(data: &[u8]) -> Result<Sample, DecodeError> {
    ensure_len("Ruuvi DF5", data, DF5_LEN)?;

    let temperature_raw = be_i16(data, 1);
    if temperature_raw == DF5_TEMPERATURE_INVALID {
        return Err(DecodeError::InvalidData(
            "Ruuvi DF5 temperature not available".into(),
        ));
    }

    let humidity = match be_u16(data, 3) {
        DF5_HUMIDITY_INVALID => None,
        raw => Some(f64::from(raw) * 0.0025),
    };

    let pressure = match be_u16(data, 5) {
        DF5_PRESSURE_INVALID => None,
        raw => Some((f64::from(raw) + 50_000.0) / 100.0),
    };

    // Top 11 bits are voltage, bottom 5 bits TX power (not used).
    let battery_voltage = match be_u16(data, 13) >> 5 {
        DF5_VOLTAGE_INVALID => None,
        raw => Some((f64::from(raw) + 1600.0) / 1000.0),
    };

    Ok(Sample {
        temperature: f64::from(temperature_raw) * 0.005,
        humidity,
        pressure,
        battery_voltage,
        battery_percent: None,
    })
}
