//! Sensor reading and device registry data structures.

use crate::decoder::SensorKind;
use std::time::SystemTime;

/// A single decoded sensor reading.
///
/// Values are normalized to the units shown on a dashboard:
/// - Temperature in Celsius
/// - Humidity in percent (0-100)
/// - Pressure in hectopascals
/// - Battery voltage in Volts
/// - RSSI in dBm
///
/// Temperature is always present. Every other field is independently optional
/// and `None` means the sensor did not report it (never zero).
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// Canonical uppercase sensor address
    pub sensor_id: String,
    /// Receipt time assigned by the scanner, never taken from the payload
    pub timestamp: SystemTime,
    /// Temperature in Celsius
    pub temperature: f64,
    /// Relative humidity in percent
    pub humidity: Option<f64>,
    /// Atmospheric pressure in hPa
    pub pressure: Option<f64>,
    /// Battery voltage in Volts
    pub battery_voltage: Option<f64>,
    /// Battery level in percent, as reported by the sensor firmware
    pub battery_percent: Option<u8>,
    /// Signal strength of the advertisement
    pub rssi: Option<i16>,
}

/// A sensor known to the registry, either declared up front or discovered live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub sensor_id: String,
    pub kind: SensorKind,
    /// Configured name, or the generated `<kind>_<address tail>` for discovered sensors
    pub name: String,
    /// User-assigned alias, overrides `name` for display
    pub alias: Option<String>,
    /// Unique, monotonically assigned position on dashboards
    pub display_order: u32,
    /// `true` when declared in configuration, `false` when auto-discovered
    pub configured: bool,
}

impl DeviceRecord {
    pub fn display_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// Five-minute rollup of one sensor's readings.
///
/// Unique per `(sensor_id, bucket_start)`; writing the same key twice replaces
/// the earlier bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedBucket {
    pub sensor_id: String,
    pub bucket_start: SystemTime,
    pub temp_min: f64,
    pub temp_max: f64,
    pub temp_avg: f64,
    pub humidity_avg: Option<f64>,
    pub pressure_avg: Option<f64>,
    /// Battery voltage of the most recent reading in the window
    pub battery_voltage: Option<f64>,
    /// Battery percent of the most recent reading in the window
    pub battery_percent: Option<u8>,
    pub sample_count: usize,
}

impl AggregatedBucket {
    /// Roll up `readings` (arrival order) into a bucket starting at `bucket_start`.
    ///
    /// Returns `None` for an empty window.
    pub fn from_readings(
        sensor_id: &str,
        bucket_start: SystemTime,
        readings: &[Reading],
    ) -> Option<Self> {
        let last = readings.last()?;

        let count = readings.len();
        let mut temp_min = f64::INFINITY;
        let mut temp_max = f64::NEG_INFINITY;
        let mut temp_sum = 0.0;
        for reading in readings {
            temp_min = temp_min.min(reading.temperature);
            temp_max = temp_max.max(reading.temperature);
            temp_sum += reading.temperature;
        }

        Some(AggregatedBucket {
            sensor_id: sensor_id.to_string(),
            bucket_start,
            temp_min,
            temp_max,
            temp_avg: temp_sum / count as f64,
            humidity_avg: mean(readings.iter().filter_map(|r| r.humidity)),
            pressure_avg: mean(readings.iter().filter_map(|r| r.pressure)),
            battery_voltage: last.battery_voltage,
            battery_percent: last.battery_percent,
            sample_count: count,
        })
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / count as f64)
}
