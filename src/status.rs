//! The local status snapshot served to remote sites and sent to peers.

use crate::peer::wire::{
    RemoteSensorSnapshot, RemoteWeatherSnapshot, StatusPayload, WIRE_TIME_FORMAT,
};
use crate::reading::{DeviceRecord, Reading};
use crate::storage::Storage;
use crate::store::SensorStore;
use crate::weather::{WeatherReport, WeatherSource};
use chrono::{DateTime, Local};
use std::time::SystemTime;

/// Settings key holding this site's display name.
pub const SITE_NAME_KEY: &str = "site_name";

/// Build the snapshot of this site at `now`.
///
/// Sensors are listed in display order; a registered sensor without a reading
/// is still listed, with no temperature.
pub fn build_status_payload(
    store: &SensorStore,
    storage: &dyn Storage,
    weather: Option<&dyn WeatherSource>,
    now: DateTime<Local>,
) -> StatusPayload {
    let devices = storage.devices().unwrap_or_else(|e| {
        log::warn!("Failed to load devices for status: {}", e);
        Vec::new()
    });
    let readings = store.get_all_latest();

    let sensors = devices
        .iter()
        .map(|device| sensor_snapshot(device, readings.get(&device.sensor_id), now))
        .collect();

    let site_name = match storage.get_setting(SITE_NAME_KEY) {
        Ok(name) => name.filter(|n| !n.is_empty()),
        Err(e) => {
            log::warn!("Failed to read site name: {}", e);
            None
        }
    };

    StatusPayload {
        timestamp: Some(now.format(WIRE_TIME_FORMAT).to_string()),
        site_name,
        sensors,
        weather: weather
            .and_then(|w| w.latest())
            .map(|r| weather_snapshot(&r)),
    }
}

fn sensor_snapshot(
    device: &DeviceRecord,
    reading: Option<&Reading>,
    now: DateTime<Local>,
) -> RemoteSensorSnapshot {
    let mut snapshot = RemoteSensorSnapshot {
        name: device.display_name().to_string(),
        id: device.sensor_id.clone(),
        kind: device.kind.to_string(),
        order: device.display_order,
        temperature: None,
        humidity: None,
        battery_percent: None,
        battery_voltage: None,
        timestamp: None,
        age_seconds: None,
    };

    if let Some(reading) = reading {
        let taken: DateTime<Local> = reading.timestamp.into();
        snapshot.temperature = Some(reading.temperature);
        snapshot.humidity = reading.humidity;
        snapshot.battery_percent = reading.battery_percent;
        snapshot.battery_voltage = reading.battery_voltage;
        snapshot.timestamp = Some(taken.format(WIRE_TIME_FORMAT).to_string());
        snapshot.age_seconds = Some((now - taken).num_seconds().max(0));
    }
    snapshot
}

fn weather_snapshot(report: &WeatherReport) -> RemoteWeatherSnapshot {
    RemoteWeatherSnapshot {
        temperature: report.temperature,
        humidity: report.humidity,
        pressure: report.pressure,
        wind_speed: report.wind_speed,
        wind_direction: report.wind_direction,
        precipitation: report.precipitation,
        cloud_cover: report.cloud_cover,
        symbol_code: report.symbol_code.clone(),
        location: report.location.clone(),
        timestamp: report.timestamp.map(wire_time),
    }
}

fn wire_time(time: SystemTime) -> String {
    let local: DateTime<Local> = time.into();
    local.format(WIRE_TIME_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::SensorKind;
    use crate::storage::MemoryStorage;
    use crate::test_utils::{TEST_ID, base_reading};
    use crate::weather::WeatherError;
    use std::future::Future;
    use std::pin::Pin;
    use std::time::Duration;

    struct StaticWeather(WeatherReport);

    impl WeatherSource for StaticWeather {
        fn fetch_current(
            &self,
        ) -> Pin<Box<dyn Future<Output = Result<Option<WeatherReport>, WeatherError>> + Send + '_>>
        {
            let report = self.0.clone();
            Box::pin(async move { Ok(Some(report)) })
        }

        fn latest(&self) -> Option<WeatherReport> {
            Some(self.0.clone())
        }
    }

    #[test]
    fn test_snapshot_lists_devices_in_display_order() {
        let store = SensorStore::new();
        let storage = MemoryStorage::new();
        storage
            .register_device(TEST_ID, SensorKind::Ruuvi, "Sauna", true)
            .unwrap();
        storage
            .register_device("A4:C1:38:11:22:33", SensorKind::Xiaomi, "xiaomi", false)
            .unwrap();
        storage
            .set_alias("A4:C1:38:11:22:33", Some("Porch"))
            .unwrap();
        storage.set_order("A4:C1:38:11:22:33", 1).unwrap();
        storage.set_setting(SITE_NAME_KEY, "Cabin").unwrap();

        let now = Local::now();
        let mut reading = base_reading(TEST_ID, SystemTime::now() - Duration::from_secs(42), 68.25);
        reading.humidity = Some(9.5);
        reading.battery_percent = Some(80);
        store.add(reading);

        let payload = build_status_payload(&store, &storage, None, now);

        assert_eq!(payload.site_name.as_deref(), Some("Cabin"));
        assert!(payload.timestamp.is_some());
        assert!(payload.weather.is_none());

        let names: Vec<&str> = payload.sensors.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["Porch", "Sauna"]);

        let porch = &payload.sensors[0];
        assert_eq!(porch.kind, "xiaomi");
        assert_eq!(porch.temperature, None);
        assert_eq!(porch.age_seconds, None);

        let sauna = &payload.sensors[1];
        assert_eq!(sauna.id, TEST_ID);
        assert_eq!(sauna.temperature, Some(68.25));
        assert_eq!(sauna.humidity, Some(9.5));
        assert_eq!(sauna.battery_percent, Some(80));
        let age = sauna.age_seconds.unwrap();
        assert!((41..=43).contains(&age));
    }

    #[test]
    fn test_snapshot_includes_latest_weather() {
        let store = SensorStore::new();
        let storage = MemoryStorage::new();
        let weather = StaticWeather(WeatherReport {
            temperature: Some(-7.0),
            wind_speed: Some(4.5),
            location: Some("Kilpisjärvi".into()),
            ..Default::default()
        });

        let payload = build_status_payload(
            &store,
            &storage,
            Some(&weather as &dyn WeatherSource),
            Local::now(),
        );

        assert_eq!(payload.site_name, None);
        assert!(payload.sensors.is_empty());
        let weather = payload.weather.unwrap();
        assert_eq!(weather.temperature, Some(-7.0));
        assert_eq!(weather.wind_speed, Some(4.5));
        assert_eq!(weather.location.as_deref(), Some("Kilpisjärvi"));
        assert_eq!(weather.timestamp, None);
    }
}
