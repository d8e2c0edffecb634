//! JSON shapes exchanged with peers and persisted as the site cache.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Wall-clock format used for timestamps on the wire.
pub const WIRE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Body of `GET /status`, and of both directions of `POST /sync`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusPayload {
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub site_name: Option<String>,
    #[serde(default)]
    pub sensors: Vec<RemoteSensorSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weather: Option<RemoteWeatherSnapshot>,
}

impl StatusPayload {
    pub fn from_json(body: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(body)
    }
}

/// One sensor as reported by a site. Absent values stay `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSensorSnapshot {
    #[serde(default = "unnamed")]
    pub name: String,
    #[serde(rename = "mac", default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub order: u32,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub humidity: Option<f64>,
    #[serde(default)]
    pub battery_percent: Option<u8>,
    #[serde(default)]
    pub battery_voltage: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub age_seconds: Option<i64>,
}

fn unnamed() -> String {
    "?".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteWeatherSnapshot {
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub humidity: Option<f64>,
    #[serde(default)]
    pub pressure: Option<f64>,
    #[serde(default)]
    pub wind_speed: Option<f64>,
    #[serde(default)]
    pub wind_direction: Option<f64>,
    #[serde(default)]
    pub precipitation: Option<f64>,
    #[serde(default)]
    pub cloud_cover: Option<f64>,
    #[serde(default)]
    pub symbol_code: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Persisted last-known state of one site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteCache {
    pub site_name: String,
    #[serde(default)]
    pub sensors: Vec<RemoteSensorSnapshot>,
    #[serde(default)]
    pub weather: Option<RemoteWeatherSnapshot>,
    #[serde(default)]
    pub last_fetch: Option<DateTime<Local>>,
}
