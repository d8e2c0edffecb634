//! Weather collaborator interface.
//!
//! Fetching current conditions happens outside this crate; the aggregator
//! polls a [`WeatherSource`] on its own schedule and persists the result.

use std::future::Future;
use std::pin::Pin;
use std::time::SystemTime;
use thiserror::Error;

/// Errors a weather source may report.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WeatherError {
    #[error("Weather fetch failed: {0}")]
    Fetch(String),
    #[error("Weather fetch timed out")]
    Timeout,
}

/// Current conditions at the configured location.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WeatherReport {
    /// Observation time reported by the provider
    pub timestamp: Option<SystemTime>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub pressure: Option<f64>,
    pub wind_speed: Option<f64>,
    pub wind_direction: Option<f64>,
    pub precipitation: Option<f64>,
    pub cloud_cover: Option<f64>,
    pub symbol_code: Option<String>,
    pub location: Option<String>,
}

/// A weather report persisted on the weather bucket grid.
#[derive(Debug, Clone, PartialEq)]
pub struct WeatherBucket {
    pub bucket_start: SystemTime,
    pub report: WeatherReport,
}

/// Source of current weather conditions.
pub trait WeatherSource: Send + Sync {
    /// Fetch current conditions. `Ok(None)` means the provider had no data.
    fn fetch_current(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<WeatherReport>, WeatherError>> + Send + '_>>;

    /// Most recent successfully fetched report, if any.
    fn latest(&self) -> Option<WeatherReport>;
}
