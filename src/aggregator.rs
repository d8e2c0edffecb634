//! Periodic rollup of live readings into five-minute buckets, plus the
//! weather polling task.

use crate::reading::AggregatedBucket;
use crate::storage::Storage;
use crate::store::SensorStore;
use crate::weather::{WeatherBucket, WeatherError, WeatherSource};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Aggregation window and bucket grid.
pub const AGGREGATION_PERIOD: Duration = Duration::from_secs(5 * 60);

/// Weather polling interval and bucket grid.
pub const WEATHER_PERIOD: Duration = Duration::from_secs(30 * 60);

/// Upper bound for one weather fetch.
pub const WEATHER_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub struct AggregatorConfig {
    pub period: Duration,
    pub weather_period: Duration,
    pub weather_timeout: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        AggregatorConfig {
            period: AGGREGATION_PERIOD,
            weather_period: WEATHER_PERIOD,
            weather_timeout: WEATHER_FETCH_TIMEOUT,
        }
    }
}

/// Floor `time` to a multiple of `grid` since the Unix epoch.
pub fn floor_to_grid(time: SystemTime, grid: Duration) -> SystemTime {
    let grid_secs = grid.as_secs().max(1);
    let secs = time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    UNIX_EPOCH + Duration::from_secs(secs - secs % grid_secs)
}

struct Shared {
    store: Arc<SensorStore>,
    storage: Arc<dyn Storage>,
    weather: Option<Arc<dyn WeatherSource>>,
    config: AggregatorConfig,
}

impl Shared {
    fn aggregate_at(&self, now: SystemTime) -> usize {
        let window_start = now.checked_sub(self.config.period).unwrap_or(UNIX_EPOCH);
        let bucket_start = floor_to_grid(now, self.config.period);

        let mut written = 0;
        for sensor_id in self.store.sensor_ids() {
            let readings: Vec<_> = self
                .store
                .history_since(&sensor_id, window_start)
                .into_iter()
                .filter(|r| r.timestamp <= now)
                .collect();
            let Some(bucket) = AggregatedBucket::from_readings(&sensor_id, bucket_start, &readings)
            else {
                continue;
            };

            match self.storage.upsert_aggregated_reading(&bucket) {
                Ok(()) => written += 1,
                Err(e) => log::error!("Failed to store aggregate for {}: {}", sensor_id, e),
            }
        }

        log::debug!("Aggregated {} sensors", written);
        written
    }

    async fn fetch_weather(&self) -> bool {
        let Some(source) = &self.weather else {
            return false;
        };

        let fetch = time::timeout(self.config.weather_timeout, source.fetch_current());
        let report = match fetch.await {
            Ok(Ok(Some(report))) => report,
            Ok(Ok(None)) => {
                log::debug!("Weather source returned no data");
                return false;
            }
            Ok(Err(e)) => {
                log::warn!("Weather fetch failed: {}", e);
                return false;
            }
            Err(_) => {
                log::warn!("{}", WeatherError::Timeout);
                return false;
            }
        };

        let bucket = WeatherBucket {
            bucket_start: floor_to_grid(SystemTime::now(), self.config.weather_period),
            report,
        };
        match self.storage.upsert_weather(&bucket) {
            Ok(()) => true,
            Err(e) => {
                log::error!("Failed to store weather: {}", e);
                false
            }
        }
    }
}

/// Rolls [`SensorStore`] readings into [`AggregatedBucket`]s on a fixed tick
/// and, when a weather source is configured, persists weather on its own tick.
///
/// The two tasks are independent: a failing or slow weather source never
/// delays aggregation.
pub struct Aggregator {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Aggregator {
    pub fn new(
        store: Arc<SensorStore>,
        storage: Arc<dyn Storage>,
        weather: Option<Arc<dyn WeatherSource>>,
        config: AggregatorConfig,
    ) -> Self {
        Aggregator {
            shared: Arc::new(Shared {
                store,
                storage,
                weather,
                config,
            }),
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Spawn the aggregation task and, if configured, the weather task.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }

        let shared = Arc::clone(&self.shared);
        let cancel = self.cancel.clone();
        self.tasks.push(tokio::spawn(async move {
            let period = shared.config.period;
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        shared.aggregate_at(SystemTime::now());
                    }
                }
            }
        }));

        if self.shared.weather.is_some() {
            let shared = Arc::clone(&self.shared);
            let cancel = self.cancel.clone();
            self.tasks.push(tokio::spawn(async move {
                let mut ticker = time::interval(shared.config.weather_period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            tokio::select! {
                                biased;
                                _ = cancel.cancelled() => break,
                                _ = shared.fetch_weather() => {}
                            }
                        }
                    }
                }
            }));
        }

        let period = self.shared.config.period;
        log::info!("Aggregator started (every {:?})", period);
    }

    /// Cancel both tasks and wait for them. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.drain(..).collect();
        if tasks.is_empty() {
            return;
        }
        for task in tasks {
            if let Err(e) = task.await
                && e.is_panic()
            {
                log::error!("Aggregator task panicked: {}", e);
            }
        }
        log::info!("Aggregator stopped");
    }

    /// Aggregate the window ending at `now`. Returns the number of buckets written.
    pub fn aggregate_at(&self, now: SystemTime) -> usize {
        self.shared.aggregate_at(now)
    }

    /// Fetch and persist weather out of schedule. `true` when a bucket was written.
    pub async fn fetch_weather_now(&self) -> bool {
        self.shared.fetch_weather().await
    }
}
