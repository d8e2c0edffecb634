//! Core application runner for `sitewatch`.
//!
//! This module is intentionally decoupled from CLI parsing and process exit codes
//! so it can be tested deterministically with injected collaborators.

use crate::aggregator::{Aggregator, AggregatorConfig};
use crate::config::{SensorDecl, SiteDecl, parse_duration, parse_sensor, parse_site};
use crate::mac_address::address_tail;
use crate::peer::{PeerConfig, PeerSyncEngine, PeerTransport, SnapshotFn, SyncMode};
use crate::scanner::{Backend, DeviceRouter, ScanBackend, ScannerSupervisor, SupervisorConfig};
use crate::status::{SITE_NAME_KEY, build_status_payload};
use crate::storage::{Storage, StorageError};
use crate::store::SensorStore;
use crate::weather::WeatherSource;
use chrono::Local;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Configuration for the core run loop.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// Declare a sensor so it skips auto-discovery.
    /// Format: --sensor DE:AD:BE:EF:00:00=ruuvi:Sauna (name optional)
    #[arg(long = "sensor", value_parser = parse_sensor, value_name = "MAC=KIND[:NAME]")]
    pub sensors: Vec<SensorDecl>,

    /// Poll a remote site read-only. Format: --remote cabin=http://cabin.local:8080
    #[arg(long = "remote", value_parser = parse_site, value_name = "NAME=URL")]
    pub remotes: Vec<SiteDecl>,

    /// Exchange snapshots with a peer. Format: --peer office=http://office.local:8080
    #[arg(long = "peer", value_parser = parse_site, value_name = "NAME=URL")]
    pub peers: Vec<SiteDecl>,

    /// Interval between polls of each remote site and peer.
    /// Accepts duration with suffix: 3s, 1m, 500ms, 2h.
    #[arg(long, default_value = "30s", value_parser = parse_duration)]
    pub poll_interval: Duration,

    /// Name this site reports to peers (persisted)
    #[arg(long)]
    pub site_name: Option<String>,

    /// Verbose output, log decode failures and scanner state changes
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Bluetooth scanner backend to use
    #[arg(long, default_value_t, value_enum)]
    pub backend: Backend,
}

/// Errors returned by the core run loop.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Scanner task failed: {0}")]
    Scanner(String),
}

/// Collaborators and timings injected into [`run`].
pub struct Services {
    pub backend: Arc<dyn ScanBackend>,
    pub storage: Arc<dyn Storage>,
    pub transport: Arc<dyn PeerTransport>,
    pub weather: Option<Arc<dyn WeatherSource>>,
    pub scanner: SupervisorConfig,
    pub aggregation: AggregatorConfig,
}

impl Services {
    pub fn new(
        backend: Arc<dyn ScanBackend>,
        storage: Arc<dyn Storage>,
        transport: Arc<dyn PeerTransport>,
    ) -> Self {
        Services {
            backend,
            storage,
            transport,
            weather: None,
            scanner: SupervisorConfig::default(),
            aggregation: AggregatorConfig::default(),
        }
    }

    pub fn with_weather(mut self, weather: Arc<dyn WeatherSource>) -> Self {
        self.weather = Some(weather);
        self
    }
}

fn site_configs(options: &Options) -> Vec<PeerConfig> {
    let remotes = options.remotes.iter().map(|s| (s, SyncMode::ReadOnly));
    let peers = options.peers.iter().map(|s| (s, SyncMode::Bidirectional));
    remotes
        .chain(peers)
        .map(|(site, mode)| PeerConfig {
            name: site.name.clone(),
            url: site.url.clone(),
            poll_interval: options.poll_interval,
            mode,
        })
        .collect()
}

/// Run the pipeline until `cancel` fires.
///
/// Declared sensors are registered first. Scanning, aggregation and peer sync
/// then run side by side; on cancellation they are stopped in reverse order
/// (peers, aggregator, scanner) before this returns.
pub async fn run(
    options: Options,
    services: Services,
    cancel: CancellationToken,
) -> Result<(), RunError> {
    let Services {
        backend,
        storage,
        transport,
        weather,
        scanner,
        aggregation,
    } = services;

    if let Some(name) = &options.site_name {
        storage.set_setting(SITE_NAME_KEY, name)?;
    }

    let store = Arc::new(SensorStore::new());
    let mut router = DeviceRouter::new(Arc::clone(&store), Some(Arc::clone(&storage)));
    for sensor in &options.sensors {
        let name = sensor
            .name
            .clone()
            .unwrap_or_else(|| format!("{}_{}", sensor.kind, address_tail(&sensor.id)));
        storage.register_device(&sensor.id, sensor.kind, &name, true)?;
        router.declare(&sensor.id, sensor.kind);
    }
    log::info!("{} sensors declared", options.sensors.len());

    let scan_cancel = CancellationToken::new();
    let mut supervisor = ScannerSupervisor::new(backend, router, scanner);
    let scanner_task = {
        let token = scan_cancel.clone();
        tokio::spawn(async move { supervisor.run(token).await })
    };

    let mut aggregator = Aggregator::new(
        Arc::clone(&store),
        Arc::clone(&storage),
        weather.clone(),
        aggregation,
    );
    aggregator.start();

    let snapshot: SnapshotFn = {
        let store = Arc::clone(&store);
        let storage = Arc::clone(&storage);
        Arc::new(move || {
            build_status_payload(&store, storage.as_ref(), weather.as_deref(), Local::now())
        })
    };
    let mut peers = PeerSyncEngine::new(site_configs(&options), transport, Some(storage), snapshot);
    peers.start();

    cancel.cancelled().await;
    log::info!("Shutting down");

    peers.stop().await;
    aggregator.stop().await;
    scan_cancel.cancel();
    scanner_task
        .await
        .map_err(|e| RunError::Scanner(e.to_string()))?;

    Ok(())
}
