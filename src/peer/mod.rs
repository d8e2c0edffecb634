//! Polling of remote sites and bidirectional peers.
//!
//! Each configured site gets its own polling task. A site's cached state is
//! only ever written by its own task (or by an inbound sync for that site), so
//! one slow or unreachable site never holds up another.

pub mod transport;
pub mod wire;

pub use transport::{HttpResponse, PeerTransport, TransportError, UreqTransport};
pub use wire::{RemoteSensorSnapshot, RemoteWeatherSnapshot, SiteCache, StatusPayload};

use crate::storage::Storage;
use chrono::{DateTime, Local};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

/// Default interval between polls of one site.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PeerError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("HTTP {0}")]
    Status(u16),
    #[error("Invalid response: {0}")]
    Parse(String),
}

impl From<serde_json::Error> for PeerError {
    fn from(err: serde_json::Error) -> Self {
        PeerError::Parse(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// `GET /status` only
    ReadOnly,
    /// `POST /sync` with the local snapshot, falling back to read-only on 404
    Bidirectional,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::ReadOnly => write!(f, "remote"),
            SyncMode::Bidirectional => write!(f, "peer"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerConfig {
    pub name: String,
    /// Base URL; endpoints are resolved under `/api/v1/`
    pub url: String,
    pub poll_interval: Duration,
    pub mode: SyncMode,
}

impl PeerConfig {
    pub fn remote(name: &str, url: &str) -> Self {
        PeerConfig {
            name: name.to_string(),
            url: url.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            mode: SyncMode::ReadOnly,
        }
    }

    pub fn peer(name: &str, url: &str) -> Self {
        PeerConfig {
            mode: SyncMode::Bidirectional,
            ..Self::remote(name, url)
        }
    }

    pub fn status_url(&self) -> String {
        endpoint(&self.url, "status")
    }

    pub fn sync_url(&self) -> String {
        endpoint(&self.url, "sync")
    }
}

fn endpoint(base: &str, path: &str) -> String {
    format!("{}/api/v1/{}", base.trim_end_matches('/'), path)
}

/// Last known state of one site.
///
/// A failed poll flips `online` and sets `last_error` but keeps the sensors
/// and weather from the last success.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerSiteState {
    pub site_name: String,
    pub sensors: Vec<RemoteSensorSnapshot>,
    pub weather: Option<RemoteWeatherSnapshot>,
    pub last_fetch: Option<DateTime<Local>>,
    pub online: bool,
    pub last_error: Option<String>,
    /// Received through an inbound sync rather than polled
    pub incoming: bool,
}

impl PeerSiteState {
    fn empty(name: &str) -> Self {
        PeerSiteState {
            site_name: name.to_string(),
            sensors: Vec::new(),
            weather: None,
            last_fetch: None,
            online: false,
            last_error: None,
            incoming: false,
        }
    }

    fn from_payload(
        name: &str,
        payload: StatusPayload,
        fetched_at: DateTime<Local>,
        incoming: bool,
    ) -> Self {
        PeerSiteState {
            site_name: payload
                .site_name
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| name.to_string()),
            sensors: payload.sensors,
            weather: payload.weather,
            last_fetch: Some(fetched_at),
            online: true,
            last_error: None,
            incoming,
        }
    }

    fn from_cache(cache: SiteCache) -> Self {
        PeerSiteState {
            site_name: cache.site_name,
            sensors: cache.sensors,
            weather: cache.weather,
            last_fetch: cache.last_fetch,
            online: false,
            last_error: None,
            incoming: false,
        }
    }

    fn to_cache(&self) -> SiteCache {
        SiteCache {
            site_name: self.site_name.clone(),
            sensors: self.sensors.clone(),
            weather: self.weather.clone(),
            last_fetch: self.last_fetch,
        }
    }
}

/// Builds the local snapshot sent to peers and returned to inbound syncs.
pub type SnapshotFn = Arc<dyn Fn() -> StatusPayload + Send + Sync>;

struct Shared {
    sites: Mutex<BTreeMap<String, PeerSiteState>>,
    storage: Option<Arc<dyn Storage>>,
    transport: Arc<dyn PeerTransport>,
    snapshot: SnapshotFn,
    http_timeout: Duration,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, PeerSiteState>> {
        self.sites.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load_cache(&self, name: &str) -> Option<PeerSiteState> {
        let storage = self.storage.as_ref()?;
        let raw = match storage.get_site_cache(name) {
            Ok(raw) => raw?,
            Err(e) => {
                log::warn!("Failed to read cache for site {}: {}", name, e);
                return None;
            }
        };
        match serde_json::from_str::<SiteCache>(&raw) {
            Ok(cache) => {
                log::info!("Loaded cached data for site {}", name);
                Some(PeerSiteState::from_cache(cache))
            }
            Err(e) => {
                log::warn!("Ignoring unreadable cache for site {}: {}", name, e);
                None
            }
        }
    }

    fn save_cache(&self, name: &str, state: &PeerSiteState) {
        let Some(storage) = &self.storage else {
            return;
        };
        let json = match serde_json::to_string(&state.to_cache()) {
            Ok(json) => json,
            Err(e) => {
                log::warn!("Failed to encode cache for site {}: {}", name, e);
                return;
            }
        };
        if let Err(e) = storage.set_site_cache(name, &json) {
            log::warn!("Failed to save cache for site {}: {}", name, e);
        }
    }

    fn store(&self, name: &str, payload: StatusPayload, incoming: bool) {
        let state = PeerSiteState::from_payload(name, payload, Local::now(), incoming);
        log::debug!("Site {}: {} sensors", name, state.sensors.len());
        self.lock().insert(name.to_string(), state.clone());
        self.save_cache(name, &state);
    }

    fn mark_offline(&self, name: &str, error: &PeerError) {
        let mut sites = self.lock();
        let state = sites
            .entry(name.to_string())
            .or_insert_with(|| PeerSiteState::empty(name));
        state.online = false;
        state.incoming = false;
        state.last_error = Some(error.to_string());
    }

    async fn call(
        &self,
        request: transport::TransportFuture<'_>,
    ) -> Result<StatusPayload, PeerError> {
        let response = time::timeout(self.http_timeout, request)
            .await
            .map_err(|_| TransportError::Timeout(self.http_timeout))??;
        if response.status != 200 {
            return Err(PeerError::Status(response.status));
        }
        Ok(StatusPayload::from_json(&response.body)?)
    }
}

/// Polls one site until cancelled.
struct SitePoller {
    config: PeerConfig,
    mode: SyncMode,
    shared: Arc<Shared>,
}

impl SitePoller {
    fn new(config: PeerConfig, shared: Arc<Shared>) -> Self {
        SitePoller {
            mode: config.mode,
            config,
            shared,
        }
    }

    async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.poll_once() => {}
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    async fn poll_once(&mut self) {
        let name = &self.config.name;
        let result = match self.mode {
            SyncMode::ReadOnly => self.fetch().await,
            SyncMode::Bidirectional => match self.sync().await {
                Err(PeerError::Status(404)) => {
                    log::info!("Peer {} does not support sync, falling back to GET", name);
                    self.mode = SyncMode::ReadOnly;
                    self.fetch().await
                }
                other => other,
            },
        };

        match result {
            Ok(payload) => self.shared.store(name, payload, false),
            Err(e) => {
                log::warn!("{} {} unavailable: {}", self.mode, name, e);
                self.shared.mark_offline(name, &e);
            }
        }
    }

    async fn fetch(&self) -> Result<StatusPayload, PeerError> {
        let request = self.shared.transport.get(self.config.status_url());
        self.shared.call(request).await
    }

    async fn sync(&self) -> Result<StatusPayload, PeerError> {
        let body = serde_json::to_string(&(self.shared.snapshot)())?;
        let url = self.config.sync_url();
        let request = self.shared.transport.post_json(url, body);
        self.shared.call(request).await
    }
}

/// Keeps a cached [`PeerSiteState`] per configured remote site and peer.
pub struct PeerSyncEngine {
    shared: Arc<Shared>,
    sites: Vec<PeerConfig>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl PeerSyncEngine {
    /// Create the engine and load every site's persisted cache.
    ///
    /// Reloaded sites start offline until their first poll succeeds.
    pub fn new(
        sites: Vec<PeerConfig>,
        transport: Arc<dyn PeerTransport>,
        storage: Option<Arc<dyn Storage>>,
        snapshot: SnapshotFn,
    ) -> Self {
        let shared = Arc::new(Shared {
            sites: Mutex::new(BTreeMap::new()),
            storage,
            transport,
            snapshot,
            http_timeout: transport::HTTP_TIMEOUT,
        });

        for site in &sites {
            let state = shared
                .load_cache(&site.name)
                .unwrap_or_else(|| PeerSiteState::empty(&site.name));
            shared.lock().insert(site.name.clone(), state);
        }

        PeerSyncEngine {
            shared,
            sites,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    /// Override the per-request HTTP bound. Must be called before [`start`](Self::start).
    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.http_timeout = timeout;
        }
        self
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Spawn one polling task per configured site.
    pub fn start(&mut self) {
        if self.is_running() || self.sites.is_empty() {
            return;
        }
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }

        for site in &self.sites {
            let poller = SitePoller::new(site.clone(), Arc::clone(&self.shared));
            let task = tokio::spawn(poller.run(self.cancel.clone()));
            self.tasks.push(task);
        }

        let peers = self
            .sites
            .iter()
            .filter(|s| s.mode == SyncMode::Bidirectional)
            .count();
        log::info!(
            "Peer sync started: {} remote site(s), {} peer(s)",
            self.sites.len() - peers,
            peers
        );
    }

    /// Cancel all pollers and wait for them to finish. Safe to call repeatedly.
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
                log::error!("Peer poller panicked: {}", e);
            }
        }
        log::info!("Peer sync stopped");
    }

    /// Snapshot of every site's cached state, keyed by configured name.
    pub fn get_all_site_data(&self) -> BTreeMap<String, PeerSiteState> {
        self.shared.lock().clone()
    }

    pub fn site(&self, name: &str) -> Option<PeerSiteState> {
        self.shared.lock().get(name).cloned()
    }

    /// Store a snapshot POSTed by `site_name` as its cached state.
    pub fn receive_peer_data(&self, site_name: &str, body: &str) -> Result<(), PeerError> {
        let payload = StatusPayload::from_json(body)?;
        self.shared.store(site_name, payload, true);
        Ok(())
    }

    /// Handle an inbound `POST /sync`: store the sender's state and return
    /// the local snapshot for the response body.
    pub fn handle_incoming_sync(&self, site_name: &str, body: &str) -> StatusPayload {
        if let Err(e) = self.receive_peer_data(site_name, body) {
            log::warn!("Failed to parse incoming sync from {}: {}", site_name, e);
        }
        (self.shared.snapshot)()
    }
}
