//! BLE scanning: backend abstraction, advertisement routing and the
//! self-restarting supervisor.
//!
//! Backends only deliver raw [`AdvertisementRecord`]s. Decoding, device
//! registration and restart policy live here so they can be tested without
//! Bluetooth hardware.

#[cfg(feature = "bluer")]
pub mod bluer;

pub mod router;
pub mod supervisor;

pub use router::DeviceRouter;
pub use supervisor::{ScannerState, ScannerSupervisor, SupervisorConfig};

use crate::decoder::AdvertisementRecord;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Error type for scanner operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScanError {
    /// Bluetooth/adapter related error
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
    /// The scan event stream closed while the session was active
    #[error("Scan stream ended unexpectedly")]
    StreamEnded,
    /// An adapter call did not complete in time
    #[error("{0} timed out after {1:?}")]
    Timeout(&'static str, Duration),
    /// Backend not available (not compiled in)
    #[allow(dead_code)]
    #[error("Backend '{0}' not available (not compiled in)")]
    BackendNotAvailable(String),
}

/// Convenience alias for advertisements or scan failures.
pub type AdvertisementResult = Result<AdvertisementRecord, ScanError>;

/// Channel buffer size for advertisements delivered by a session.
pub const ADVERTISEMENT_CHANNEL_BUFFER_SIZE: usize = 256;

/// One open scan: an advertisement stream fed by a backend worker task.
///
/// The worker owns all backend state. [`ScanSession::stop`] asks it to shut
/// down and waits for it; a session dropped or abandoned aborts the worker.
#[derive(Debug)]
pub struct ScanSession {
    events: mpsc::Receiver<AdvertisementResult>,
    shutdown: Option<oneshot::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl ScanSession {
    /// Spawn a backend worker and wrap it in a session.
    ///
    /// The worker receives the advertisement sender and a shutdown signal; it
    /// must release its backend resources and return once the signal fires.
    pub fn spawn<F, Fut>(worker: F) -> Self
    where
        F: FnOnce(mpsc::Sender<AdvertisementResult>, oneshot::Receiver<()>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, events) = mpsc::channel(ADVERTISEMENT_CHANNEL_BUFFER_SIZE);
        let (shutdown, shutdown_rx) = oneshot::channel();
        let worker = tokio::spawn(worker(tx, shutdown_rx));
        ScanSession {
            events,
            shutdown: Some(shutdown),
            worker: Some(worker),
        }
    }

    /// Next advertisement, or `None` once the worker has gone away.
    pub async fn recv(&mut self) -> Option<AdvertisementResult> {
        self.events.recv().await
    }

    /// Signal the worker to stop and wait until it has released the scan.
    ///
    /// Not bounded; callers wrap it in a timeout and [`abandon`](Self::abandon)
    /// the session if it hangs.
    pub async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.events.close();

        if let Some(worker) = self.worker.as_mut() {
            if let Err(e) = worker.await
                && e.is_panic()
            {
                log::warn!("Scan worker panicked: {}", e);
            }
            self.worker = None;
        }
    }

    /// Give up on a worker that did not stop in time.
    pub fn abandon(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

impl Drop for ScanSession {
    fn drop(&mut self) {
        self.abandon();
    }
}

/// Scan backend abstraction to enable deterministic tests without Bluetooth hardware.
pub trait ScanBackend: Send + Sync {
    /// Open a fresh scan session.
    fn start_scan(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<ScanSession, ScanError>> + Send + '_>>;

    /// Best-effort power cycle of the radio adapter.
    fn reset_adapter(&self) -> Pin<Box<dyn Future<Output = Result<(), ScanError>> + Send + '_>>;

    /// `false` on platforms where the OS exclusively owns the radio.
    fn supports_adapter_reset(&self) -> bool {
        !cfg!(target_os = "macos")
    }
}

/// Available scanner backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// BlueZ D-Bus backend (requires bluetoothd daemon)
    #[cfg(feature = "bluer")]
    Bluer,
}

impl Default for Backend {
    fn default() -> Self {
        #[cfg(feature = "bluer")]
        return Backend::Bluer;
        #[cfg(not(feature = "bluer"))]
        compile_error!("At least one backend feature must be enabled");
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "bluer")]
            Backend::Bluer => write!(f, "bluer"),
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            #[cfg(feature = "bluer")]
            "bluer" | "bluez" => Ok(Backend::Bluer),
            _ => Err(format!("Unknown backend: {}", s)),
        }
    }
}

/// Instantiate the compiled-in backend selected on the command line.
pub fn create_backend(backend: Backend) -> Arc<dyn ScanBackend> {
    match backend {
        #[cfg(feature = "bluer")]
        Backend::Bluer => Arc::new(bluer::BluerBackend::default()),
    }
}
