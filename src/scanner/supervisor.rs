//! Self-restarting scan loop with a no-data watchdog.

use super::{DeviceRouter, ScanBackend, ScanError, ScanSession};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

/// Lifecycle of the supervised scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScannerState {
    Idle,
    Scanning,
    Restarting,
    /// Terminal; only reached through cancellation
    Stopped,
}

/// Restart and watchdog timing.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    /// Unconditional restart after a session has been open this long
    pub restart_interval: Duration,
    /// Restart once no reading has reached the store for this long
    pub watchdog_timeout: Duration,
    /// Upper bound for stopping a session before it is abandoned
    pub stop_timeout: Duration,
    /// Pause between stopping one session and starting the next
    pub restart_pause: Duration,
    /// Extra wait after a scan error or failed start
    pub error_backoff: Duration,
    /// Power-cycle the adapter between sessions where supported
    pub reset_adapter: bool,
    /// Upper bound for an adapter reset before it is given up on
    pub reset_timeout: Duration,
    /// Upper bound for opening a session; a timeout counts as a failed start
    pub start_timeout: Duration,
}

impl SupervisorConfig {
    /// Timings for the platform this binary is built for.
    ///
    /// BlueZ discovery is prone to stalling silently, so Linux restarts more
    /// often than macOS, where the OS owns the radio.
    pub fn for_platform() -> Self {
        let (restart_interval, watchdog_timeout) = if cfg!(target_os = "macos") {
            (Duration::from_secs(300), Duration::from_secs(120))
        } else {
            (Duration::from_secs(60), Duration::from_secs(45))
        };

        SupervisorConfig {
            restart_interval,
            watchdog_timeout,
            stop_timeout: Duration::from_secs(10),
            restart_pause: Duration::from_secs(1),
            error_backoff: Duration::from_secs(3),
            reset_adapter: true,
            reset_timeout: Duration::from_secs(20),
            start_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::for_platform()
    }
}

/// Why a scan session ended.
#[derive(Debug)]
enum CycleEnd {
    Proactive,
    Watchdog(Duration),
    Failed(ScanError),
    Cancelled,
}

/// Keeps a scan session open, restarting it on a timer, when the watchdog
/// fires, or after a scan error, until cancelled.
pub struct ScannerSupervisor {
    backend: Arc<dyn ScanBackend>,
    router: DeviceRouter,
    config: SupervisorConfig,
    state: watch::Sender<ScannerState>,
    restarts: u64,
}

impl ScannerSupervisor {
    pub fn new(
        backend: Arc<dyn ScanBackend>,
        router: DeviceRouter,
        config: SupervisorConfig,
    ) -> Self {
        let (state, _) = watch::channel(ScannerState::Idle);
        ScannerSupervisor {
            backend,
            router,
            config,
            state,
            restarts: 0,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ScannerState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ScannerState {
        *self.state.borrow()
    }

    /// Number of restarts performed so far.
    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    pub fn router(&self) -> &DeviceRouter {
        &self.router
    }

    pub fn router_mut(&mut self) -> &mut DeviceRouter {
        &mut self.router
    }

    fn set_state(&self, next: ScannerState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            log::debug!("Scanner state {:?} -> {:?}", current, next);
            *current = next;
            true
        });
    }

    /// Run until `cancel` fires. Never returns on its own.
    ///
    /// On the way out the open session is stopped within the stop timeout and
    /// the state is left at [`ScannerState::Stopped`].
    pub async fn run(&mut self, cancel: CancellationToken) {
        log::info!(
            "Scanner starting (restart every {:?}, watchdog {:?})",
            self.config.restart_interval,
            self.config.watchdog_timeout
        );

        let mut first_cycle = true;
        loop {
            if !first_cycle {
                self.set_state(ScannerState::Restarting);
                self.restarts += 1;
                if !self.prepare_restart(&cancel).await {
                    break;
                }
            }
            first_cycle = false;

            let start_timeout = self.config.start_timeout;
            let started = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = time::timeout(start_timeout, self.backend.start_scan()) => {
                    result.unwrap_or(Err(ScanError::Timeout("Scan start", start_timeout)))
                }
            };

            let mut session = match started {
                Ok(session) => session,
                Err(e) => {
                    log::error!("Failed to start scan: {}", e);
                    self.set_state(ScannerState::Restarting);
                    if !sleep_or_cancel(self.config.error_backoff, &cancel).await {
                        break;
                    }
                    continue;
                }
            };

            self.set_state(ScannerState::Scanning);
            let end = self.scan_cycle(&mut session, &cancel).await;
            if !matches!(end, CycleEnd::Cancelled) {
                self.set_state(ScannerState::Restarting);
            }
            self.stop_session(&mut session).await;

            match end {
                CycleEnd::Proactive => {
                    log::info!(
                        "Restarting scan after {:?} (scheduled)",
                        self.config.restart_interval
                    );
                }
                CycleEnd::Watchdog(silence) => {
                    log::warn!("No sensor data for {:?}, restarting scan", silence);
                }
                CycleEnd::Failed(e) => {
                    log::error!("Scan failed: {}", e);
                    if !sleep_or_cancel(self.config.error_backoff, &cancel).await {
                        break;
                    }
                }
                CycleEnd::Cancelled => break,
            }
        }

        self.set_state(ScannerState::Stopped);
        log::info!("Scanner stopped after {} restarts", self.restarts);
    }

    /// Reset the adapter if possible, then pause. `false` when cancelled.
    async fn prepare_restart(&self, cancel: &CancellationToken) -> bool {
        if self.config.reset_adapter && self.backend.supports_adapter_reset() {
            let reset_timeout = self.config.reset_timeout;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                result = time::timeout(reset_timeout, self.backend.reset_adapter()) => {
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => log::warn!("Adapter reset failed: {}", e),
                        Err(_) => log::warn!("Adapter reset timed out after {:?}", reset_timeout),
                    }
                }
            }
        }
        sleep_or_cancel(self.config.restart_pause, cancel).await
    }

    async fn scan_cycle(
        &mut self,
        session: &mut ScanSession,
        cancel: &CancellationToken,
    ) -> CycleEnd {
        let started = Instant::now();
        let cycle_deadline = started + self.config.restart_interval;
        let mut last_data = started;

        loop {
            let watchdog_deadline = last_data + self.config.watchdog_timeout;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return CycleEnd::Cancelled,
                _ = time::sleep_until(watchdog_deadline) => {
                    return CycleEnd::Watchdog(last_data.elapsed());
                }
                _ = time::sleep_until(cycle_deadline) => return CycleEnd::Proactive,
                event = session.recv() => match event {
                    Some(Ok(record)) => {
                        if self.router.handle(&record, SystemTime::now()) {
                            last_data = Instant::now();
                        }
                    }
                    Some(Err(e)) => return CycleEnd::Failed(e),
                    None => return CycleEnd::Failed(ScanError::StreamEnded),
                },
            }
        }
    }

    async fn stop_session(&self, session: &mut ScanSession) {
        if time::timeout(self.config.stop_timeout, session.stop())
            .await
            .is_err()
        {
            log::warn!(
                "Scan did not stop within {:?}, abandoning it",
                self.config.stop_timeout
            );
            session.abandon();
        }
    }
}

/// Sleep for `duration`; `false` if cancelled first.
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::ruuvi;
    use crate::store::SensorStore;
    use crate::test_utils::{TEST_ID, df5_payload, manufacturer_record};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::task::JoinHandle;

    #[derive(Default)]
    struct Counters {
        starts: AtomicUsize,
        stops: AtomicUsize,
        resets: AtomicUsize,
    }

    /// Scan backend driven by virtual time.
    struct FakeBackend {
        counters: Arc<Counters>,
        failing_starts: usize,
        hanging_starts: usize,
        emit_every: Option<Duration>,
        hang_on_stop: bool,
        hang_on_reset: bool,
    }

    impl FakeBackend {
        fn silent() -> Self {
            FakeBackend {
                counters: Arc::default(),
                failing_starts: 0,
                hanging_starts: 0,
                emit_every: None,
                hang_on_stop: false,
                hang_on_reset: false,
            }
        }
    }

    impl ScanBackend for FakeBackend {
        fn start_scan(
            &self,
        ) -> Pin<Box<dyn Future<Output = Result<ScanSession, ScanError>> + Send + '_>> {
            Box::pin(async move {
                let attempt = self.counters.starts.fetch_add(1, Ordering::SeqCst);
                if attempt < self.hanging_starts {
                    std::future::pending::<()>().await;
                }
                if attempt < self.failing_starts {
                    return Err(ScanError::Bluetooth("adapter busy".into()));
                }

                let counters = Arc::clone(&self.counters);
                let emit_every = self.emit_every;
                let hang = self.hang_on_stop;
                let record = manufacturer_record(TEST_ID, ruuvi::MANUFACTURER_ID, &df5_payload());
                Ok(ScanSession::spawn(move |tx, mut shutdown| async move {
                    loop {
                        let tick = async {
                            match emit_every {
                                Some(every) => time::sleep(every).await,
                                None => std::future::pending::<()>().await,
                            }
                        };
                        tokio::select! {
                            _ = &mut shutdown => break,
                            _ = tick => {
                                if tx.send(Ok(record.clone())).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    if hang {
                        std::future::pending::<()>().await;
                    }
                    counters.stops.fetch_add(1, Ordering::SeqCst);
                }))
            })
        }

        fn reset_adapter(
            &self,
        ) -> Pin<Box<dyn Future<Output = Result<(), ScanError>> + Send + '_>> {
            Box::pin(async move {
                self.counters.resets.fetch_add(1, Ordering::SeqCst);
                if self.hang_on_reset {
                    std::future::pending::<()>().await;
                }
                Err(ScanError::Bluetooth("permission denied".into()))
            })
        }

        fn supports_adapter_reset(&self) -> bool {
            true
        }
    }

    fn config() -> SupervisorConfig {
        SupervisorConfig {
            restart_interval: Duration::from_secs(3600),
            watchdog_timeout: Duration::from_secs(45),
            stop_timeout: Duration::from_secs(10),
            restart_pause: Duration::from_secs(1),
            error_backoff: Duration::from_secs(3),
            reset_adapter: false,
            reset_timeout: Duration::from_secs(20),
            start_timeout: Duration::from_secs(10),
        }
    }

    struct Harness {
        counters: Arc<Counters>,
        store: Arc<SensorStore>,
        state: watch::Receiver<ScannerState>,
        cancel: CancellationToken,
        task: JoinHandle<ScannerSupervisor>,
    }

    fn start(backend: FakeBackend, config: SupervisorConfig) -> Harness {
        let counters = Arc::clone(&backend.counters);
        let store = Arc::new(SensorStore::new());
        let router = DeviceRouter::new(Arc::clone(&store), None);
        let mut supervisor = ScannerSupervisor::new(Arc::new(backend), router, config);
        let state = supervisor.subscribe();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            supervisor.run(token).await;
            supervisor
        });
        Harness {
            counters,
            store,
            state,
            cancel,
            task,
        }
    }

    async fn advance_to(secs: u64, origin: Instant) {
        time::sleep_until(origin + Duration::from_secs(secs)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_restarts_once_per_breach() {
        let origin = Instant::now();
        let h = start(FakeBackend::silent(), config());

        advance_to(30, origin).await;
        assert_eq!(h.counters.starts.load(Ordering::SeqCst), 1);

        // Watchdog fires at 45s, restart after the 1s pause
        advance_to(50, origin).await;
        assert_eq!(h.counters.starts.load(Ordering::SeqCst), 2);
        assert_eq!(h.counters.stops.load(Ordering::SeqCst), 1);

        advance_to(80, origin).await;
        assert_eq!(h.counters.starts.load(Ordering::SeqCst), 2);

        // Second breach 45s after the second start
        advance_to(95, origin).await;
        assert_eq!(h.counters.starts.load(Ordering::SeqCst), 3);
        assert_eq!(*h.state.borrow(), ScannerState::Scanning);

        h.cancel.cancel();
        let supervisor = h.task.await.unwrap();
        assert_eq!(supervisor.restarts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flowing_data_keeps_watchdog_quiet_until_scheduled_restart() {
        let origin = Instant::now();
        let backend = FakeBackend {
            emit_every: Some(Duration::from_secs(2)),
            ..FakeBackend::silent()
        };
        let config = SupervisorConfig {
            restart_interval: Duration::from_secs(20),
            watchdog_timeout: Duration::from_secs(5),
            ..config()
        };
        let h = start(backend, config);

        advance_to(19, origin).await;
        assert_eq!(h.counters.starts.load(Ordering::SeqCst), 1);
        assert!(h.store.get_latest(TEST_ID).is_some());

        // Scheduled restart at 20s, next session at 21s
        advance_to(22, origin).await;
        assert_eq!(h.counters.starts.load(Ordering::SeqCst), 2);
        assert_eq!(h.counters.stops.load(Ordering::SeqCst), 1);

        h.cancel.cancel();
        let supervisor = h.task.await.unwrap();
        assert_eq!(supervisor.router().known_count(), 1);
        let history = h.store.get_history(TEST_ID, Duration::from_secs(60));
        assert!(history.len() >= 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_start_backs_off_and_retries() {
        let origin = Instant::now();
        let backend = FakeBackend {
            failing_starts: 2,
            ..FakeBackend::silent()
        };
        let mut h = start(backend, config());

        // Attempts at 0s, 4s (backoff 3s + pause 1s) and 8s
        advance_to(2, origin).await;
        assert_eq!(h.counters.starts.load(Ordering::SeqCst), 1);
        assert_eq!(*h.state.borrow_and_update(), ScannerState::Restarting);

        advance_to(5, origin).await;
        assert_eq!(h.counters.starts.load(Ordering::SeqCst), 2);

        advance_to(9, origin).await;
        assert_eq!(h.counters.starts.load(Ordering::SeqCst), 3);
        assert_eq!(*h.state.borrow(), ScannerState::Scanning);

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_error_triggers_restart() {
        struct ErroringBackend(AtomicUsize);

        impl ScanBackend for ErroringBackend {
            fn start_scan(
                &self,
            ) -> Pin<Box<dyn Future<Output = Result<ScanSession, ScanError>> + Send + '_>> {
                Box::pin(async move {
                    self.0.fetch_add(1, Ordering::SeqCst);
                    Ok(ScanSession::spawn(|tx, _shutdown| async move {
                        let _ = tx.send(Err(ScanError::Bluetooth("dbus gone".into()))).await;
                    }))
                })
            }

            fn reset_adapter(
                &self,
            ) -> Pin<Box<dyn Future<Output = Result<(), ScanError>> + Send + '_>> {
                Box::pin(async { Ok(()) })
            }
        }

        let origin = Instant::now();
        let backend = Arc::new(ErroringBackend(AtomicUsize::new(0)));
        let router = DeviceRouter::new(Arc::new(SensorStore::new()), None);
        let mut supervisor =
            ScannerSupervisor::new(backend.clone() as Arc<dyn ScanBackend>, router, config());
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move { supervisor.run(token).await });

        // Error at 0s, backoff 3s, pause 1s
        advance_to(3, origin).await;
        assert_eq!(backend.0.load(Ordering::SeqCst), 1);
        advance_to(5, origin).await;
        assert_eq!(backend.0.load(Ordering::SeqCst), 2);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_stop_is_abandoned() {
        let origin = Instant::now();
        let backend = FakeBackend {
            hang_on_stop: true,
            ..FakeBackend::silent()
        };
        let config = SupervisorConfig {
            watchdog_timeout: Duration::from_secs(5),
            ..config()
        };
        let h = start(backend, config);

        // Watchdog at 5s, stop gives up at 15s, next start at 16s
        advance_to(14, origin).await;
        assert_eq!(h.counters.starts.load(Ordering::SeqCst), 1);
        assert_eq!(*h.state.borrow(), ScannerState::Restarting);

        advance_to(17, origin).await;
        assert_eq!(h.counters.starts.load(Ordering::SeqCst), 2);
        assert_eq!(h.counters.stops.load(Ordering::SeqCst), 0);

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_session_and_ends_stopped() {
        let origin = Instant::now();
        let h = start(FakeBackend::silent(), config());

        advance_to(3, origin).await;
        assert_eq!(*h.state.borrow(), ScannerState::Scanning);

        h.cancel.cancel();
        let supervisor = h.task.await.unwrap();

        assert!(origin.elapsed() < Duration::from_secs(4));
        assert_eq!(h.counters.stops.load(Ordering::SeqCst), 1);
        assert_eq!(supervisor.state(), ScannerState::Stopped);
        assert_eq!(*h.state.borrow(), ScannerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let origin = Instant::now();
        let backend = FakeBackend {
            failing_starts: usize::MAX,
            ..FakeBackend::silent()
        };
        let h = start(backend, config());

        advance_to(1, origin).await;
        h.cancel.cancel();
        let supervisor = h.task.await.unwrap();

        assert!(origin.elapsed() < Duration::from_secs(2));
        assert_eq!(supervisor.state(), ScannerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_adapter_reset_between_sessions_is_best_effort() {
        let origin = Instant::now();
        let config = SupervisorConfig {
            watchdog_timeout: Duration::from_secs(5),
            reset_adapter: true,
            ..config()
        };
        let h = start(FakeBackend::silent(), config);

        advance_to(4, origin).await;
        assert_eq!(h.counters.resets.load(Ordering::SeqCst), 0);

        // Reset fails but the next session still opens
        advance_to(7, origin).await;
        assert_eq!(h.counters.resets.load(Ordering::SeqCst), 1);
        assert_eq!(h.counters.starts.load(Ordering::SeqCst), 2);

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_adapter_reset_is_given_up() {
        let origin = Instant::now();
        let backend = FakeBackend {
            hang_on_reset: true,
            ..FakeBackend::silent()
        };
        let config = SupervisorConfig {
            watchdog_timeout: Duration::from_secs(5),
            reset_adapter: true,
            ..config()
        };
        let h = start(backend, config);

        // Watchdog at 5s, reset gives up at 25s, next start at 26s
        advance_to(24, origin).await;
        assert_eq!(h.counters.starts.load(Ordering::SeqCst), 1);
        assert_eq!(*h.state.borrow(), ScannerState::Restarting);

        advance_to(27, origin).await;
        assert_eq!(h.counters.resets.load(Ordering::SeqCst), 1);
        assert_eq!(h.counters.starts.load(Ordering::SeqCst), 2);
        assert_eq!(*h.state.borrow(), ScannerState::Scanning);

        // Keeps cycling hours later
        advance_to(6 * 3600, origin).await;
        assert!(h.counters.starts.load(Ordering::SeqCst) > 100);

        h.cancel.cancel();
        let supervisor = h.task.await.unwrap();
        assert_eq!(supervisor.state(), ScannerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_start_counts_as_failed_start() {
        let origin = Instant::now();
        let backend = FakeBackend {
            hanging_starts: 1,
            ..FakeBackend::silent()
        };
        let h = start(backend, config());

        // Start gives up at 10s, backoff 3s, pause 1s
        advance_to(12, origin).await;
        assert_eq!(h.counters.starts.load(Ordering::SeqCst), 1);
        assert_eq!(*h.state.borrow(), ScannerState::Restarting);

        advance_to(15, origin).await;
        assert_eq!(h.counters.starts.load(Ordering::SeqCst), 2);
        assert_eq!(*h.state.borrow(), ScannerState::Scanning);

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[test]
    fn test_platform_defaults() {
        let config = SupervisorConfig::default();
        assert!(config.watchdog_timeout < config.restart_interval);
        assert_eq!(config.stop_timeout, Duration::from_secs(10));
        assert_eq!(config.restart_pause, Duration::from_secs(1));
        assert_eq!(config.error_backoff, Duration::from_secs(3));
        assert_eq!(config.reset_timeout, Duration::from_secs(20));
        assert_eq!(config.start_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_new_supervisor_is_idle() {
        let router = DeviceRouter::new(Arc::new(SensorStore::new()), None);
        let supervisor = ScannerSupervisor::new(Arc::new(FakeBackend::silent()), router, config());
        assert_eq!(supervisor.state(), ScannerState::Idle);
        assert_eq!(supervisor.restarts(), 0);
    }
}
