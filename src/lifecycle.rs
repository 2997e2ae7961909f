use crate::config::{Config, DEFAULT_CONFIG_PATH, DEFAULT_PORT};
use crate::energy_ledger::SharedLedger;
use crate::error::MonitorError;
use crate::http_api::{self, AppState};
use crate::mqtt_publisher::TelemetryClient;
use crate::pulse_ingestor::{CommandIndicator, PulseIndicator, PulseIngestor};
use crate::scheduled_uploader::ScheduledUploader;
use crate::service_registrar::{HttpFinder, PeerFinder, ServiceRegistrar};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

type SharedClientFactory =
    Arc<dyn Fn(&Config) -> Result<Box<dyn TelemetryClient>, MonitorError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    pub port: u16,
    pub config_path: PathBuf,
    /// Switch the working directory to the executable's own directory on start.
    pub chdir_to_executable: bool,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
            chdir_to_executable: true,
        }
    }
}

/// Starts and stops the service and everything it owns.
///
/// `start` returns straight away and the actual start-up happens on a
/// background task. `stop` cancels that task and waits until teardown has
/// finished. `stop` is expected to be called at most once per `start`.
pub struct LifecycleController {
    options: LifecycleOptions,
    ledger: SharedLedger,
    state_tx: watch::Sender<LifecycleState>,
    local_addr: Arc<Mutex<Option<SocketAddr>>>,
    exit: CancellationToken,
    shutdown_complete: Option<oneshot::Receiver<()>>,
    finder: Option<Arc<dyn PeerFinder>>,
    indicator: Option<Arc<dyn PulseIndicator>>,
    client_factory: Option<SharedClientFactory>,
}

impl LifecycleController {
    pub fn new(options: LifecycleOptions) -> Self {
        let (state_tx, _) = watch::channel(LifecycleState::Stopped);
        Self {
            options,
            ledger: SharedLedger::default(),
            state_tx,
            local_addr: Arc::new(Mutex::new(None)),
            exit: CancellationToken::new(),
            shutdown_complete: None,
            finder: None,
            indicator: None,
            client_factory: None,
        }
    }

    /// Replaces the HTTP peer finder built from the configuration.
    pub fn with_finder(mut self, finder: Arc<dyn PeerFinder>) -> Self {
        self.finder = Some(finder);
        self
    }

    /// Replaces the indicator command from the configuration.
    pub fn with_indicator(mut self, indicator: Arc<dyn PulseIndicator>) -> Self {
        self.indicator = Some(indicator);
        self
    }

    /// Replaces the MQTT telemetry client.
    pub fn with_client_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&Config) -> Result<Box<dyn TelemetryClient>, MonitorError> + Send + Sync + 'static,
    {
        self.client_factory = Some(Arc::new(factory));
        self
    }

    pub fn ledger(&self) -> SharedLedger {
        self.ledger.clone()
    }

    pub fn state(&self) -> LifecycleState {
        *self.state_tx.borrow()
    }

    /// Address the HTTP listener bound to, once it has.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits until start-up has finished (or the service stopped again).
    pub async fn wait_until_running(&self) -> LifecycleState {
        let mut state_rx = self.state_tx.subscribe();
        let state = match state_rx
            .wait_for(|s| matches!(s, LifecycleState::Running | LifecycleState::Stopped))
            .await
        {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        state
    }

    pub fn start(&mut self) {
        if self.state() != LifecycleState::Stopped {
            warn!(state = ?self.state(), "Service already started");
            return;
        }
        info!("Service starting");
        self.state_tx.send_replace(LifecycleState::Starting);

        if self.options.chdir_to_executable {
            change_to_executable_dir();
        }

        self.exit = CancellationToken::new();
        let (done_tx, done_rx) = oneshot::channel();
        self.shutdown_complete = Some(done_rx);

        let run = RunContext {
            options: self.options.clone(),
            ledger: self.ledger.clone(),
            state_tx: self.state_tx.clone(),
            local_addr: self.local_addr.clone(),
            finder: self.finder.clone(),
            indicator: self.indicator.clone(),
            client_factory: self.client_factory.clone(),
        };
        tokio::spawn(run.run(self.exit.clone(), done_tx));
    }

    pub async fn stop(&mut self) {
        let Some(shutdown_complete) = self.shutdown_complete.take() else {
            return;
        };
        info!("Service stopping");
        self.exit.cancel();
        if shutdown_complete.await.is_err() {
            error!("Service task ended without completing shutdown");
            self.state_tx.send_replace(LifecycleState::Stopped);
        }
    }
}

struct RunContext {
    options: LifecycleOptions,
    ledger: SharedLedger,
    state_tx: watch::Sender<LifecycleState>,
    local_addr: Arc<Mutex<Option<SocketAddr>>>,
    finder: Option<Arc<dyn PeerFinder>>,
    indicator: Option<Arc<dyn PulseIndicator>>,
    client_factory: Option<SharedClientFactory>,
}

impl RunContext {
    async fn run(self, exit: CancellationToken, shutdown_complete: oneshot::Sender<()>) {
        info!(path = %self.options.config_path.display(), "Loading configuration");
        let (config, err) = Config::read_from_file(&self.options.config_path);
        if let Some(e) = err {
            warn!(error = %e, "Configuration could not be read, using defaults");
        }
        let config = Arc::new(config);
        self.ledger.set_flash_rate(config.flash_rate);
        if let Err(e) = self.ledger.load(&config.data_file) {
            warn!(error = %e, "No usable energy baseline, starting from zero");
        }
        info!(flash_rate = config.flash_rate, "Configuration loaded");

        let http_shutdown = CancellationToken::new();
        let workers = CancellationToken::new();

        let mut port = self.options.port;
        let mut http = None;
        match TcpListener::bind(("0.0.0.0", self.options.port)).await {
            Ok(listener) => {
                if let Ok(addr) = listener.local_addr() {
                    port = addr.port();
                    *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(addr);
                }
                let state = AppState {
                    ledger: self.ledger.clone(),
                    config: config.clone(),
                };
                let shutdown = http_shutdown.clone();
                http = Some(tokio::spawn(async move {
                    if let Err(e) = http_api::serve(listener, state, shutdown).await {
                        error!(error = %e, "HTTP server failed");
                    }
                }));
            }
            Err(e) => error!(port = self.options.port, error = %e, "Error starting web server"),
        }

        let finder = self
            .finder
            .unwrap_or_else(|| {
                Arc::new(HttpFinder::new(config.peers.clone())) as Arc<dyn PeerFinder>
            });
        let registrar = Arc::new(ServiceRegistrar::new(finder, config.service_name.clone(), port));
        // Registration has no cancellation; it finishes or dies with the runtime.
        drop(registrar.spawn());

        let uploader = match self.client_factory {
            Some(factory) => ScheduledUploader::new(
                self.ledger.clone(),
                config.clone(),
                Box::new(move |config: &Config| factory(config)),
            ),
            None => ScheduledUploader::with_mqtt(self.ledger.clone(), config.clone()),
        };
        let uploader = Arc::new(uploader.with_checkpoint(&config.data_file));
        let schedule = uploader.clone().start_schedule(workers.clone());

        let indicator = self
            .indicator
            .unwrap_or_else(|| {
                let command = config.indicator_command.clone();
                Arc::new(CommandIndicator::new(command)) as Arc<dyn PulseIndicator>
            });
        let ingestor = Arc::new(PulseIngestor::new(
            self.ledger.clone(),
            indicator,
            config.indicator_concurrency,
        ));
        let ingest = ingestor.spawn(config.sensor_command.clone(), workers.clone());

        self.state_tx.send_replace(LifecycleState::Running);
        info!(port, "Service running");

        exit.cancelled().await;
        self.state_tx.send_replace(LifecycleState::Stopping);

        // Stop serving before anything the handlers read from is torn down.
        http_shutdown.cancel();
        if let Some(mut http) = http {
            let drain = Duration::from_secs(config.http_shutdown_timeout_secs);
            if tokio::time::timeout(drain, &mut http).await.is_err() {
                warn!(timeout_secs = drain.as_secs(), "HTTP drain timed out");
                http.abort();
            }
        }

        workers.cancel();
        if let Err(e) = schedule.await {
            error!(error = %e, "Upload schedule task failed");
        }
        if let Err(e) = ingest.await {
            error!(error = %e, "Pulse ingestion task failed");
        }
        uploader.close().await;

        if let Err(e) = self.ledger.save(&config.data_file) {
            error!(error = %e, "Could not save the energy baseline");
        }

        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.state_tx.send_replace(LifecycleState::Stopped);
        info!("Shutdown complete");
        let _ = shutdown_complete.send(());
    }
}

fn change_to_executable_dir() {
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => {
            error!(error = %e, "Error getting current executable path");
            return;
        }
    };
    let Some(dir) = exe.parent() else {
        return;
    };
    info!(path = %dir.display(), "Current application path");
    match std::env::current_dir() {
        Ok(cwd) if cwd == dir => {}
        Ok(_) => {
            if let Err(e) = std::env::set_current_dir(dir) {
                error!(error = %e, "Error changing working directory");
            }
        }
        Err(e) => error!(error = %e, "Error getting current working directory"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service_registrar::{DeviceInfo, PeerDevice, ServiceInfo};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct NoPeers;

    #[async_trait]
    impl PeerFinder for NoPeers {
        async fn device_info(&self) -> anyhow::Result<DeviceInfo> {
            Ok(DeviceInfo::default())
        }

        async fn find_peers(&self) -> anyhow::Result<Vec<PeerDevice>> {
            Ok(Vec::new())
        }

        async fn register(&self, _: &[PeerDevice], _: &[ServiceInfo]) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct NoFlash;

    #[async_trait]
    impl PulseIndicator for NoFlash {
        async fn flash(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder {
        published: AtomicU32,
        closed: AtomicU32,
        http_down_at_close: AtomicBool,
        addr: Mutex<Option<SocketAddr>>,
    }

    struct RecordingClient {
        recorder: Arc<Recorder>,
        connected: bool,
    }

    #[async_trait]
    impl TelemetryClient for RecordingClient {
        fn is_connected(&self) -> bool {
            self.connected
        }

        async fn connect(&mut self) -> anyhow::Result<()> {
            self.connected = true;
            Ok(())
        }

        async fn publish(&mut self, _: &str, _: String, _: bool) -> anyhow::Result<()> {
            self.recorder.published.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&mut self) {
            let addr = *self.recorder.addr.lock().unwrap();
            if let Some(addr) = addr {
                let down = tokio::net::TcpStream::connect(addr).await.is_err();
                self.recorder.http_down_at_close.store(down, Ordering::SeqCst);
            }
            self.recorder.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn write_config(dir: &std::path::Path, config: Config) -> PathBuf {
        let path = dir.join("config.json");
        config.write_to_file(&path).unwrap();
        path
    }

    fn controller(config_path: PathBuf) -> LifecycleController {
        LifecycleController::new(LifecycleOptions {
            port: 0,
            config_path,
            chdir_to_executable: false,
        })
        .with_finder(Arc::new(NoPeers))
        .with_indicator(Arc::new(NoFlash))
    }

    fn quiet_config(dir: &std::path::Path) -> Config {
        Config {
            data_file: dir.join("power.dat").display().to_string(),
            sensor_command: vec!["/definitely/not/a/sensor".to_string()],
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_stop_without_activity_completes() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), quiet_config(dir.path()));
        let mut service = controller(path);

        service.start();
        service.stop().await;
        assert_eq!(service.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_start_returns_before_running() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), quiet_config(dir.path()));
        let mut service = controller(path);

        service.start();
        assert_eq!(service.state(), LifecycleState::Starting);
        assert_eq!(service.wait_until_running().await, LifecycleState::Running);
        assert!(service.local_addr().is_some());

        service.stop().await;
        assert_eq!(service.state(), LifecycleState::Stopped);
        assert!(service.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_stop_before_start_is_a_no_op() {
        let mut service = controller(PathBuf::from("missing.json"));
        service.stop().await;
        assert_eq!(service.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_baseline_is_loaded_and_saved() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            sensor_command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "printf 'p\\np\\np\\np\\n'".to_string(),
            ],
            flash_rate: 4,
            ..quiet_config(dir.path())
        };
        std::fs::write(dir.path().join("power.dat"), 10.0f64.to_le_bytes()).unwrap();
        let path = write_config(dir.path(), config);
        let mut service = controller(path);

        service.start();
        service.wait_until_running().await;
        let ledger = service.ledger();
        while ledger.snapshot().pulse_count < 4 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(ledger.current_energy(), 9.0);

        service.stop().await;
        let saved = std::fs::read(dir.path().join("power.dat")).unwrap();
        assert_eq!(saved, 9.0f64.to_le_bytes().to_vec());
    }

    #[tokio::test]
    async fn test_uploads_at_start_and_closes_telemetry_after_http() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            enable_mqtt: true,
            ..quiet_config(dir.path())
        };
        let path = write_config(dir.path(), config);

        let recorder = Arc::new(Recorder::default());
        let factory_recorder = recorder.clone();
        let mut service = controller(path).with_client_factory(move |_config: &Config| {
            Ok(Box::new(RecordingClient {
                recorder: factory_recorder.clone(),
                connected: false,
            }) as Box<dyn TelemetryClient>)
        });

        service.start();
        service.wait_until_running().await;
        *recorder.addr.lock().unwrap() = service
            .local_addr()
            .map(|addr| SocketAddr::from(([127, 0, 0, 1], addr.port())));
        while recorder.published.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        service.stop().await;
        assert_eq!(recorder.closed.load(Ordering::SeqCst), 1);
        assert!(recorder.http_down_at_close.load(Ordering::SeqCst));
    }
}
