use crate::config::Config;
use crate::energy_ledger::SharedLedger;
use crate::error::MonitorError;
use crate::mqtt_publisher::{MqttPublisher, TelemetryClient};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Channel the remaining energy is published on.
pub const CURRENT_POWER_TOPIC: &str = "home/power/current";

/// Builds a telemetry client from the configuration. Only configuration
/// problems are reported here; connecting happens later.
pub type ClientFactory =
    Box<dyn Fn(&Config) -> Result<Box<dyn TelemetryClient>, MonitorError> + Send + Sync>;

/// What a single run ended up doing.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadOutcome {
    /// The formatted value that went out.
    Published(String),
    /// Telemetry is switched off or was disabled by a configuration error.
    Disabled,
    /// Another run was still in flight.
    Busy,
}

#[derive(Default)]
struct UploaderState {
    client: Option<Box<dyn TelemetryClient>>,
    disabled: bool,
    last_update_attempt: Option<DateTime<Utc>>,
    last_update: Option<DateTime<Utc>>,
}

/// Publishes the ledger's current energy on a fixed cadence and on demand.
pub struct ScheduledUploader {
    ledger: SharedLedger,
    config: Arc<Config>,
    factory: ClientFactory,
    checkpoint: Option<PathBuf>,
    state: Mutex<UploaderState>,
}

impl ScheduledUploader {
    pub fn new(ledger: SharedLedger, config: Arc<Config>, factory: ClientFactory) -> Self {
        Self {
            ledger,
            config,
            factory,
            checkpoint: None,
            state: Mutex::new(UploaderState::default()),
        }
    }

    /// Uploader backed by [`MqttPublisher`].
    pub fn with_mqtt(ledger: SharedLedger, config: Arc<Config>) -> Self {
        Self::new(
            ledger,
            config,
            Box::new(|config: &Config| {
                MqttPublisher::from_config(config)
                    .map(|client| Box::new(client) as Box<dyn TelemetryClient>)
            }),
        )
    }

    /// Also persist the ledger baseline to `path` after every run.
    pub fn with_checkpoint(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint = Some(path.into());
        self
    }

    pub fn period(&self) -> Duration {
        let minutes = if self.config.period > 0 {
            self.config.period
        } else {
            crate::config::DEFAULT_PERIOD_MINUTES
        };
        Duration::from_secs((minutes as u64).saturating_mul(60))
    }

    pub async fn last_update(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.last_update
    }

    pub async fn last_update_attempt(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.last_update_attempt
    }

    /// Runs once now and then once per period until `cancel` fires.
    ///
    /// Runs execute inline, so a tick that comes due while a run is still
    /// going is dropped rather than queued.
    pub fn start_schedule(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let period = self.period();
        info!(period_secs = period.as_secs(), "Starting upload schedule");
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    // The first tick completes immediately.
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_now().await {
                            error!(error = %e, "Error sending telemetry");
                        }
                    }
                }
            }
            debug!("Upload schedule stopped");
        })
    }

    /// One upload run, same as a scheduled tick.
    pub async fn run_now(&self) -> Result<UploadOutcome, MonitorError> {
        let Ok(mut state) = self.state.try_lock() else {
            debug!("Upload already in progress, skipping this run");
            return Ok(UploadOutcome::Busy);
        };
        let outcome = self.publish(&mut state).await;
        drop(state);

        if let Some(path) = &self.checkpoint {
            if let Err(e) = self.ledger.save(path) {
                warn!(error = %e, "Could not save the energy baseline");
            }
        }
        outcome
    }

    async fn publish(&self, state: &mut UploaderState) -> Result<UploadOutcome, MonitorError> {
        if !self.config.enable_mqtt || state.disabled {
            return Ok(UploadOutcome::Disabled);
        }

        if state.client.is_none() {
            match (self.factory)(&self.config) {
                Ok(client) => state.client = Some(client),
                Err(e) => {
                    // No retry until the process restarts with a fixed config.
                    error!(error = %e, "Telemetry disabled");
                    state.disabled = true;
                    return Err(e);
                }
            }
        }

        state.last_update_attempt = Some(Utc::now());
        let Some(client) = state.client.as_mut() else {
            return Ok(UploadOutcome::Disabled);
        };

        if !client.is_connected() {
            info!("Reconnecting to the telemetry broker");
            client
                .connect()
                .await
                .map_err(|e| MonitorError::Connection(e.to_string()))?;
        }

        let payload = format!("{:.3}", self.ledger.current_energy());
        info!(%payload, "Publishing power");
        client
            .publish(CURRENT_POWER_TOPIC, payload.clone(), true)
            .await
            .map_err(|e| MonitorError::Connection(e.to_string()))?;

        state.last_update = Some(Utc::now());
        Ok(UploadOutcome::Published(payload))
    }

    /// Closes the telemetry client if one was ever created. Waits for an
    /// in-flight run to finish first.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if let Some(mut client) = state.client.take() {
            client.close().await;
            info!("Telemetry client closed");
        }
    }
}
