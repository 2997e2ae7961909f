use crate::energy_ledger::SharedLedger;
use crate::error::MonitorError;
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Side effect fired once per pulse, e.g. toggling an LED.
#[async_trait]
pub trait PulseIndicator: Send + Sync {
    async fn flash(&self) -> anyhow::Result<()>;
}

/// Runs an external program for every flash and reports a non-zero exit.
pub struct CommandIndicator {
    argv: Vec<String>,
}

impl CommandIndicator {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

#[async_trait]
impl PulseIndicator for CommandIndicator {
    async fn flash(&self) -> anyhow::Result<()> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| MonitorError::ExternalProcess("indicator command is empty".to_string()))?;
        let status = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| MonitorError::ExternalProcess(format!("failed to run `{program}`: {e}")))?;
        if !status.success() {
            anyhow::bail!(MonitorError::ExternalProcess(format!(
                "`{program}` exited with {status}"
            )));
        }
        Ok(())
    }
}

/// Turns the sensor's output lines into ledger pulses.
///
/// Counting happens on the reading task, in stream order. Indicator flashes
/// run detached on a bounded pool; when the pool is full the flash for that
/// pulse is skipped so reading never waits on it.
pub struct PulseIngestor {
    ledger: SharedLedger,
    indicator: Arc<dyn PulseIndicator>,
    flash_permits: Arc<Semaphore>,
}

impl PulseIngestor {
    pub fn new(
        ledger: SharedLedger,
        indicator: Arc<dyn PulseIndicator>,
        max_concurrent_flashes: usize,
    ) -> Self {
        Self {
            ledger,
            indicator,
            flash_permits: Arc::new(Semaphore::new(max_concurrent_flashes.max(1))),
        }
    }

    /// Spawns the sensor command and ingests its stdout on a background task.
    ///
    /// The task ends when the sensor exits or `cancel` fires; it does not
    /// restart the sensor.
    pub fn spawn(self: Arc<Self>, sensor_command: Vec<String>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            match self.run_command(&sensor_command, &cancel).await {
                Ok(count) if cancel.is_cancelled() => {
                    info!(pulses = count, "Pulse ingestion stopped")
                }
                Ok(count) => warn!(pulses = count, "Pulse sensor exited, ingestion halted"),
                Err(e) => error!(error = %e, "Pulse ingestion halted"),
            }
        })
    }

    /// Runs the sensor to completion, returning the number of pulses counted.
    pub async fn run_command(
        &self,
        sensor_command: &[String],
        cancel: &CancellationToken,
    ) -> Result<u64, MonitorError> {
        let (program, args) = sensor_command
            .split_first()
            .ok_or_else(|| MonitorError::ExternalProcess("sensor command is empty".to_string()))?;

        info!(command = ?sensor_command, "Starting pulse sensor");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                MonitorError::ExternalProcess(format!("failed to start `{program}`: {e}"))
            })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            MonitorError::ExternalProcess("sensor stdout was not captured".to_string())
        })?;

        let count = self.ingest(BufReader::new(stdout), cancel).await?;

        if cancel.is_cancelled() {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Could not stop the pulse sensor");
            }
            return Ok(count);
        }

        let status = child.wait().await?;
        if status.success() {
            Ok(count)
        } else {
            Err(MonitorError::ExternalProcess(format!(
                "sensor exited with {status} after {count} pulses"
            )))
        }
    }

    /// Records one pulse per line read from `reader` until it ends or
    /// `cancel` fires.
    pub async fn ingest<R>(&self, reader: R, cancel: &CancellationToken) -> Result<u64, MonitorError>
    where
        R: AsyncBufRead + Unpin,
    {
        // Lines are opaque bytes; the sensor's encoding is not trusted.
        let mut lines = reader.split(b'\n');
        let mut count = 0u64;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                line = lines.next_segment() => match line? {
                    Some(line) => {
                        self.ledger.record_pulse();
                        count += 1;
                        debug!(line = %String::from_utf8_lossy(&line).trim(), "Pulse");
                        self.dispatch_flash();
                    }
                    None => break,
                },
            }
        }
        Ok(count)
    }

    fn dispatch_flash(&self) {
        let Ok(permit) = self.flash_permits.clone().try_acquire_owned() else {
            debug!("Indicator busy, skipping flash");
            return;
        };
        let indicator = self.indicator.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = indicator.flash().await {
                warn!(error = %e, "Pulse indicator failed");
            }
        });
    }
}
