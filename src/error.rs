use std::path::PathBuf;
use thiserror::Error;

/// Failures surfaced by the monitor. None of them end the process; callers log
/// and carry on according to the kind.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Telemetry settings are incomplete. The feature stays off for the rest of the process.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Broker unreachable. Retried on the next scheduled tick.
    #[error("connection error: {0}")]
    Connection(String),

    /// Baseline file missing, corrupt or unwritable.
    #[error("persistence error on {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Sensor or indicator subprocess could not start or exited abnormally.
    #[error("external process error: {0}")]
    ExternalProcess(String),

    #[error("discovery error: {0}")]
    Discovery(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl MonitorError {
    pub(crate) fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Persistence {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = MonitorError> = std::result::Result<T, E>;
