use crate::error::{MonitorError, Result};
use serde_derive::{Deserialize, Serialize};
use std::env;
use std::path::Path;

pub const DEFAULT_FLASH_RATE: i64 = 1000;
pub const DEFAULT_PERIOD_MINUTES: i64 = 5;
pub const DEFAULT_PORT: u16 = 20515;
pub const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Settings read from `config.json`. Missing keys fall back to the defaults
/// applied by [`Config::set_defaults`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Pulses per kWh
    pub flash_rate: i64,
    /// Upload period in minutes
    pub period: i64,
    pub enable_mqtt: bool,
    pub mqtt_host: String,
    pub mqtt_username: String,
    pub mqtt_password: String,
    pub service_name: String,
    /// Base URLs of peer devices used for service registration
    pub peers: Vec<String>,
    pub sensor_command: Vec<String>,
    pub indicator_command: Vec<String>,
    pub indicator_concurrency: usize,
    pub data_file: String,
    pub http_shutdown_timeout_secs: u64,
    /// Command whose output is served by `/log/get`
    pub log_command: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            flash_rate: DEFAULT_FLASH_RATE,
            period: DEFAULT_PERIOD_MINUTES,
            enable_mqtt: false,
            mqtt_host: String::new(),
            mqtt_username: String::new(),
            mqtt_password: String::new(),
            service_name: "Power".to_string(),
            peers: Vec::new(),
            sensor_command: vec![
                "python3".to_string(),
                "-u".to_string(),
                "detectpulse.py".to_string(),
            ],
            indicator_command: vec![
                "python3".to_string(),
                "gpiopin.py".to_string(),
                "-n".to_string(),
                "18".to_string(),
                "-a".to_string(),
                "toggle".to_string(),
            ],
            indicator_concurrency: 4,
            data_file: "power.dat".to_string(),
            http_shutdown_timeout_secs: 5,
            log_command: vec![
                "journalctl".to_string(),
                "--no-pager".to_string(),
                "-u".to_string(),
                "PowerMonitor".to_string(),
                "-S".to_string(),
                "1 hour ago".to_string(),
            ],
        }
    }
}

impl Config {
    /// Reads the configuration from `path`.
    ///
    /// A missing file yields the defaults. A file that cannot be read or parsed
    /// also yields the defaults, and the error is handed back for logging.
    pub fn read_from_file(path: impl AsRef<Path>) -> (Self, Option<MonitorError>) {
        let path = path.as_ref();
        if !path.exists() {
            return (Self::default(), None);
        }
        let parsed = std::fs::read(path)
            .map_err(|e| MonitorError::persistence(path, e))
            .and_then(|bytes| Self::from_slice(&bytes));
        match parsed {
            Ok(config) => (config, None),
            Err(e) => (Self::default(), Some(e)),
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let mut config: Config = if bytes.is_empty() {
            Config::default()
        } else {
            serde_json::from_slice(bytes)?
        };
        config.set_defaults();
        Ok(config)
    }

    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let bytes = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, bytes).map_err(|e| MonitorError::persistence(path, e))
    }

    /// Clamps values that must be positive back to their defaults.
    pub fn set_defaults(&mut self) {
        if self.flash_rate <= 0 {
            self.flash_rate = DEFAULT_FLASH_RATE;
        }
        if self.period <= 0 {
            self.period = DEFAULT_PERIOD_MINUTES;
        }
        if self.indicator_concurrency == 0 {
            self.indicator_concurrency = 1;
        }
        if self.service_name.is_empty() {
            self.service_name = "Power".to_string();
        }
    }

    /// Copy that is safe to hand out over HTTP.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.mqtt_password.is_empty() {
            copy.mqtt_password = "********".to_string();
        }
        copy
    }
}

/// HTTP port from `POWER_MONITOR_PORT`, defaulting when unset or invalid.
pub fn port_from_env() -> u16 {
    parse_port_safe(env::var("POWER_MONITOR_PORT").ok())
}

/// Config file path from `POWER_MONITOR_CONFIG`.
pub fn config_path_from_env() -> String {
    env::var("POWER_MONITOR_CONFIG")
        .ok()
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
}

fn parse_port_safe(val: Option<String>) -> u16 {
    val.and_then(|v| v.trim().parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_clamp_non_positive_values() {
        let config = Config::from_slice(br#"{"flashRate": 0, "period": -3}"#).unwrap();
        assert_eq!(config.flash_rate, DEFAULT_FLASH_RATE);
        assert_eq!(config.period, DEFAULT_PERIOD_MINUTES);
    }

    #[test]
    fn test_partial_document_keeps_other_defaults() {
        let config =
            Config::from_slice(br#"{"flashRate": 800, "enableMqtt": true, "mqttHost": "broker"}"#)
                .unwrap();
        assert_eq!(config.flash_rate, 800);
        assert!(config.enable_mqtt);
        assert_eq!(config.mqtt_host, "broker");
        assert_eq!(config.period, DEFAULT_PERIOD_MINUTES);
        assert_eq!(config.data_file, "power.dat");
    }

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(Config::from_slice(b"").unwrap(), Config::default());
    }

    #[test]
    fn test_missing_file_is_default_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let (config, err) = Config::read_from_file(dir.path().join("nope.json"));
        assert_eq!(config, Config::default());
        assert!(err.is_none());
    }

    #[test]
    fn test_corrupt_file_is_default_with_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        let (config, err) = Config::read_from_file(&path);
        assert_eq!(config, Config::default());
        assert!(matches!(err, Some(MonitorError::Json(_))));
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = Config {
            flash_rate: 1600,
            peers: vec!["http://10.0.0.2:20502".to_string()],
            ..Config::default()
        };
        config.write_to_file(&path).unwrap();

        let (read, err) = Config::read_from_file(&path);
        assert!(err.is_none());
        assert_eq!(read, config);
    }

    #[test]
    fn test_redacted_hides_password() {
        let config = Config {
            mqtt_password: "secret".to_string(),
            ..Config::default()
        };
        assert_eq!(config.redacted().mqtt_password, "********");
        assert_eq!(Config::default().redacted().mqtt_password, "");
    }

    #[test]
    fn test_parse_port_safe() {
        assert_eq!(parse_port_safe(None), DEFAULT_PORT);
        assert_eq!(parse_port_safe(Some("".to_string())), DEFAULT_PORT);
        assert_eq!(parse_port_safe(Some("8080".to_string())), 8080);
        assert_eq!(parse_port_safe(Some(" 8081 ".to_string())), 8081);
        assert_eq!(parse_port_safe(Some("99999".to_string())), DEFAULT_PORT);
        assert_eq!(parse_port_safe(Some("port".to_string())), DEFAULT_PORT);
    }
}
