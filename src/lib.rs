//! Prepaid Power Monitor Library
//!
//! Counts the pulses of an electricity meter's LED to track how much energy is
//! left on a prepaid supply, serves the reading over HTTP and publishes it to
//! an MQTT broker on a schedule.

pub mod config;
pub mod energy_ledger;
pub mod error;
pub mod http_api;
pub mod lifecycle;
pub mod mqtt_publisher;
pub mod pulse_ingestor;
pub mod scheduled_uploader;
pub mod service_registrar;

// Re-export commonly used types for easier access
pub use config::Config;
pub use energy_ledger::{EnergyLedger, ReportSnapshot, SharedLedger};
pub use error::MonitorError;
pub use lifecycle::{LifecycleController, LifecycleOptions, LifecycleState};
pub use pulse_ingestor::PulseIngestor;
pub use scheduled_uploader::ScheduledUploader;
pub use service_registrar::ServiceRegistrar;
