use crate::config::DEFAULT_FLASH_RATE;
use crate::error::{MonitorError, Result};
use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Width of the persisted baseline: one little-endian f64, no header.
const BASELINE_LEN: usize = 8;

/// Energy accounting for the metered supply.
///
/// The remaining energy is never stored directly; it is derived from the
/// baseline loaded at start-up minus the pulses seen since then.
#[derive(Debug, Clone)]
pub struct EnergyLedger {
    flash_rate: i64,
    start_time: DateTime<Utc>,
    start_energy: f64,
    pulse_count: u64,
    last_pulse: Option<DateTime<Utc>>,
}

/// Point-in-time copy of the ledger handed to readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSnapshot {
    pub start_time: DateTime<Utc>,
    #[serde(rename = "startPower")]
    pub start_energy: f64,
    #[serde(rename = "currentPower")]
    pub current_energy: f64,
    pub pulse_count: u64,
    pub last_pulse: Option<DateTime<Utc>>,
}

impl Default for EnergyLedger {
    fn default() -> Self {
        Self::new(DEFAULT_FLASH_RATE)
    }
}

impl EnergyLedger {
    pub fn new(flash_rate: i64) -> Self {
        Self {
            flash_rate: clamp_flash_rate(flash_rate),
            start_time: Utc::now(),
            start_energy: 0.0,
            pulse_count: 0,
            last_pulse: None,
        }
    }

    pub fn flash_rate(&self) -> i64 {
        self.flash_rate
    }

    /// Non-positive rates fall back to the default.
    pub fn set_flash_rate(&mut self, flash_rate: i64) {
        self.flash_rate = clamp_flash_rate(flash_rate);
    }

    pub fn start_energy(&self) -> f64 {
        self.start_energy
    }

    pub fn pulse_count(&self) -> u64 {
        self.pulse_count
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn last_pulse(&self) -> Option<DateTime<Utc>> {
        self.last_pulse
    }

    /// Energy left: baseline minus consumption since the baseline was taken.
    /// Not clamped at zero, a negative value means the meter drifted.
    pub fn current_energy(&self) -> f64 {
        let consumed = self.pulse_count as f64 / self.flash_rate as f64;
        self.start_energy - consumed
    }

    pub fn snapshot(&self) -> ReportSnapshot {
        ReportSnapshot {
            start_time: self.start_time,
            start_energy: self.start_energy,
            current_energy: self.current_energy(),
            pulse_count: self.pulse_count,
            last_pulse: self.last_pulse,
        }
    }

    pub fn record_pulse(&mut self) {
        self.pulse_count += 1;
        self.last_pulse = Some(Utc::now());
    }

    /// Re-initialises the ledger from the baseline file.
    ///
    /// The start time and pulse count are reset whether or not the read
    /// succeeds. On failure the previous baseline is kept and the error is
    /// returned so the caller can log it.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let read = read_baseline(path.as_ref());
        self.apply_loaded(read)
    }

    fn apply_loaded(&mut self, read: Result<f64>) -> Result<()> {
        self.start_time = Utc::now();
        self.pulse_count = 0;
        let energy = read?;
        self.start_energy = energy;
        Ok(())
    }

    /// Writes the current energy as the next baseline.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        write_baseline(path.as_ref(), self.current_energy())
    }

    /// Takes `energy` as the new baseline, e.g. after the supply is topped up.
    pub fn rebase(&mut self, energy: f64) {
        self.start_energy = energy;
        self.start_time = Utc::now();
        self.pulse_count = 0;
    }
}

fn clamp_flash_rate(flash_rate: i64) -> i64 {
    if flash_rate <= 0 {
        DEFAULT_FLASH_RATE
    } else {
        flash_rate
    }
}

/// Decodes the first eight bytes of `path` as a little-endian f64.
pub fn read_baseline(path: &Path) -> Result<f64> {
    let bytes = std::fs::read(path).map_err(|e| MonitorError::persistence(path, e))?;
    let raw: [u8; BASELINE_LEN] = bytes
        .get(..BASELINE_LEN)
        .and_then(|head| head.try_into().ok())
        .ok_or_else(|| {
            MonitorError::persistence(
                path,
                std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    format!("expected {BASELINE_LEN} bytes, found {}", bytes.len()),
                ),
            )
        })?;
    Ok(f64::from_le_bytes(raw))
}

/// Overwrites `path` with `energy`, going through a sibling temp file so a
/// crash mid-write never leaves a truncated baseline.
pub fn write_baseline(path: &Path, energy: f64) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    std::fs::write(&tmp, energy.to_le_bytes()).map_err(|e| MonitorError::persistence(path, e))?;
    std::fs::rename(&tmp, path).map_err(|e| MonitorError::persistence(path, e))
}

/// Cloneable handle to the one ledger owned by the service.
///
/// The pulse ingestor is the only regular writer; everyone else takes
/// snapshots. The mutex keeps a snapshot from ever seeing a half-applied pulse.
#[derive(Debug, Clone, Default)]
pub struct SharedLedger {
    inner: Arc<Mutex<EnergyLedger>>,
}

impl SharedLedger {
    pub fn new(ledger: EnergyLedger) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ledger)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EnergyLedger> {
        // The ledger has no invariants a panicking holder could break halfway.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_flash_rate(&self, flash_rate: i64) {
        self.lock().set_flash_rate(flash_rate);
    }

    pub fn current_energy(&self) -> f64 {
        self.lock().current_energy()
    }

    pub fn snapshot(&self) -> ReportSnapshot {
        self.lock().snapshot()
    }

    pub fn record_pulse(&self) {
        self.lock().record_pulse();
    }

    pub fn rebase(&self, energy: f64) -> ReportSnapshot {
        let mut ledger = self.lock();
        ledger.rebase(energy);
        ledger.snapshot()
    }

    /// Same contract as [`EnergyLedger::load`]; the file is read before the
    /// lock is taken.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<()> {
        let read = read_baseline(path.as_ref());
        self.lock().apply_loaded(read)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let energy = self.current_energy();
        write_baseline(path.as_ref(), energy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_energy_subtracts_pulses() {
        let mut ledger = EnergyLedger::new(1000);
        ledger.rebase(10.0);
        for _ in 0..500 {
            ledger.record_pulse();
        }
        assert_eq!(ledger.current_energy(), 9.5);
    }

    #[test]
    fn test_current_energy_may_go_negative() {
        let mut ledger = EnergyLedger::new(2);
        ledger.rebase(1.0);
        for _ in 0..5 {
            ledger.record_pulse();
        }
        assert_eq!(ledger.current_energy(), -1.5);
    }

    #[test]
    fn test_non_positive_flash_rate_uses_default() {
        assert_eq!(EnergyLedger::new(0).flash_rate(), DEFAULT_FLASH_RATE);
        assert_eq!(EnergyLedger::new(-20).flash_rate(), DEFAULT_FLASH_RATE);

        let mut ledger = EnergyLedger::new(800);
        assert_eq!(ledger.flash_rate(), 800);
        ledger.set_flash_rate(0);
        assert_eq!(ledger.flash_rate(), DEFAULT_FLASH_RATE);
    }

    #[test]
    fn test_record_pulse_sets_last_pulse() {
        let mut ledger = EnergyLedger::default();
        assert!(ledger.last_pulse().is_none());
        ledger.record_pulse();
        assert_eq!(ledger.pulse_count(), 1);
        assert!(ledger.last_pulse().is_some());
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let mut ledger = EnergyLedger::new(1000);
        ledger.rebase(3.0);
        ledger.record_pulse();
        let snapshot = ledger.snapshot();

        ledger.record_pulse();
        assert_eq!(snapshot.pulse_count, 1);
        assert!((snapshot.current_energy - 2.999).abs() < 1e-12);
        assert_eq!(snapshot.start_energy, 3.0);
        assert_eq!(ledger.pulse_count(), 2);
    }

    #[test]
    fn test_save_then_load_keeps_current_energy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("power.dat");

        let mut ledger = EnergyLedger::new(1000);
        ledger.rebase(42.25);
        for _ in 0..1250 {
            ledger.record_pulse();
        }
        let saved = ledger.current_energy();
        let started = ledger.start_time();
        ledger.save(&path).unwrap();

        let mut reloaded = EnergyLedger::new(1000);
        reloaded.load(&path).unwrap();
        assert!((reloaded.current_energy() - saved).abs() < 1e-12);
        assert_eq!(reloaded.pulse_count(), 0);
        assert!(reloaded.start_time() >= started);
    }

    #[test]
    fn test_persisted_format_is_raw_little_endian_f64() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("power.dat");

        let mut ledger = EnergyLedger::new(1000);
        ledger.rebase(123.5);
        ledger.save(&path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes, 123.5f64.to_le_bytes().to_vec());
    }

    #[test]
    fn test_load_missing_file_keeps_zero_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = EnergyLedger::new(1000);
        ledger.record_pulse();
        let started = ledger.start_time();
        std::thread::sleep(std::time::Duration::from_millis(5));

        let result = ledger.load(dir.path().join("missing.dat"));
        assert!(matches!(result, Err(MonitorError::Persistence { .. })));
        assert_eq!(ledger.start_energy(), 0.0);
        assert_eq!(ledger.pulse_count(), 0);
        assert!(ledger.start_time() > started);
    }

    #[test]
    fn test_load_short_file_keeps_previous_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("power.dat");
        std::fs::write(&path, [1u8, 2, 3]).unwrap();

        let mut ledger = EnergyLedger::new(1000);
        ledger.rebase(7.0);
        ledger.record_pulse();
        let started = ledger.start_time();
        std::thread::sleep(std::time::Duration::from_millis(5));

        assert!(ledger.load(&path).is_err());
        assert_eq!(ledger.start_energy(), 7.0);
        assert_eq!(ledger.pulse_count(), 0);
        assert!(ledger.start_time() > started);
    }

    #[test]
    fn test_load_ignores_trailing_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("power.dat");
        let mut bytes = 5.5f64.to_le_bytes().to_vec();
        bytes.extend_from_slice(b"junk");
        std::fs::write(&path, bytes).unwrap();

        let mut ledger = EnergyLedger::default();
        ledger.load(&path).unwrap();
        assert_eq!(ledger.start_energy(), 5.5);
    }

    #[test]
    fn test_save_to_unwritable_path_errors() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = EnergyLedger::default();
        let result = ledger.save(dir.path().join("no_such_dir").join("power.dat"));
        assert!(matches!(result, Err(MonitorError::Persistence { .. })));
    }

    #[test]
    fn test_shared_ledger_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("power.dat");

        let shared = SharedLedger::new(EnergyLedger::new(100));
        shared.rebase(2.0);
        shared.record_pulse();
        shared.save(&path).unwrap();

        let other = SharedLedger::default();
        other.set_flash_rate(100);
        other.load(&path).unwrap();
        assert!((other.current_energy() - 1.99).abs() < 1e-12);
        assert_eq!(other.snapshot().pulse_count, 0);
    }

    #[test]
    fn test_snapshot_json_keys() {
        let snapshot = EnergyLedger::default().snapshot();
        let value = serde_json::to_value(&snapshot).unwrap();
        let object = value.as_object().unwrap();
        for key in [
            "startTime",
            "startPower",
            "currentPower",
            "pulseCount",
            "lastPulse",
        ] {
            assert!(object.contains_key(key), "missing {key}");
        }
    }
}
