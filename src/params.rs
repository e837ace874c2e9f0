//! # Connection Parameters Module
//!
//! The validated configuration record for a connection. Every setter checks
//! its stated bounds and rejects invalid values synchronously with a
//! [`TransportError::Config`], so a `Parameters` instance that exists is
//! always internally consistent.
//!
//! The record is cheap to clone; a connection takes a snapshot at creation
//! and the snapshot stays fixed for the connection's lifetime (the send rate
//! is the one field that can still change afterwards, through TEMPO signals).

use crate::defaults;
use crate::error::TransportError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How listener events are delivered to the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryMode {
    /// All connections share one process-global delivery worker
    Global,
    /// Each connection runs its own delivery worker
    Individual,
}

/// Validated configuration record for a connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameters {
    parcel_size: usize,
    object_queue_capacity: usize,
    parcel_queue_capacity: usize,
    max_serialization_size: u64,
    alive_period: Duration,
    confirm_timeout: Duration,
    idle_check_period: Duration,
    idle_threshold: u64,
    deliver_tolerance: Duration,
    shutdown_timeout: Duration,
    tempo: i64,
    serialization_method: u8,
    file_root: Option<PathBuf>,
    max_file_size: Option<u64>,
    delivery_mode: DeliveryMode,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            parcel_size: defaults::PARCEL_SIZE,
            object_queue_capacity: defaults::OBJECT_QUEUE_CAPACITY,
            parcel_queue_capacity: defaults::PARCEL_QUEUE_CAPACITY,
            max_serialization_size: defaults::MAX_SERIALIZATION_SIZE,
            alive_period: Duration::ZERO,
            confirm_timeout: defaults::CONFIRM_TIMEOUT,
            idle_check_period: defaults::IDLE_CHECK_PERIOD,
            idle_threshold: 0,
            deliver_tolerance: defaults::DELIVER_TOLERANCE,
            shutdown_timeout: defaults::SHUTDOWN_TIMEOUT,
            tempo: -1,
            serialization_method: 0,
            file_root: None,
            max_file_size: None,
            delivery_mode: DeliveryMode::Global,
        }
    }
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maximum payload bytes per parcel (1 KiB to 256 KiB)
    pub fn parcel_size(&self) -> usize {
        self.parcel_size
    }

    pub fn set_parcel_size(&mut self, size: usize) -> Result<(), TransportError> {
        if !(1024..=256 * 1024).contains(&size) {
            return Err(TransportError::Config(format!(
                "parcel size {} outside 1 KiB..=256 KiB",
                size
            )));
        }
        self.parcel_size = size;
        Ok(())
    }

    /// Capacity of the pending send-order queue (at most 10 000)
    pub fn object_queue_capacity(&self) -> usize {
        self.object_queue_capacity
    }

    pub fn set_object_queue_capacity(&mut self, capacity: usize) -> Result<(), TransportError> {
        if capacity == 0 || capacity > 10_000 {
            return Err(TransportError::Config(format!(
                "object queue capacity {} outside 1..=10000",
                capacity
            )));
        }
        self.object_queue_capacity = capacity;
        Ok(())
    }

    /// Capacity of the ordered outgoing parcel queue
    pub fn parcel_queue_capacity(&self) -> usize {
        self.parcel_queue_capacity
    }

    pub fn set_parcel_queue_capacity(&mut self, capacity: usize) -> Result<(), TransportError> {
        if capacity == 0 || capacity > 100_000 {
            return Err(TransportError::Config(format!(
                "parcel queue capacity {} outside 1..=100000",
                capacity
            )));
        }
        self.parcel_queue_capacity = capacity;
        Ok(())
    }

    /// Ceiling on the serialized size of a single object (at least 10 KiB)
    pub fn max_serialization_size(&self) -> u64 {
        self.max_serialization_size
    }

    pub fn set_max_serialization_size(&mut self, size: u64) -> Result<(), TransportError> {
        if size < 10 * 1024 {
            return Err(TransportError::Config(format!(
                "max serialization size {} below 10 KiB",
                size
            )));
        }
        self.max_serialization_size = size;
        Ok(())
    }

    /// ALIVE beacon period; zero disables the beacon and the watchdog
    pub fn alive_period(&self) -> Duration {
        self.alive_period
    }

    pub fn set_alive_period(&mut self, period: Duration) -> Result<(), TransportError> {
        if !period.is_zero()
            && !(Duration::from_secs(5)..=Duration::from_secs(600)).contains(&period)
        {
            return Err(TransportError::Config(format!(
                "alive period {:?} outside 5s..=10min",
                period
            )));
        }
        self.alive_period = period;
        Ok(())
    }

    /// How long an outgoing file waits for the peer's CONFIRM (at least 1 s)
    pub fn confirm_timeout(&self) -> Duration {
        self.confirm_timeout
    }

    pub fn set_confirm_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
        if timeout < Duration::from_secs(1) {
            return Err(TransportError::Config(format!(
                "confirm timeout {:?} below 1s",
                timeout
            )));
        }
        self.confirm_timeout = timeout;
        Ok(())
    }

    /// Sampling period of the idle monitor (at least 5 s)
    pub fn idle_check_period(&self) -> Duration {
        self.idle_check_period
    }

    pub fn set_idle_check_period(&mut self, period: Duration) -> Result<(), TransportError> {
        if period < Duration::from_secs(5) {
            return Err(TransportError::Config(format!(
                "idle check period {:?} below 5s",
                period
            )));
        }
        self.idle_check_period = period;
        Ok(())
    }

    /// Bytes-per-minute cutoff for the idle monitor; zero disables it
    pub fn idle_threshold(&self) -> u64 {
        self.idle_threshold
    }

    pub fn set_idle_threshold(&mut self, bytes_per_minute: u64) {
        self.idle_threshold = bytes_per_minute;
    }

    /// Horizon of the blocking-output detector (at least 1 s)
    pub fn deliver_tolerance(&self) -> Duration {
        self.deliver_tolerance
    }

    pub fn set_deliver_tolerance(&mut self, tolerance: Duration) -> Result<(), TransportError> {
        if tolerance < Duration::from_secs(1) {
            return Err(TransportError::Config(format!(
                "deliver tolerance {:?} below 1s",
                tolerance
            )));
        }
        self.deliver_tolerance = tolerance;
        Ok(())
    }

    /// Bound on the drain phase of the two-phase shutdown (at least 1 s)
    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    pub fn set_shutdown_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
        if timeout < Duration::from_secs(1) {
            return Err(TransportError::Config(format!(
                "shutdown timeout {:?} below 1s",
                timeout
            )));
        }
        self.shutdown_timeout = timeout;
        Ok(())
    }

    /// Outbound byte rate cap in bytes/second; -1 means uncapped
    pub fn tempo(&self) -> i64 {
        self.tempo
    }

    pub fn set_tempo(&mut self, bytes_per_second: i64) -> Result<(), TransportError> {
        if bytes_per_second != -1 && bytes_per_second <= 0 {
            return Err(TransportError::Config(format!(
                "tempo {} must be -1 (uncapped) or positive",
                bytes_per_second
            )));
        }
        self.tempo = bytes_per_second;
        Ok(())
    }

    /// Codec selector: 0 = bincode, 1 = JSON, 2 = custom
    pub fn serialization_method(&self) -> u8 {
        self.serialization_method
    }

    pub fn set_serialization_method(&mut self, method: u8) -> Result<(), TransportError> {
        if method > 2 {
            return Err(TransportError::Config(format!(
                "serialization method {} outside 0..=2",
                method
            )));
        }
        self.serialization_method = method;
        Ok(())
    }

    /// Base directory for inbound files; `None` refuses file reception
    pub fn file_root(&self) -> Option<&Path> {
        self.file_root.as_deref()
    }

    pub fn set_file_root(&mut self, root: impl Into<PathBuf>) -> Result<(), TransportError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(TransportError::Config(format!(
                "file root {} is not an existing directory",
                root.display()
            )));
        }
        self.file_root = Some(root);
        Ok(())
    }

    pub fn clear_file_root(&mut self) {
        self.file_root = None;
    }

    /// Optional cap on the expected size of a single inbound file
    pub fn max_file_size(&self) -> Option<u64> {
        self.max_file_size
    }

    pub fn set_max_file_size(&mut self, size: Option<u64>) -> Result<(), TransportError> {
        if let Some(size) = size {
            if size == 0 {
                return Err(TransportError::Config(
                    "max file size must be positive".into(),
                ));
            }
        }
        self.max_file_size = size;
        Ok(())
    }

    /// Event delivery worker model
    pub fn delivery_mode(&self) -> DeliveryMode {
        self.delivery_mode
    }

    pub fn set_delivery_mode(&mut self, mode: DeliveryMode) {
        self.delivery_mode = mode;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let p = Parameters::default();
        assert_eq!(p.parcel_size(), 64 * 1024);
        assert_eq!(p.object_queue_capacity(), 200);
        assert_eq!(p.parcel_queue_capacity(), 600);
        assert_eq!(p.max_serialization_size(), 100 * 1024 * 1024);
        assert_eq!(p.alive_period(), Duration::ZERO);
        assert_eq!(p.confirm_timeout(), Duration::from_secs(30));
        assert_eq!(p.idle_check_period(), Duration::from_secs(60));
        assert_eq!(p.deliver_tolerance(), Duration::from_secs(10));
        assert_eq!(p.tempo(), -1);
        assert_eq!(p.serialization_method(), 0);
        assert!(p.file_root().is_none());
        assert!(p.max_file_size().is_none());
        assert_eq!(p.delivery_mode(), DeliveryMode::Global);
    }

    #[test]
    fn setters_enforce_bounds() {
        let mut p = Parameters::new();
        assert!(p.set_parcel_size(512).is_err());
        assert!(p.set_parcel_size(512 * 1024).is_err());
        assert!(p.set_parcel_size(8 * 1024).is_ok());

        assert!(p.set_object_queue_capacity(0).is_err());
        assert!(p.set_object_queue_capacity(20_000).is_err());
        assert!(p.set_object_queue_capacity(500).is_ok());

        assert!(p.set_max_serialization_size(1024).is_err());
        assert!(p.set_max_serialization_size(10 * 1024).is_ok());

        assert!(p.set_alive_period(Duration::from_secs(1)).is_err());
        assert!(p.set_alive_period(Duration::from_secs(3600)).is_err());
        assert!(p.set_alive_period(Duration::ZERO).is_ok());
        assert!(p.set_alive_period(Duration::from_secs(5)).is_ok());

        assert!(p.set_tempo(0).is_err());
        assert!(p.set_tempo(-2).is_err());
        assert!(p.set_tempo(-1).is_ok());
        assert!(p.set_tempo(100_000).is_ok());

        assert!(p.set_serialization_method(3).is_err());
        assert!(p.set_serialization_method(1).is_ok());

        assert!(p.set_max_file_size(Some(0)).is_err());
        assert!(p.set_max_file_size(Some(1024)).is_ok());
        assert!(p.set_max_file_size(None).is_ok());
    }

    #[test]
    fn file_root_must_exist() {
        let mut p = Parameters::new();
        assert!(p
            .set_file_root("/definitely/not/an/existing/dir")
            .is_err());
        let dir = tempfile::tempdir().unwrap();
        assert!(p.set_file_root(dir.path()).is_ok());
        assert_eq!(p.file_root(), Some(dir.path()));
    }
}
