//! Persistence for the device configuration.
//!
//! The controller writes through a [`ConfigStore`] every time persisted state
//! changes (boot flag, staged credentials, active station, results).
//!
//! # Components
//!
//! - [`MemoryStore`] - In-memory store for tests and volatile setups
//! - [`FileStore`] - JSON file store for host builds
//! - `NvsStore` - ESP32 Non-Volatile Storage (ESP32 only)

mod file;
#[cfg(feature = "esp32")]
mod nvs;

pub use file::{default_config_path, FileStore, CONFIG_PATH_ENV};
#[cfg(feature = "esp32")]
pub use nvs::NvsStore;

use crate::config::{ConfigError, DeviceConfig};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Storage backend for [`DeviceConfig`].
pub trait ConfigStore: Send + Sync {
    /// Load the stored configuration.
    ///
    /// Returns `Ok(None)` if nothing has been stored yet.
    fn load(&self) -> Result<Option<DeviceConfig>, StoreError>;

    /// Persist the configuration, replacing what was stored.
    fn save(&self, config: &DeviceConfig) -> Result<(), StoreError>;
}

/// Volatile store, mainly for tests.
///
/// Saves can be made to fail to exercise persistence error paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    config: Mutex<Option<DeviceConfig>>,
    fail_saves: AtomicBool,
    saves: AtomicUsize,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already holds `config`.
    pub fn with_config(config: DeviceConfig) -> Self {
        Self {
            config: Mutex::new(Some(config)),
            ..Default::default()
        }
    }

    /// Make subsequent saves fail (or succeed again).
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Snapshot of the stored configuration.
    pub fn snapshot(&self) -> Option<DeviceConfig> {
        self.config.lock().ok().and_then(|c| c.clone())
    }
}

impl ConfigStore for MemoryStore {
    fn load(&self) -> Result<Option<DeviceConfig>, StoreError> {
        let guard = self.config.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(guard.clone())
    }

    fn save(&self, config: &DeviceConfig) -> Result<(), StoreError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store saves disabled".into()));
        }
        let mut guard = self.config.lock().map_err(|_| StoreError::Poisoned)?;
        *guard = Some(config.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Errors from a [`ConfigStore`].
#[derive(Debug)]
pub enum StoreError {
    /// Filesystem error.
    Io(std::io::Error),
    /// Stored data could not be parsed.
    Format(ConfigError),
    /// Read-back after a save did not match what was written.
    VerifyFailed,
    /// The backend is not usable (e.g. NVS partition missing).
    Unavailable(String),
    /// A lock was poisoned by a panicking writer.
    Poisoned,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Format(e) => write!(f, "stored config unreadable: {}", e),
            Self::VerifyFailed => write!(f, "verification failed after save"),
            Self::Unavailable(msg) => write!(f, "storage unavailable: {}", msg),
            Self::Poisoned => write!(f, "storage lock poisoned"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Format(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ConfigError> for StoreError {
    fn from(e: ConfigError) -> Self {
        Self::Format(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_starts_empty() {
        let store = MemoryStore::new();
        assert!(store.load().unwrap().is_none());
        assert_eq!(store.save_count(), 0);
    }

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        let mut config = DeviceConfig::default();
        config.provision.boot.enable = true;

        store.save(&config).unwrap();
        assert_eq!(store.load().unwrap(), Some(config));
        assert_eq!(store.save_count(), 1);
    }

    #[test]
    fn test_memory_store_failing_saves() {
        let store = MemoryStore::with_config(DeviceConfig::default());
        store.set_fail_saves(true);

        let mut changed = DeviceConfig::default();
        changed.provision.attempts = 9;
        assert!(matches!(
            store.save(&changed),
            Err(StoreError::Unavailable(_))
        ));
        assert_eq!(store.snapshot(), Some(DeviceConfig::default()));

        store.set_fail_saves(false);
        assert!(store.save(&changed).is_ok());
    }
}
