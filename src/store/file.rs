//! Configuration persistence for host (development) builds.
//!
//! Stores the device configuration as JSON so it persists across runs.
//! Uses `~/.provision-wifi/config.json` unless `PROVISION_WIFI_CONFIG` is set.

use super::{ConfigStore, StoreError};
use crate::config::DeviceConfig;
use log::{debug, info};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Environment variable overriding the config file location.
pub const CONFIG_PATH_ENV: &str = "PROVISION_WIFI_CONFIG";

/// Get the default config file path.
///
/// Returns `$PROVISION_WIFI_CONFIG` if set, else `~/.provision-wifi/config.json`.
pub fn default_config_path() -> io::Result<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        return Ok(PathBuf::from(path));
    }
    let home = std::env::var("HOME")
        .map_err(|_| io::Error::new(io::ErrorKind::NotFound, "HOME not set"))?;
    Ok(PathBuf::from(home)
        .join(".provision-wifi")
        .join("config.json"))
}

/// JSON file backed store.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    /// Serializes writers so read-back verification sees our own write.
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Create a store at a specific path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Create a store at the default path.
    pub fn open_default() -> io::Result<Self> {
        Ok(Self::new(default_config_path()?))
    }

    /// Location of the config file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for FileStore {
    fn load(&self) -> Result<Option<DeviceConfig>, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No config file found at {:?}", self.path);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Some(DeviceConfig::from_json(&bytes)?))
    }

    fn save(&self, config: &DeviceConfig) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let bytes = config.to_json()?;
        fs::write(&self.path, &bytes)?;

        // Verify write by reading back
        let read_back = fs::read(&self.path)?;
        if read_back != bytes {
            return Err(StoreError::VerifyFailed);
        }

        info!("Config saved to {:?}", self.path);
        Ok(())
    }
}
