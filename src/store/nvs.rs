//! NVS persistence for the device configuration.
//!
//! This module stores the configuration in ESP32's Non-Volatile Storage (NVS)
//! so the boot flag, staged credentials and results persist across reboots.

use super::{ConfigStore, StoreError};
use crate::config::DeviceConfig;
use esp_idf_svc::nvs::{EspNvs, EspNvsPartition, NvsDefault};
use esp_idf_sys::EspError;
use log::{debug, error, info};
use std::sync::Mutex;

/// NVS namespace for provisioning configuration.
const NVS_NAMESPACE: &str = "provision";

/// NVS key for the serialized configuration.
const NVS_KEY: &str = "config";

/// Upper bound for the serialized configuration.
/// Enterprise certificates dominate the size; 8 KiB leaves headroom.
const MAX_CONFIG_BUFFER_SIZE: usize = 8 * 1024;

/// NVS backed store.
pub struct NvsStore {
    nvs: Mutex<EspNvs<NvsDefault>>,
}

impl NvsStore {
    /// Open the provisioning namespace on the default NVS partition.
    pub fn init() -> Result<Self, EspError> {
        let partition = EspNvsPartition::<NvsDefault>::take()?;
        let nvs = EspNvs::new(partition, NVS_NAMESPACE, true)?;
        Ok(Self {
            nvs: Mutex::new(nvs),
        })
    }
}

fn esp_err(e: EspError) -> StoreError {
    StoreError::Unavailable(format!("ESP error: {:?}", e))
}

impl ConfigStore for NvsStore {
    fn load(&self) -> Result<Option<DeviceConfig>, StoreError> {
        let nvs = self.nvs.lock().map_err(|_| StoreError::Poisoned)?;
        let mut buf = vec![0u8; MAX_CONFIG_BUFFER_SIZE];

        match nvs.get_raw(NVS_KEY, &mut buf).map_err(esp_err)? {
            Some(bytes) => Ok(Some(DeviceConfig::from_json(bytes)?)),
            None => {
                debug!("No provisioning config found in NVS");
                Ok(None)
            }
        }
    }

    /// Save with read-back verification.
    ///
    /// Flash write failures do not always return an error code.
    fn save(&self, config: &DeviceConfig) -> Result<(), StoreError> {
        let bytes = config.to_json()?;
        if bytes.len() > MAX_CONFIG_BUFFER_SIZE {
            return Err(StoreError::Unavailable(format!(
                "config too large for NVS: {} bytes",
                bytes.len()
            )));
        }

        let mut nvs = self.nvs.lock().map_err(|_| StoreError::Poisoned)?;
        nvs.set_raw(NVS_KEY, &bytes).map_err(esp_err)?;

        let mut verify_buf = vec![0u8; MAX_CONFIG_BUFFER_SIZE];
        let read_bytes = nvs
            .get_raw(NVS_KEY, &mut verify_buf)
            .map_err(esp_err)?
            .ok_or_else(|| {
                error!("Config not found after save - possible flash failure");
                StoreError::VerifyFailed
            })?;

        if read_bytes != bytes.as_slice() {
            error!("Config verification failed - data mismatch after save");
            return Err(StoreError::VerifyFailed);
        }

        info!("Provisioning config saved and verified in NVS");
        Ok(())
    }
}
