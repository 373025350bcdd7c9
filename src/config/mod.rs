//! Provisioning configuration.
//!
//! # Components
//!
//! - [`sta`] - Station credentials and validation (host-testable)
//! - [`settings`] - The persisted device configuration document

mod settings;
mod sta;

pub use settings::{
    BootSettings, DeviceConfig, FailSettings, ProvisionSettings, SuccessSettings, TestResults,
    WifiSettings, DEFAULT_ATTEMPTS, DEFAULT_BOOT_DELAY_SECS, DEFAULT_TIMEOUT_SECS,
};
pub use sta::{ConfigError, StaConfig, MAX_PASSWORD_LEN, MAX_SSID_LEN, MIN_PASSWORD_LEN};
