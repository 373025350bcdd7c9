//! Persisted device configuration.
//!
//! [`DeviceConfig`] is the whole document the store persists: the active
//! station configuration plus the provisioning settings, staged credentials
//! and last test results.

use super::sta::StaConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default connection test timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default number of connection attempts before a test fails.
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Default delay before the boot test when an active station is configured.
pub const DEFAULT_BOOT_DELAY_SECS: u64 = 5;

/// Everything the provisioning controller persists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Active WiFi configuration.
    pub wifi: WifiSettings,
    /// Provisioning settings, staged credentials and results.
    pub provision: ProvisionSettings,
}

impl DeviceConfig {
    /// Parse from the JSON representation used by the stores.
    pub fn from_json(bytes: &[u8]) -> Result<Self, super::ConfigError> {
        serde_json::from_slice(bytes)
            .map_err(|e| super::ConfigError::InvalidFormat(e.to_string()))
    }

    /// Serialize to the JSON representation used by the stores.
    pub fn to_json(&self) -> Result<Vec<u8>, super::ConfigError> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| super::ConfigError::InvalidFormat(e.to_string()))
    }
}

/// Active WiFi station settings (what the device normally joins).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WifiSettings {
    /// Whether the active station is enabled.
    pub sta_enable: bool,
    /// Active station credentials.
    pub sta: StaConfig,
}

/// Provisioning settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionSettings {
    /// Boot test behaviour.
    pub boot: BootSettings,
    /// Seconds before a running test is failed (0 disables the timeout).
    pub timeout: u64,
    /// Connection attempts before a test is failed.
    pub attempts: u32,
    /// Restore the previous station connection after a failed test.
    pub reconnect: bool,
    /// Actions taken after a successful test.
    pub success: SuccessSettings,
    /// Actions taken after a failed test.
    pub fail: FailSettings,
    /// Last completed test.
    pub results: TestResults,
    /// Staged station credentials.
    pub sta: StaConfig,
}

impl ProvisionSettings {
    /// Test timeout, `None` when disabled.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_secs(self.timeout))
    }
}

impl Default for ProvisionSettings {
    fn default() -> Self {
        Self {
            boot: BootSettings::default(),
            timeout: DEFAULT_TIMEOUT_SECS,
            attempts: DEFAULT_ATTEMPTS,
            reconnect: true,
            success: SuccessSettings::default(),
            fail: FailSettings::default(),
            results: TestResults::default(),
            sta: StaConfig::default(),
        }
    }
}

/// Boot test settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootSettings {
    /// Run a test of the staged credentials at boot.
    pub enable: bool,
    /// Seconds to wait before the boot test when the active station is enabled.
    pub delay: u64,
}

impl Default for BootSettings {
    fn default() -> Self {
        Self {
            enable: false,
            delay: DEFAULT_BOOT_DELAY_SECS,
        }
    }
}

/// What to do after a successful test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuccessSettings {
    /// Copy the tested credentials into the active station config.
    pub copy: bool,
    /// Value written to `wifi.sta_enable` when copying.
    pub enable: bool,
    /// Clear the staged credentials.
    pub clear: bool,
    /// Disconnect the test connection.
    pub disconnect: bool,
    /// Restart the device.
    pub reboot: bool,
}

impl Default for SuccessSettings {
    fn default() -> Self {
        Self {
            copy: true,
            enable: true,
            clear: true,
            disconnect: false,
            reboot: false,
        }
    }
}

/// What to do after a failed test.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailSettings {
    /// Clear the staged credentials.
    pub clear: bool,
    /// Restart the device.
    pub reboot: bool,
}

/// Outcome of the last completed test.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestResults {
    /// Whether the test connected.
    pub success: bool,
    /// SSID that was tested.
    pub ssid: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = ProvisionSettings::default();
        assert!(!settings.boot.enable);
        assert_eq!(settings.attempts, DEFAULT_ATTEMPTS);
        assert_eq!(settings.timeout(), Some(Duration::from_secs(30)));
        assert!(settings.success.copy);
        assert!(!settings.fail.reboot);
        assert!(settings.sta.is_empty());
        assert_eq!(settings.results, TestResults::default());
    }

    #[test]
    fn test_zero_timeout_disables() {
        let settings = ProvisionSettings {
            timeout: 0,
            ..Default::default()
        };
        assert_eq!(settings.timeout(), None);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = br#"{"provision":{"boot":{"enable":true},"sta":{"ssid":"Home","pass":"password123"}}}"#;
        let config = DeviceConfig::from_json(json).unwrap();
        assert!(config.provision.boot.enable);
        assert_eq!(config.provision.boot.delay, DEFAULT_BOOT_DELAY_SECS);
        assert_eq!(config.provision.sta.ssid, "Home");
        assert_eq!(config.provision.attempts, DEFAULT_ATTEMPTS);
        assert!(!config.wifi.sta_enable);
    }

    #[test]
    fn test_to_json_reloads() {
        let mut config = DeviceConfig::default();
        config.provision.results.ssid = "Home".to_string();
        config.provision.results.success = true;

        let bytes = config.to_json().unwrap();
        assert!(!bytes.is_empty());
        assert_eq!(DeviceConfig::from_json(&bytes).unwrap(), config);
    }

    #[test]
    fn test_invalid_json() {
        let result = DeviceConfig::from_json(b"not json");
        assert!(matches!(
            result,
            Err(super::super::ConfigError::InvalidFormat(_))
        ));
    }
}
