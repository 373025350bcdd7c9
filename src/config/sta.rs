//! Station credential types.
//!
//! This module contains platform-independent types for WiFi station
//! configuration that can be tested on the host machine.
//!
//! # Example
//!
//! ```
//! use provision_wifi::config::StaConfig;
//!
//! let sta = StaConfig::new("MyNetwork", "MyPassword").unwrap();
//! assert!(sta.validate().is_ok());
//! assert!(!sta.is_open());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Maximum SSID length per IEEE 802.11 standard.
pub const MAX_SSID_LEN: usize = 32;

/// Maximum password length for WPA2.
pub const MAX_PASSWORD_LEN: usize = 64;

/// Minimum password length for WPA2.
pub const MIN_PASSWORD_LEN: usize = 8;

/// WiFi station configuration.
///
/// Used both for the staged (candidate) credentials under test and for the
/// active station the device normally joins. Everything except `ssid` and
/// `pass` is optional and empty when unused.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct StaConfig {
    /// Network SSID (1-32 bytes).
    #[serde(default)]
    pub ssid: String,
    /// Network password (8-64 bytes for WPA2, empty for open networks).
    #[serde(default)]
    pub pass: String,
    /// WPA2-Enterprise user name.
    #[serde(default)]
    pub user: String,
    /// WPA2-Enterprise anonymous identity.
    #[serde(default)]
    pub anon_identity: String,
    /// Client certificate (PEM) for WPA2-Enterprise.
    #[serde(default)]
    pub cert: String,
    /// Client private key (PEM) for WPA2-Enterprise.
    #[serde(default)]
    pub key: String,
    /// CA certificate (PEM) for WPA2-Enterprise.
    #[serde(default)]
    pub ca_cert: String,
    /// Static IP address, empty for DHCP.
    #[serde(default)]
    pub ip: String,
    /// Static netmask.
    #[serde(default)]
    pub netmask: String,
    /// Static gateway.
    #[serde(default)]
    pub gw: String,
    /// Static DNS server.
    #[serde(default)]
    pub nameserver: String,
    /// Host name announced over DHCP.
    #[serde(default)]
    pub dhcp_hostname: String,
}

impl StaConfig {
    /// Create a new station configuration.
    ///
    /// Returns an error if SSID or password are invalid.
    pub fn new(ssid: impl Into<String>, pass: impl Into<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.ssid = ssid.into();
        config.pass = pass.into();
        config.validate()?;
        Ok(config)
    }

    /// Create a configuration for an open network (no password).
    pub fn open(ssid: impl Into<String>) -> Result<Self, ConfigError> {
        Self::new(ssid, String::new())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ssid.is_empty() {
            return Err(ConfigError::SsidEmpty);
        }
        if self.ssid.len() > MAX_SSID_LEN {
            return Err(ConfigError::SsidTooLong {
                len: self.ssid.len(),
                max: MAX_SSID_LEN,
            });
        }

        // Empty is OK for open networks
        if !self.pass.is_empty() && self.pass.len() < MIN_PASSWORD_LEN {
            return Err(ConfigError::PasswordTooShort {
                len: self.pass.len(),
                min: MIN_PASSWORD_LEN,
            });
        }
        if self.pass.len() > MAX_PASSWORD_LEN {
            return Err(ConfigError::PasswordTooLong {
                len: self.pass.len(),
                max: MAX_PASSWORD_LEN,
            });
        }

        if (!self.ip.is_empty() || !self.gw.is_empty()) && self.netmask.is_empty() {
            return Err(ConfigError::IncompleteStaticIp);
        }

        Ok(())
    }

    /// Check if this is an open network (no password).
    pub fn is_open(&self) -> bool {
        self.pass.is_empty()
    }

    /// True when nothing has been staged (no SSID).
    pub fn is_empty(&self) -> bool {
        self.ssid.is_empty()
    }

    /// True when the configuration uses WPA2-Enterprise credentials.
    pub fn is_enterprise(&self) -> bool {
        !self.user.is_empty() || !self.cert.is_empty()
    }
}

impl fmt::Debug for StaConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaConfig")
            .field("ssid", &self.ssid)
            .field("pass", &if self.pass.is_empty() { "" } else { "****" })
            .field("user", &self.user)
            .field("ip", &self.ip)
            .field("dhcp_hostname", &self.dhcp_hostname)
            .finish_non_exhaustive()
    }
}

/// Errors that can occur during configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// SSID is empty.
    SsidEmpty,
    /// SSID exceeds maximum length.
    SsidTooLong { len: usize, max: usize },
    /// Password is too short for WPA2.
    PasswordTooShort { len: usize, min: usize },
    /// Password exceeds maximum length.
    PasswordTooLong { len: usize, max: usize },
    /// Static IP or gateway given without a netmask.
    IncompleteStaticIp,
    /// Invalid data format during deserialization.
    InvalidFormat(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SsidEmpty => write!(f, "SSID cannot be empty"),
            Self::SsidTooLong { len, max } => {
                write!(f, "SSID too long: {} bytes (max {})", len, max)
            }
            Self::PasswordTooShort { len, min } => {
                write!(f, "password too short: {} bytes (min {})", len, min)
            }
            Self::PasswordTooLong { len, max } => {
                write!(f, "password too long: {} bytes (max {})", len, max)
            }
            Self::IncompleteStaticIp => write!(f, "static IP requires a netmask"),
            Self::InvalidFormat(msg) => write!(f, "invalid format: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
