//! Station (WiFi client) driver abstraction.
//!
//! This module provides a platform-independent station interface that works on:
//! - **ESP32** (`esp32` feature): ESP-IDF WiFi driver ([`EspStation`])
//! - **Host**: scripted access points ([`SimulatedStation`])
//!
//! # Example
//!
//! ```
//! use provision_wifi::config::StaConfig;
//! use provision_wifi::station::{NetEvent, SimulatedStation, Station};
//!
//! let station = SimulatedStation::new();
//! station.add_network("Home", "password123");
//!
//! let mut events = station.subscribe();
//! station.setup(&StaConfig::new("Home", "password123").unwrap()).unwrap();
//! station.connect().unwrap();
//!
//! assert_eq!(events.try_recv().unwrap(), NetEvent::Connecting);
//! assert_eq!(station.connected_ssid().as_deref(), Some("Home"));
//! ```

use crate::config::StaConfig;
use tokio::sync::broadcast;

#[cfg(feature = "esp32")]
mod esp;
mod simulated;

#[cfg(feature = "esp32")]
pub use esp::EspStation;
pub use simulated::{Behaviour, SimulatedStation};

/// Capacity of the network event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Network events published by a station driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetEvent {
    /// Link lost or association failed.
    Disconnected,
    /// A connection attempt started.
    Connecting,
    /// Associated with an access point.
    Connected,
    /// DHCP (or static) address configured.
    IpAcquired,
}

/// Current station state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationStatus {
    /// Not connected to any access point.
    Disconnected,
    /// Connection attempt in progress.
    Connecting,
    /// Associated, no address yet.
    Connected,
    /// Associated and addressed.
    IpAcquired,
}

impl StationStatus {
    /// True for any state other than `Disconnected`.
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Disconnected)
    }
}

/// Station driver.
///
/// Implementations publish [`NetEvent`]s to every subscriber. A successful
/// [`Station::connect`] must publish `Connecting` before returning, so each
/// attempt is observable exactly once.
pub trait Station: Send + Sync {
    /// Apply a station configuration. Drops any current connection.
    fn setup(&self, config: &StaConfig) -> Result<(), StationError>;

    /// Connect to the network applied with [`Station::setup`].
    fn connect(&self) -> Result<(), StationError>;

    /// Disconnect and stop reconnecting.
    fn disconnect(&self) -> Result<(), StationError>;

    /// Current station state.
    fn status(&self) -> StationStatus;

    /// SSID of the access point currently associated with, if any.
    fn connected_ssid(&self) -> Option<String>;

    /// Subscribe to network events.
    fn subscribe(&self) -> broadcast::Receiver<NetEvent>;
}

/// Station driver errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StationError {
    /// `connect` was called before `setup`.
    NotConfigured,
    /// The driver rejected the configuration.
    Setup(String),
    /// The driver refused to start a connection.
    Connect(String),
    /// The driver failed to disconnect.
    Disconnect(String),
}

impl std::fmt::Display for StationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConfigured => write!(f, "station not configured"),
            Self::Setup(e) => write!(f, "station setup failed: {}", e),
            Self::Connect(e) => write!(f, "station connect failed: {}", e),
            Self::Disconnect(e) => write!(f, "station disconnect failed: {}", e),
        }
    }
}

impl std::error::Error for StationError {}
