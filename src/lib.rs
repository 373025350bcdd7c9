//! Wi-Fi provisioning test controller.
//!
//! Verifies candidate station credentials by temporarily connecting with them,
//! records the outcome, and optionally promotes working credentials into the
//! active station configuration. Platform-independent parts build and test on
//! the host; the `esp32` feature adds the ESP-IDF station, NVS store and
//! restart control.

pub mod binding;
pub mod config;
pub mod controller;
pub mod rpc;
pub mod station;
pub mod store;
pub mod system;

// Re-export commonly used items
pub use binding::{ProvisionWifi, BINDINGS};
pub use config::{ConfigError, DeviceConfig, ProvisionSettings, StaConfig};
pub use controller::{
    PendingTest, ProvisionController, ProvisionError, TestReport, TestResultCode, TestSource,
};
pub use rpc::{RpcServer, DEFAULT_RPC_PORT};
pub use station::{NetEvent, Station, StationError, StationStatus};
pub use store::{ConfigStore, StoreError};
pub use system::SystemControl;
