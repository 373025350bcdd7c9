//! Device restart control.

use log::warn;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Restarts the device after a test when the settings ask for it.
pub trait SystemControl: Send + Sync {
    /// Restart the device. On hardware this does not return.
    fn restart(&self);
}

/// Host implementation: records restart requests instead of rebooting.
#[derive(Debug, Default)]
pub struct HostSystem {
    restarts: AtomicUsize,
}

impl HostSystem {
    /// Create a new host system control.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of restarts requested so far.
    pub fn restart_count(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }
}

impl SystemControl for HostSystem {
    fn restart(&self) {
        warn!("Restart requested (ignored on host)");
        self.restarts.fetch_add(1, Ordering::SeqCst);
    }
}

/// ESP32 implementation: resets the chip.
#[cfg(feature = "esp32")]
#[derive(Debug, Default)]
pub struct EspSystem;

#[cfg(feature = "esp32")]
impl SystemControl for EspSystem {
    fn restart(&self) {
        warn!("Restarting device");
        esp_idf_hal::reset::restart();
    }
}
