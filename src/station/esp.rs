//! ESP-IDF station driver.
//!
//! This module wraps the ESP-IDF WiFi driver and translates its system
//! events into [`NetEvent`]s.

use super::{NetEvent, Station, StationError, StationStatus, EVENT_CHANNEL_CAPACITY};
use crate::config::StaConfig;
use esp_idf_hal::modem::Modem;
use esp_idf_svc::eventloop::{EspSubscription, EspSystemEventLoop, System};
use esp_idf_svc::netif::IpEvent;
use esp_idf_svc::wifi::{AuthMethod, ClientConfiguration, Configuration, EspWifi, WifiEvent};
use esp_idf_sys::EspError;
use log::{info, warn};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

const STATUS_DISCONNECTED: u8 = 0;
const STATUS_CONNECTING: u8 = 1;
const STATUS_CONNECTED: u8 = 2;
const STATUS_IP_ACQUIRED: u8 = 3;

/// ESP-IDF station driver.
pub struct EspStation {
    /// ESP-IDF WiFi driver.
    wifi: Mutex<EspWifi<'static>>,
    events: broadcast::Sender<NetEvent>,
    status: Arc<AtomicU8>,
    _wifi_sub: EspSubscription<'static, System>,
    _ip_sub: EspSubscription<'static, System>,
}

impl EspStation {
    /// Create the driver and subscribe to WiFi/IP system events.
    pub fn new(modem: Modem, sysloop: EspSystemEventLoop) -> Result<Self, EspError> {
        let wifi = EspWifi::new(modem, sysloop.clone(), None)?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let status = Arc::new(AtomicU8::new(STATUS_DISCONNECTED));

        let wifi_sub = {
            let events = events.clone();
            let status = status.clone();
            sysloop.subscribe::<WifiEvent, _>(move |event| match event {
                WifiEvent::StaConnected { .. } => {
                    status.store(STATUS_CONNECTED, Ordering::SeqCst);
                    let _ = events.send(NetEvent::Connected);
                }
                WifiEvent::StaDisconnected { .. } => {
                    status.store(STATUS_DISCONNECTED, Ordering::SeqCst);
                    let _ = events.send(NetEvent::Disconnected);
                }
                _ => {}
            })?
        };

        let ip_sub = {
            let events = events.clone();
            let status = status.clone();
            sysloop.subscribe::<IpEvent, _>(move |event| {
                if let IpEvent::DhcpIpAssigned { .. } = event {
                    status.store(STATUS_IP_ACQUIRED, Ordering::SeqCst);
                    let _ = events.send(NetEvent::IpAcquired);
                }
            })?
        };

        Ok(Self {
            wifi: Mutex::new(wifi),
            events,
            status,
            _wifi_sub: wifi_sub,
            _ip_sub: ip_sub,
        })
    }

    fn wifi(&self) -> MutexGuard<'_, EspWifi<'static>> {
        self.wifi.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// SSID of the access point the driver is associated with.
///
/// Read from the AP record rather than the client configuration, which holds
/// whatever was last set up, not what was actually joined.
fn associated_ssid() -> Option<String> {
    let mut record = esp_idf_sys::wifi_ap_record_t::default();
    // Fails with ESP_ERR_WIFI_NOT_CONNECT when not associated
    esp_idf_sys::esp!(unsafe { esp_idf_sys::esp_wifi_sta_get_ap_info(&mut record) }).ok()?;

    let len = record
        .ssid
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(record.ssid.len());
    Some(String::from_utf8_lossy(&record.ssid[..len]).into_owned())
}

impl Station for EspStation {
    fn setup(&self, config: &StaConfig) -> Result<(), StationError> {
        info!("Setting up station for {}", config.ssid);

        let auth_method = if config.is_open() {
            AuthMethod::None
        } else if config.is_enterprise() {
            AuthMethod::WPA2Enterprise
        } else {
            AuthMethod::WPA2Personal
        };

        let client = ClientConfiguration {
            ssid: config
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| StationError::Setup("invalid SSID".into()))?,
            password: config
                .pass
                .as_str()
                .try_into()
                .map_err(|_| StationError::Setup("invalid password".into()))?,
            auth_method,
            ..Default::default()
        };

        let mut wifi = self.wifi();
        // Even if the config didn't change, restart to re-init the driver
        if wifi.is_started().unwrap_or(false) {
            let _ = wifi.disconnect();
        }
        wifi.set_configuration(&Configuration::Client(client))
            .map_err(|e| StationError::Setup(format!("{:?}", e)))?;
        wifi.start()
            .map_err(|e| StationError::Setup(format!("{:?}", e)))?;
        Ok(())
    }

    fn connect(&self) -> Result<(), StationError> {
        self.wifi()
            .connect()
            .map_err(|e| StationError::Connect(format!("{:?}", e)))?;
        self.status.store(STATUS_CONNECTING, Ordering::SeqCst);
        let _ = self.events.send(NetEvent::Connecting);
        Ok(())
    }

    fn disconnect(&self) -> Result<(), StationError> {
        info!("Disconnecting station");
        let mut wifi = self.wifi();
        if let Err(e) = wifi.disconnect() {
            warn!("WiFi disconnect failed: {:?}", e);
            return Err(StationError::Disconnect(format!("{:?}", e)));
        }
        self.status.store(STATUS_DISCONNECTED, Ordering::SeqCst);
        Ok(())
    }

    fn status(&self) -> StationStatus {
        match self.status.load(Ordering::SeqCst) {
            STATUS_CONNECTING => StationStatus::Connecting,
            STATUS_CONNECTED => StationStatus::Connected,
            STATUS_IP_ACQUIRED => StationStatus::IpAcquired,
            _ => StationStatus::Disconnected,
        }
    }

    fn connected_ssid(&self) -> Option<String> {
        if !matches!(
            self.status(),
            StationStatus::Connected | StationStatus::IpAcquired
        ) {
            return None;
        }
        associated_ssid()
    }

    fn subscribe(&self) -> broadcast::Receiver<NetEvent> {
        self.events.subscribe()
    }
}
