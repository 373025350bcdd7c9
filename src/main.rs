//! Provisioning node binary.
//!
//! Runs on both ESP32 and host platforms:
//! - **Host**: `cargo run --bin provision-node`
//! - **ESP32**: `cargo espflash flash --bin provision-node --features esp32 --release`
//!
//! On host the station is simulated; the networks it can reach are the ones
//! already stored as the active station config.
//!
//! ## Endpoints
//!
//! - Status: http://localhost:8080/status
//! - Calls: `POST http://localhost:8080/call/<name>` with a JSON array body

use log::{info, warn};
use provision_wifi::{ProvisionController, ProvisionWifi, RpcServer};
use std::sync::Arc;

// ESP32: Initialize ESP-IDF before anything else
#[cfg(feature = "esp32")]
fn platform_init() {
    esp_idf_sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();
    info!("ESP-IDF initialized");
}

// Host: Just initialize env_logger
#[cfg(not(feature = "esp32"))]
fn platform_init() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

#[cfg(feature = "esp32")]
fn build_controller() -> ProvisionController {
    use esp_idf_hal::peripherals::Peripherals;
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use provision_wifi::station::EspStation;
    use provision_wifi::store::NvsStore;
    use provision_wifi::system::EspSystem;

    let peripherals = Peripherals::take().expect("Failed to take peripherals");
    let sysloop = EspSystemEventLoop::take().expect("Failed to take system event loop");
    let store = NvsStore::init().expect("Failed to initialize NVS");
    let station =
        EspStation::new(peripherals.modem, sysloop).expect("Failed to initialize WiFi driver");

    ProvisionController::new(Arc::new(station), Arc::new(store), Arc::new(EspSystem))
        .expect("Failed to create provisioning controller")
}

#[cfg(not(feature = "esp32"))]
fn build_controller() -> ProvisionController {
    use provision_wifi::station::SimulatedStation;
    use provision_wifi::store::{ConfigStore, FileStore};
    use provision_wifi::system::HostSystem;

    let store = FileStore::open_default().expect("Failed to resolve config path");
    info!("Config file: {}", store.path().display());

    let station = SimulatedStation::new();
    match store.load() {
        Ok(Some(config)) if !config.wifi.sta.is_empty() => {
            info!("Simulated network: {}", config.wifi.sta.ssid);
            station.add_network(&config.wifi.sta.ssid, &config.wifi.sta.pass);
        }
        Ok(_) => info!("No active station stored, simulated station has no networks"),
        Err(e) => warn!("Failed to read config: {}", e),
    }

    ProvisionController::new(Arc::new(station), Arc::new(store), Arc::new(HostSystem::new()))
        .expect("Failed to create provisioning controller")
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    platform_init();

    info!("=== Provisioning node starting ===");

    #[cfg(feature = "esp32")]
    info!("Platform: ESP32");
    #[cfg(not(feature = "esp32"))]
    info!("Platform: Host");

    let controller = build_controller();
    controller.init();

    let port = RpcServer::port_from_env();
    let _rpc_server = match RpcServer::start(None, port, ProvisionWifi::new(controller.clone())) {
        Ok(server) => Some(server),
        Err(e) => {
            warn!("Failed to start RPC server: {}", e);
            None
        }
    };

    // Wait for shutdown
    #[cfg(not(feature = "esp32"))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
        }
        info!("Shutting down...");
    }

    #[cfg(feature = "esp32")]
    std::future::pending::<()>().await;

    controller.shutdown();
}
