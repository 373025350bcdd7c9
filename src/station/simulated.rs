//! Scripted station driver.
//!
//! On host systems there is no WiFi radio to drive. This station answers
//! connection attempts from a table of known access points, which makes the
//! provisioning controller fully testable and lets the host binary be
//! exercised end to end.

use super::{NetEvent, Station, StationError, StationStatus, EVENT_CHANNEL_CAPACITY};
use crate::config::StaConfig;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

/// How a simulated access point answers a connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Behaviour {
    /// Associate when the password matches, otherwise disconnect.
    Accept { pass: String },
    /// Always disconnect.
    Reject,
    /// Never answer (attempt hangs until the caller gives up).
    Silent,
    /// Associate, but with a different SSID (e.g. a roaming mesh name).
    Redirect { ssid: String },
}

#[derive(Debug)]
struct SimState {
    networks: HashMap<String, Behaviour>,
    configured: Option<StaConfig>,
    status: StationStatus,
    connected_ssid: Option<String>,
    setup_history: Vec<String>,
    connect_calls: usize,
    fail_connect: bool,
}

/// Host station driver backed by a table of simulated access points.
#[derive(Debug)]
pub struct SimulatedStation {
    state: Mutex<SimState>,
    events: broadcast::Sender<NetEvent>,
}

impl SimulatedStation {
    /// Create a station with no known networks.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(SimState {
                networks: HashMap::new(),
                configured: None,
                status: StationStatus::Disconnected,
                connected_ssid: None,
                setup_history: Vec::new(),
                connect_calls: 0,
                fail_connect: false,
            }),
            events,
        }
    }

    /// Add an access point that accepts `pass`.
    pub fn add_network(&self, ssid: &str, pass: &str) {
        self.set_behaviour(
            ssid,
            Behaviour::Accept {
                pass: pass.to_string(),
            },
        );
    }

    /// Set how the access point named `ssid` behaves.
    pub fn set_behaviour(&self, ssid: &str, behaviour: Behaviour) {
        self.lock().networks.insert(ssid.to_string(), behaviour);
    }

    /// Start out associated with `ssid`, as if the active station had connected.
    pub fn set_connected(&self, ssid: &str) {
        let mut state = self.lock();
        state.status = StationStatus::IpAcquired;
        state.connected_ssid = Some(ssid.to_string());
    }

    /// Make `connect` return an error (driver refusing to start).
    pub fn set_fail_connect(&self, fail: bool) {
        self.lock().fail_connect = fail;
    }

    /// SSIDs passed to `setup`, oldest first.
    pub fn setup_history(&self) -> Vec<String> {
        self.lock().setup_history.clone()
    }

    /// Number of successful `connect` calls.
    pub fn connect_calls(&self) -> usize {
        self.lock().connect_calls
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // A poisoned simulator only means a test already panicked
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, event: NetEvent) {
        debug!("Simulated station event: {:?}", event);
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

impl Default for SimulatedStation {
    fn default() -> Self {
        Self::new()
    }
}

impl Station for SimulatedStation {
    fn setup(&self, config: &StaConfig) -> Result<(), StationError> {
        config
            .validate()
            .map_err(|e| StationError::Setup(e.to_string()))?;

        let was_active = {
            let mut state = self.lock();
            let was_active = state.status.is_active();
            state.configured = Some(config.clone());
            state.status = StationStatus::Disconnected;
            state.connected_ssid = None;
            state.setup_history.push(config.ssid.clone());
            was_active
        };

        if was_active {
            self.publish(NetEvent::Disconnected);
        }
        Ok(())
    }

    fn connect(&self) -> Result<(), StationError> {
        let outcome = {
            let mut state = self.lock();
            if state.fail_connect {
                return Err(StationError::Connect("simulated driver failure".into()));
            }
            let config = state.configured.clone().ok_or(StationError::NotConfigured)?;
            state.connect_calls += 1;
            state.status = StationStatus::Connecting;

            let outcome = match state.networks.get(&config.ssid) {
                Some(Behaviour::Accept { pass }) if *pass == config.pass => {
                    Some(Some(config.ssid.clone()))
                }
                Some(Behaviour::Redirect { ssid }) => Some(Some(ssid.clone())),
                Some(Behaviour::Silent) => None,
                _ => Some(None),
            };

            match &outcome {
                Some(Some(ssid)) => {
                    state.status = StationStatus::IpAcquired;
                    state.connected_ssid = Some(ssid.clone());
                }
                Some(None) => {
                    state.status = StationStatus::Disconnected;
                    state.connected_ssid = None;
                }
                None => {}
            }
            outcome
        };

        self.publish(NetEvent::Connecting);
        match outcome {
            Some(Some(ssid)) => {
                info!("Simulated station associated with {}", ssid);
                self.publish(NetEvent::Connected);
                self.publish(NetEvent::IpAcquired);
            }
            Some(None) => self.publish(NetEvent::Disconnected),
            None => debug!("Simulated access point silent"),
        }
        Ok(())
    }

    fn disconnect(&self) -> Result<(), StationError> {
        let was_active = {
            let mut state = self.lock();
            let was_active = state.status.is_active();
            state.status = StationStatus::Disconnected;
            state.connected_ssid = None;
            was_active
        };
        if was_active {
            self.publish(NetEvent::Disconnected);
        }
        Ok(())
    }

    fn status(&self) -> StationStatus {
        self.lock().status
    }

    fn connected_ssid(&self) -> Option<String> {
        self.lock().connected_ssid.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<NetEvent> {
        self.events.subscribe()
    }
}
