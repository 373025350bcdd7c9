//! WiFi provisioning test controller.
//!
//! The controller owns the staged station credentials, the boot test flag and
//! the last test result, and runs connectivity tests of candidate credentials
//! without giving up the active connection for longer than necessary.
//!
//! At most one test runs at a time. Starting a test while one is running is
//! rejected; every accepted or rejected start completes exactly once.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use provision_wifi::config::StaConfig;
//! use provision_wifi::controller::{ProvisionController, TestSource};
//! use provision_wifi::station::SimulatedStation;
//! use provision_wifi::store::MemoryStore;
//! use provision_wifi::system::HostSystem;
//!
//! # async fn demo() -> Result<(), provision_wifi::controller::ProvisionError> {
//! let station = Arc::new(SimulatedStation::new());
//! station.add_network("Home", "password123");
//!
//! let controller = ProvisionController::new(
//!     station,
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(HostSystem::new()),
//! )?;
//! controller.stage_sta_values(StaConfig::new("Home", "password123")?)?;
//!
//! let report = controller.start_test(TestSource::Staged)?.await;
//! assert!(report.code.is_success());
//! assert_eq!(controller.last_test_ssid(), "Home");
//! # Ok(())
//! # }
//! ```

use crate::config::{ConfigError, DeviceConfig, ProvisionSettings, StaConfig, TestResults};
use crate::station::{NetEvent, Station, StationError};
use crate::store::{ConfigStore, StoreError};
use crate::system::SystemControl;
use log::{debug, error, info, warn};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot};
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::{CancellationToken, DropGuard};

/// Pause after dropping an existing connection before testing.
pub const STA_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Result code delivered on test completion.
///
/// The numeric values cross the binding boundary as `int`; `1`/`0` keep the
/// old boolean callback meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum TestResultCode {
    /// Connected to the tested SSID.
    Success = 1,
    /// Connection attempts exhausted or the driver refused.
    Failed = 0,
    /// No connection within the configured timeout.
    Timeout = -1,
    /// The credentials are malformed; nothing was attempted.
    InvalidCredentials = -2,
    /// Another test is already running; nothing was attempted.
    Busy = -3,
}

impl TestResultCode {
    /// Numeric code for the binding boundary.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Parse a numeric code.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Success),
            0 => Some(Self::Failed),
            -1 => Some(Self::Timeout),
            -2 => Some(Self::InvalidCredentials),
            -3 => Some(Self::Busy),
            _ => None,
        }
    }

    /// True only for [`TestResultCode::Success`].
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

/// Outcome handed to the completion of a single test start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestReport {
    /// How the test ended.
    pub code: TestResultCode,
    /// SSID that was tested.
    pub ssid: String,
}

impl TestReport {
    fn new(code: TestResultCode, ssid: &str) -> Self {
        Self {
            code,
            ssid: ssid.to_string(),
        }
    }
}

/// Which credentials a test uses.
#[derive(Debug, Clone)]
pub enum TestSource {
    /// The staged credentials.
    Staged,
    /// Caller supplied credentials. The staging area is left untouched.
    Explicit(StaConfig),
}

/// Completion callback for the callback-style start operations.
pub type TestCallback = Box<dyn FnOnce(TestReport) + Send + 'static>;

/// Where a test's report goes.
enum Completion {
    Channel(oneshot::Sender<TestReport>),
    Callback(TestCallback),
    Detached,
}

impl Completion {
    fn finish(self, report: TestReport) {
        match self {
            Self::Channel(tx) => {
                // Receiver dropped means the caller stopped waiting
                let _ = tx.send(report);
            }
            Self::Callback(cb) => cb(report),
            Self::Detached => debug!("Test finished without listener: {:?}", report),
        }
    }
}

/// A started test. Resolves to its [`TestReport`].
#[derive(Debug)]
pub struct PendingTest {
    rx: oneshot::Receiver<TestReport>,
    ssid: String,
}

impl PendingTest {
    /// SSID under test.
    pub fn ssid(&self) -> &str {
        &self.ssid
    }
}

impl Future for PendingTest {
    type Output = TestReport;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let ssid = self.ssid.clone();
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or_else(|_| TestReport::new(TestResultCode::Failed, &ssid)))
    }
}

/// Error type for controller operations.
#[derive(Debug)]
pub enum ProvisionError {
    /// Credentials failed validation.
    Config(ConfigError),
    /// Persisting the configuration failed.
    Storage(StoreError),
    /// The station driver failed.
    Station(StationError),
    /// A test is already running.
    TestRunning,
    /// No credentials available for the operation.
    NoCredentials,
    /// The controller was created outside a Tokio runtime.
    NoRuntime,
}

impl std::fmt::Display for ProvisionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(e) => write!(f, "invalid credentials: {}", e),
            Self::Storage(e) => write!(f, "storage error: {}", e),
            Self::Station(e) => write!(f, "station error: {}", e),
            Self::TestRunning => write!(f, "a test is already running"),
            Self::NoCredentials => write!(f, "no station credentials available"),
            Self::NoRuntime => write!(f, "no Tokio runtime available"),
        }
    }
}

impl std::error::Error for ProvisionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            Self::Storage(e) => Some(e),
            Self::Station(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for ProvisionError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<StoreError> for ProvisionError {
    fn from(e: StoreError) -> Self {
        Self::Storage(e)
    }
}

impl From<StationError> for ProvisionError {
    fn from(e: StationError) -> Self {
        Self::Station(e)
    }
}

/// Staged vs explicit, kept once the candidate has been resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceKind {
    Staged,
    Explicit,
}

struct Inner {
    station: Arc<dyn Station>,
    store: Arc<dyn ConfigStore>,
    system: Arc<dyn SystemControl>,
    config: Mutex<DeviceConfig>,
    running: AtomicBool,
    runtime: Handle,
    cancel: CancellationToken,
    settle_delay: Duration,
}

/// WiFi provisioning test controller.
///
/// Cheap to clone; all clones share the same state. Start operations return
/// immediately and may be called from any thread.
///
/// Dropping the last clone has the same effect as [`shutdown`](Self::shutdown).
/// Spawned tasks hold only the shared state, never a handle.
#[derive(Clone)]
pub struct ProvisionController {
    inner: Arc<Inner>,
    _cancel_on_drop: Arc<DropGuard>,
}

impl ProvisionController {
    /// Create a controller, loading persisted state from `store`.
    ///
    /// Must be called from within a Tokio runtime; the runtime is captured
    /// so later calls can come from non-async threads.
    pub fn new(
        station: Arc<dyn Station>,
        store: Arc<dyn ConfigStore>,
        system: Arc<dyn SystemControl>,
    ) -> Result<Self, ProvisionError> {
        let runtime = Handle::try_current().map_err(|_| ProvisionError::NoRuntime)?;

        let config = match store.load() {
            Ok(Some(config)) => config,
            Ok(None) => {
                info!("No stored provisioning config, using defaults");
                DeviceConfig::default()
            }
            Err(e) => {
                warn!("Failed to load provisioning config, using defaults: {}", e);
                DeviceConfig::default()
            }
        };

        let cancel = CancellationToken::new();
        Ok(Self {
            _cancel_on_drop: Arc::new(cancel.clone().drop_guard()),
            inner: Arc::new(Inner {
                station,
                store,
                system,
                config: Mutex::new(config),
                running: AtomicBool::new(false),
                runtime,
                cancel,
                settle_delay: STA_SETTLE_DELAY,
            }),
        })
    }

    /// Boot hook: run the boot test if it is enabled.
    ///
    /// When the active station is enabled and a boot delay is set, the test
    /// is deferred so the normal connection attempt is not interrupted.
    pub fn init(&self) {
        let (enabled, delay, sta_enable) = {
            let config = self.inner.lock_config();
            (
                config.provision.boot.enable,
                config.provision.boot.delay,
                config.wifi.sta_enable,
            )
        };

        if !enabled {
            debug!("Boot test disabled");
            return;
        }

        if sta_enable && delay > 0 {
            info!("Boot test scheduled in {} s", delay);
            let inner = self.inner.clone();
            self.inner.runtime.spawn(async move {
                tokio::select! {
                    _ = inner.cancel.cancelled() => debug!("Boot test timer cancelled"),
                    _ = tokio::time::sleep(Duration::from_secs(delay)) => {
                        info!("Boot test timer fired");
                        inner.run_detached();
                    }
                }
            });
        } else {
            self.inner.run_detached();
        }
    }

    /// Enable the boot test and persist the flag.
    pub fn enable_boot_test(&self) -> Result<(), ProvisionError> {
        info!("Enabling provisioning test on boot");
        self.inner.update(|c| c.provision.boot.enable = true)
    }

    /// Disable the boot test and persist the flag.
    pub fn disable_boot_test(&self) -> Result<(), ProvisionError> {
        info!("Disabling provisioning test on boot");
        self.inner.update(|c| c.provision.boot.enable = false)
    }

    /// Whether the boot test is enabled.
    pub fn boot_test_enabled(&self) -> bool {
        self.inner.lock_config().provision.boot.enable
    }

    /// Connect the station using the staged credentials.
    pub fn connect_sta(&self) -> Result<(), ProvisionError> {
        let staged = self.staged_sta();
        if staged.is_empty() {
            error!("Connect requested with no staged credentials");
            return Err(ProvisionError::NoCredentials);
        }
        staged.validate()?;

        info!("Connecting station to staged SSID {}", staged.ssid);
        self.inner.station.setup(&staged)?;
        self.inner.station.connect()?;
        Ok(())
    }

    /// Disconnect the station.
    pub fn disconnect_sta(&self) -> Result<(), ProvisionError> {
        info!("Disconnecting station");
        self.inner.station.disconnect()?;
        Ok(())
    }

    /// Copy the staged credentials into the active station config.
    pub fn copy_sta_values(&self) -> Result<(), ProvisionError> {
        let staged = self.staged_sta();
        if staged.is_empty() {
            error!("Copy requested with no staged credentials");
            return Err(ProvisionError::NoCredentials);
        }
        staged.validate()?;

        info!("Copying staged credentials for {} to active station", staged.ssid);
        self.inner.update(|c| promote(c, &staged))
    }

    /// Copy the active station credentials into the staging area.
    pub fn stage_from_active(&self) -> Result<(), ProvisionError> {
        let active = self.inner.lock_config().wifi.sta.clone();
        if active.is_empty() {
            error!("No active station credentials to stage");
            return Err(ProvisionError::NoCredentials);
        }

        info!("Staging active credentials for {}", active.ssid);
        self.inner.update(|c| c.provision.sta = active)
    }

    /// Validate and stage candidate credentials.
    pub fn stage_sta_values(&self, sta: StaConfig) -> Result<(), ProvisionError> {
        if let Err(e) = sta.validate() {
            error!("Rejecting staged credentials: {}", e);
            return Err(e.into());
        }

        info!("Staging credentials for {}", sta.ssid);
        self.inner.update(|c| c.provision.sta = sta)
    }

    /// Erase the staged credentials.
    pub fn clear_sta_values(&self) -> Result<(), ProvisionError> {
        info!("Clearing staged credentials");
        self.inner.update(|c| c.provision.sta = StaConfig::default())
    }

    /// Snapshot of the staged credentials.
    pub fn staged_sta(&self) -> StaConfig {
        self.inner.lock_config().provision.sta.clone()
    }

    /// Snapshot of the provisioning settings.
    pub fn settings(&self) -> ProvisionSettings {
        self.inner.lock_config().provision.clone()
    }

    /// Snapshot of the whole persisted configuration.
    pub fn device_config(&self) -> DeviceConfig {
        self.inner.lock_config().clone()
    }

    /// Whether a test is in progress. Never blocks.
    pub fn is_test_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Success flag of the last completed test.
    pub fn last_test_result(&self) -> bool {
        self.inner.lock_config().provision.results.success
    }

    /// SSID of the last completed test (empty before the first test).
    pub fn last_test_ssid(&self) -> String {
        self.inner.lock_config().provision.results.ssid.clone()
    }

    /// Start a test and get a future for its report.
    ///
    /// Fails with [`ProvisionError::TestRunning`] if a test is in progress.
    /// Malformed credentials are not an error here; the test completes with
    /// [`TestResultCode::InvalidCredentials`].
    pub fn start_test(&self, source: TestSource) -> Result<PendingTest, ProvisionError> {
        let (tx, rx) = oneshot::channel();
        let ssid = self.inner.begin(source, Completion::Channel(tx))?;
        Ok(PendingTest { rx, ssid })
    }

    /// Fire-and-forget test of the staged credentials.
    pub fn run_test(&self) {
        self.inner.run_detached();
    }

    /// Test the staged credentials; `callback` runs exactly once.
    ///
    /// A rejected start calls back immediately with [`TestResultCode::Busy`].
    pub fn test<F>(&self, callback: F) -> Result<(), ProvisionError>
    where
        F: FnOnce(TestReport) + Send + 'static,
    {
        self.inner
            .begin(TestSource::Staged, Completion::Callback(Box::new(callback)))
            .map(|_| ())
    }

    /// Test explicit credentials without touching the staging area.
    ///
    /// `callback` runs exactly once, also for malformed input and when a
    /// test is already running.
    pub fn test_ssid_pass<F>(&self, ssid: &str, pass: &str, callback: F) -> Result<(), ProvisionError>
    where
        F: FnOnce(TestReport) + Send + 'static,
    {
        let mut sta = StaConfig::default();
        sta.ssid = ssid.to_string();
        sta.pass = pass.to_string();

        info!("Testing explicit credentials for SSID {}", ssid);
        self.inner
            .begin(TestSource::Explicit(sta), Completion::Callback(Box::new(callback)))
            .map(|_| ())
    }

    /// Stop the boot timer and abort a running test.
    ///
    /// An aborted test completes with [`TestResultCode::Failed`] without
    /// recording a result. Tests started afterwards complete the same way.
    pub fn shutdown(&self) {
        info!("Provisioning controller shutting down");
        self.inner.cancel.cancel();
    }
}

/// Write `sta` into the active station config.
fn promote(config: &mut DeviceConfig, sta: &StaConfig) {
    config.wifi.sta = sta.clone();
    config.wifi.sta_enable = config.provision.success.enable;
}

impl Inner {
    fn lock_config(&self) -> MutexGuard<'_, DeviceConfig> {
        // Writers never panic while holding the lock; recover the data if one did
        self.config.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply `f` to a copy of the config, persist it, then publish it.
    ///
    /// The in-memory config only changes if the save succeeded.
    fn update<F>(&self, f: F) -> Result<(), ProvisionError>
    where
        F: FnOnce(&mut DeviceConfig),
    {
        let mut config = self.lock_config();
        let mut next = config.clone();
        f(&mut next);

        if let Err(e) = self.store.save(&next) {
            error!("Failed to save provisioning config: {}", e);
            return Err(e.into());
        }

        *config = next;
        Ok(())
    }

    fn run_detached(self: &Arc<Self>) {
        if let Err(e) = self.begin(TestSource::Staged, Completion::Detached) {
            error!("Provisioning test not started: {}", e);
        }
    }

    /// Claim the single test slot and spawn the test.
    ///
    /// Returns the SSID under test.
    fn begin(
        self: &Arc<Self>,
        source: TestSource,
        completion: Completion,
    ) -> Result<String, ProvisionError> {
        let (kind, candidate) = match source {
            TestSource::Staged => (SourceKind::Staged, self.lock_config().provision.sta.clone()),
            TestSource::Explicit(sta) => (SourceKind::Explicit, sta),
        };
        let ssid = candidate.ssid.clone();

        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            error!("Provisioning test for {} rejected: test already running", ssid);
            completion.finish(TestReport::new(TestResultCode::Busy, &ssid));
            return Err(ProvisionError::TestRunning);
        }

        info!("Provisioning test started for {}", ssid);
        let inner = self.clone();
        self.runtime.spawn(async move {
            inner.execute(kind, candidate, completion).await;
        });

        Ok(ssid)
    }

    async fn execute(self: Arc<Self>, kind: SourceKind, candidate: StaConfig, completion: Completion) {
        let report = tokio::select! {
            _ = self.cancel.cancelled() => {
                warn!("Provisioning test for {} aborted", candidate.ssid);
                TestReport::new(TestResultCode::Failed, &candidate.ssid)
            }
            report = self.run(kind, &candidate) => report,
        };

        self.running.store(false, Ordering::SeqCst);
        info!(
            "Provisioning test for {} finished: {:?}",
            report.ssid, report.code
        );
        completion.finish(report);
    }

    async fn run(&self, kind: SourceKind, candidate: &StaConfig) -> TestReport {
        let settings = self.lock_config().provision.clone();

        if let Err(e) = candidate.validate() {
            error!("Provisioning test credentials invalid: {}", e);
            return self.fail(kind, candidate, &settings, false, TestResultCode::InvalidCredentials);
        }

        let was_connected = self.release_active_station().await;

        if let Err(e) = self.station.setup(candidate) {
            error!("Provisioning test station setup failed: {}", e);
            return self.fail(kind, candidate, &settings, was_connected, TestResultCode::Failed);
        }

        // Subscribe before connecting so the first Connecting is seen
        let mut events = self.station.subscribe();
        if let Err(e) = self.station.connect() {
            error!("Provisioning test connect failed: {}", e);
            return self.fail(kind, candidate, &settings, was_connected, TestResultCode::Failed);
        }

        let code = self.watch(&mut events, candidate, &settings).await;
        if code.is_success() {
            self.succeed(kind, candidate, &settings)
        } else {
            self.fail(kind, candidate, &settings, was_connected, code)
        }
    }

    /// Drop the current connection, if any. Returns whether there was one.
    async fn release_active_station(&self) -> bool {
        let status = self.station.status();
        if !status.is_active() {
            info!("Station not connected, nothing to release");
            return false;
        }

        let current = self.station.connected_ssid();
        info!(
            "Disconnecting existing station {} ({:?})",
            current.as_deref().unwrap_or("unknown"),
            status
        );
        if let Err(e) = self.station.disconnect() {
            warn!("Failed to disconnect existing station: {}", e);
        }
        tokio::time::sleep(self.settle_delay).await;
        true
    }

    /// Follow network events until the candidate connects or the test fails.
    async fn watch(
        &self,
        events: &mut broadcast::Receiver<NetEvent>,
        candidate: &StaConfig,
        settings: &ProvisionSettings,
    ) -> TestResultCode {
        let deadline = settings.timeout().map(|t| Instant::now() + t);
        let max_attempts = settings.attempts;
        let mut attempts = 0u32;

        loop {
            let event = match deadline {
                Some(deadline) => match timeout_at(deadline, events.recv()).await {
                    Ok(event) => event,
                    Err(_) => {
                        error!("Provisioning test connect timeout after {} attempts", attempts);
                        return TestResultCode::Timeout;
                    }
                },
                None => events.recv().await,
            };

            match event {
                Ok(NetEvent::Connecting) => {
                    attempts += 1;
                    info!("Station connecting, attempt {} of {}", attempts, max_attempts);
                }
                Ok(NetEvent::Disconnected) => {
                    info!("Station disconnected after attempt {} of {}", attempts, max_attempts);
                    if attempts >= max_attempts {
                        error!("Provisioning test failed after {} attempts", attempts);
                        return TestResultCode::Failed;
                    }
                    if let Err(e) = self.station.connect() {
                        error!("Reconnect attempt failed: {}", e);
                        return TestResultCode::Failed;
                    }
                }
                Ok(NetEvent::Connected) | Ok(NetEvent::IpAcquired) => {
                    match self.station.connected_ssid() {
                        Some(ssid) if ssid == candidate.ssid => {
                            info!("Station connected to {} after {} attempts", ssid, attempts);
                            return TestResultCode::Success;
                        }
                        other => {
                            info!(
                                "Station connected to {}, waiting for {}",
                                other.as_deref().unwrap_or("unknown"),
                                candidate.ssid
                            );
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Missed {} network events", missed);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    error!("Station event stream closed");
                    return TestResultCode::Failed;
                }
            }
        }
    }

    fn succeed(&self, kind: SourceKind, candidate: &StaConfig, settings: &ProvisionSettings) -> TestReport {
        if settings.success.disconnect {
            info!("Provisioning test succeeded, disconnecting test connection");
            if let Err(e) = self.station.disconnect() {
                warn!("Failed to disconnect test connection: {}", e);
            }
        }

        self.record(kind, candidate, true, settings.success.copy, settings.success.clear);

        if settings.success.reboot {
            self.system.restart();
        }
        TestReport::new(TestResultCode::Success, &candidate.ssid)
    }

    fn fail(
        &self,
        kind: SourceKind,
        candidate: &StaConfig,
        settings: &ProvisionSettings,
        was_connected: bool,
        code: TestResultCode,
    ) -> TestReport {
        if code != TestResultCode::InvalidCredentials && self.station.status().is_active() {
            if let Err(e) = self.station.disconnect() {
                warn!("Failed to stop test connection: {}", e);
            }
        }

        self.record(kind, candidate, false, false, settings.fail.clear);

        if settings.fail.reboot {
            self.system.restart();
            // Reboot restores the active station anyway
            return TestReport::new(code, &candidate.ssid);
        }

        if was_connected && settings.reconnect {
            self.restore_active_station();
        }
        TestReport::new(code, &candidate.ssid)
    }

    /// Persist the outcome in one write.
    fn record(&self, kind: SourceKind, candidate: &StaConfig, success: bool, copy: bool, clear: bool) {
        info!("Recording provisioning test result {} for {}", success, candidate.ssid);
        let result = self.update(|c| {
            if copy {
                promote(c, candidate);
            }
            c.provision.results = TestResults {
                success,
                ssid: candidate.ssid.clone(),
            };
            c.provision.boot.enable = false;
            if clear && kind == SourceKind::Staged {
                c.provision.sta = StaConfig::default();
            }
        });

        if result.is_err() {
            // Keep the result visible to accessors even if flash is failing
            self.lock_config().provision.results = TestResults {
                success,
                ssid: candidate.ssid.clone(),
            };
        }
    }

    fn restore_active_station(&self) {
        let (active, enabled) = {
            let config = self.lock_config();
            (config.wifi.sta.clone(), config.wifi.sta_enable)
        };
        if !enabled || active.is_empty() {
            debug!("No enabled active station to restore");
            return;
        }

        info!("Restoring previous station connection to {}", active.ssid);
        if let Err(e) = self
            .station
            .setup(&active)
            .and_then(|_| self.station.connect())
        {
            error!("Failed to restore previous station: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::station::{Behaviour, SimulatedStation};
    use crate::store::MemoryStore;
    use crate::system::HostSystem;

    struct Fixture {
        controller: ProvisionController,
        station: Arc<SimulatedStation>,
        store: Arc<MemoryStore>,
        system: Arc<HostSystem>,
    }

    fn fixture_with(config: DeviceConfig) -> Fixture {
        let station = Arc::new(SimulatedStation::new());
        let store = Arc::new(MemoryStore::with_config(config));
        reboot(station, store)
    }

    fn fixture() -> Fixture {
        fixture_with(DeviceConfig::default())
    }

    /// Build a fresh controller over existing station and store, as after a restart.
    fn reboot(station: Arc<SimulatedStation>, store: Arc<MemoryStore>) -> Fixture {
        let system = Arc::new(HostSystem::new());
        let controller =
            ProvisionController::new(station.clone(), store.clone(), system.clone()).unwrap();
        Fixture {
            controller,
            station,
            store,
            system,
        }
    }

    fn sta(ssid: &str, pass: &str) -> StaConfig {
        StaConfig::new(ssid, pass).unwrap()
    }

    fn stored(fx: &Fixture) -> DeviceConfig {
        fx.store.snapshot().expect("config saved")
    }

    #[test]
    fn test_new_outside_runtime_fails() {
        let result = ProvisionController::new(
            Arc::new(SimulatedStation::new()),
            Arc::new(MemoryStore::new()),
            Arc::new(HostSystem::new()),
        );
        assert!(matches!(result, Err(ProvisionError::NoRuntime)));
    }

    #[test]
    fn test_result_codes() {
        assert_eq!(TestResultCode::Success.code(), 1);
        assert_eq!(TestResultCode::Failed.code(), 0);
        assert_eq!(TestResultCode::Busy.code(), -3);
        assert_eq!(TestResultCode::from_code(-1), Some(TestResultCode::Timeout));
        assert_eq!(TestResultCode::from_code(42), None);
        assert!(!TestResultCode::Timeout.is_success());
    }

    #[tokio::test]
    async fn test_boot_flag_persists() {
        let fx = fixture();

        fx.controller.enable_boot_test().unwrap();
        assert!(fx.controller.boot_test_enabled());
        assert!(stored(&fx).provision.boot.enable);

        fx.controller.disable_boot_test().unwrap();
        assert!(!fx.controller.boot_test_enabled());
        assert!(!stored(&fx).provision.boot.enable);
    }

    #[tokio::test]
    async fn test_boot_flag_storage_failure() {
        let fx = fixture();
        fx.store.set_fail_saves(true);

        assert!(matches!(
            fx.controller.enable_boot_test(),
            Err(ProvisionError::Storage(_))
        ));
        assert!(!fx.controller.boot_test_enabled());
    }

    #[tokio::test]
    async fn test_copy_then_clear_leaves_nothing_to_connect() {
        let fx = fixture();
        fx.station.add_network("Home", "password123");
        fx.controller.stage_sta_values(sta("Home", "password123")).unwrap();

        fx.controller.copy_sta_values().unwrap();
        let config = stored(&fx);
        assert_eq!(config.wifi.sta.ssid, "Home");
        assert!(config.wifi.sta_enable);

        fx.controller.clear_sta_values().unwrap();
        assert!(fx.controller.staged_sta().is_empty());
        assert!(matches!(
            fx.controller.connect_sta(),
            Err(ProvisionError::NoCredentials)
        ));
        assert_eq!(fx.station.connect_calls(), 0);
    }

    #[tokio::test]
    async fn test_copy_without_staged_fails() {
        let fx = fixture();
        assert!(matches!(
            fx.controller.copy_sta_values(),
            Err(ProvisionError::NoCredentials)
        ));
    }

    #[tokio::test]
    async fn test_stage_from_active() {
        let mut config = DeviceConfig::default();
        config.wifi.sta = sta("Office", "officepass");
        let fx = fixture_with(config);

        fx.controller.stage_from_active().unwrap();
        assert_eq!(fx.controller.staged_sta().ssid, "Office");

        let empty = fixture();
        assert!(matches!(
            empty.controller.stage_from_active(),
            Err(ProvisionError::NoCredentials)
        ));
    }

    #[tokio::test]
    async fn test_stage_rejects_invalid() {
        let fx = fixture();
        let mut bad = StaConfig::default();
        bad.ssid = "Home".to_string();
        bad.pass = "short".to_string();

        assert!(matches!(
            fx.controller.stage_sta_values(bad),
            Err(ProvisionError::Config(ConfigError::PasswordTooShort { .. }))
        ));
        assert!(fx.controller.staged_sta().is_empty());
    }

    #[tokio::test]
    async fn test_connect_and_disconnect_sta() {
        let fx = fixture();
        fx.station.add_network("Home", "password123");
        fx.controller.stage_sta_values(sta("Home", "password123")).unwrap();

        fx.controller.connect_sta().unwrap();
        assert_eq!(fx.station.connected_ssid().as_deref(), Some("Home"));

        fx.controller.disconnect_sta().unwrap();
        assert_eq!(fx.station.connected_ssid(), None);
    }

    #[tokio::test]
    async fn test_staged_test_success() {
        let fx = fixture();
        fx.station.add_network("Home", "password123");
        fx.controller.stage_sta_values(sta("Home", "password123")).unwrap();
        fx.controller.enable_boot_test().unwrap();

        let pending = fx.controller.start_test(TestSource::Staged).unwrap();
        assert_eq!(pending.ssid(), "Home");
        assert!(fx.controller.is_test_running());

        let report = pending.await;
        assert_eq!(report, TestReport::new(TestResultCode::Success, "Home"));
        assert!(!fx.controller.is_test_running());
        assert!(fx.controller.last_test_result());
        assert_eq!(fx.controller.last_test_ssid(), "Home");

        let config = stored(&fx);
        assert!(!config.provision.boot.enable);
        assert_eq!(config.wifi.sta.ssid, "Home");
        // success.clear defaults to true
        assert!(config.provision.sta.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_until_callback() {
        let fx = fixture();
        fx.station.set_behaviour("Void", Behaviour::Silent);
        fx.controller.stage_sta_values(sta("Void", "password123")).unwrap();

        let (tx, rx) = oneshot::channel();
        let observer = fx.controller.clone();
        fx.controller
            .test(move |report| {
                let _ = tx.send((report, observer.is_test_running()));
            })
            .unwrap();
        assert!(fx.controller.is_test_running());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(fx.controller.is_test_running());

        let (report, running_in_callback) = rx.await.unwrap();
        assert_eq!(report.code, TestResultCode::Timeout);
        assert!(!running_in_callback);
        assert!(!fx.controller.is_test_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_rejected() {
        let fx = fixture();
        fx.station.set_behaviour("Void", Behaviour::Silent);
        fx.controller.stage_sta_values(sta("Void", "password123")).unwrap();

        let first = fx.controller.start_test(TestSource::Staged).unwrap();

        assert!(matches!(
            fx.controller.start_test(TestSource::Staged),
            Err(ProvisionError::TestRunning)
        ));

        let busy = Arc::new(Mutex::new(Vec::new()));
        let sink = busy.clone();
        let result = fx.controller.test(move |report| sink.lock().unwrap().push(report));
        assert!(matches!(result, Err(ProvisionError::TestRunning)));
        assert_eq!(
            *busy.lock().unwrap(),
            vec![TestReport::new(TestResultCode::Busy, "Void")]
        );

        assert_eq!(first.await.code, TestResultCode::Timeout);
        assert_eq!(busy.lock().unwrap().len(), 1);
        assert_eq!(fx.station.connect_calls(), 1);
    }

    #[tokio::test]
    async fn test_attempts_exhausted() {
        let fx = fixture();
        fx.station.set_behaviour("Closed", Behaviour::Reject);
        fx.controller.stage_sta_values(sta("Closed", "password123")).unwrap();

        let report = fx.controller.start_test(TestSource::Staged).unwrap().await;
        assert_eq!(report.code, TestResultCode::Failed);
        assert_eq!(fx.station.connect_calls(), crate::config::DEFAULT_ATTEMPTS as usize);
        assert!(!fx.controller.last_test_result());
        assert_eq!(fx.controller.last_test_ssid(), "Closed");
        // fail.clear defaults to false
        assert_eq!(fx.controller.staged_sta().ssid, "Closed");
    }

    #[tokio::test]
    async fn test_last_result_tracks_latest_test() {
        let fx = fixture();
        fx.station.add_network("Home", "password123");
        fx.station.set_behaviour("Closed", Behaviour::Reject);

        let report = fx
            .controller
            .start_test(TestSource::Explicit(sta("Home", "password123")))
            .unwrap()
            .await;
        assert!(report.code.is_success());
        assert!(fx.controller.last_test_result());

        fx.controller
            .start_test(TestSource::Explicit(sta("Closed", "password123")))
            .unwrap()
            .await;
        assert!(!fx.controller.last_test_result());
        assert_eq!(fx.controller.last_test_ssid(), "Closed");
    }

    #[tokio::test]
    async fn test_explicit_test_leaves_staging_alone() {
        let mut config = DeviceConfig::default();
        config.provision.sta = sta("Home", "password123");
        config.provision.success.clear = true;
        config.provision.fail.clear = true;
        let fx = fixture_with(config);
        fx.station.add_network("Guest", "guestpass1");
        fx.station.set_behaviour("Closed", Behaviour::Reject);

        for (ssid, pass) in [("Guest", "guestpass1"), ("Closed", "password123")] {
            let (tx, rx) = oneshot::channel();
            fx.controller
                .test_ssid_pass(ssid, pass, move |report| {
                    let _ = tx.send(report);
                })
                .unwrap();
            let report = rx.await.unwrap();
            assert_eq!(report.ssid, ssid);
            assert_eq!(fx.controller.staged_sta(), sta("Home", "password123"));
        }
    }

    #[tokio::test]
    async fn test_explicit_invalid_ssid_calls_back_once() {
        let fx = fixture();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();

        fx.controller
            .test_ssid_pass("", "password123", move |report| {
                sink.lock().unwrap().push(report.code)
            })
            .unwrap();

        tokio::task::yield_now().await;
        while fx.controller.is_test_running() {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            *calls.lock().unwrap(),
            vec![TestResultCode::InvalidCredentials]
        );
        assert_eq!(fx.station.connect_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_ssid_association_times_out() {
        let fx = fixture();
        fx.station.set_behaviour(
            "Mesh",
            Behaviour::Redirect {
                ssid: "Mesh-5G".to_string(),
            },
        );
        fx.controller.stage_sta_values(sta("Mesh", "password123")).unwrap();

        let report = fx.controller.start_test(TestSource::Staged).unwrap().await;
        assert_eq!(report.code, TestResultCode::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_restores_previous_connection() {
        let mut config = DeviceConfig::default();
        config.wifi.sta = sta("Office", "officepass");
        config.wifi.sta_enable = true;
        let fx = fixture_with(config);
        fx.station.add_network("Office", "officepass");
        fx.station.set_connected("Office");
        fx.station.set_behaviour("Closed", Behaviour::Reject);
        fx.controller.stage_sta_values(sta("Closed", "password123")).unwrap();

        let report = fx.controller.start_test(TestSource::Staged).unwrap().await;
        assert_eq!(report.code, TestResultCode::Failed);
        assert_eq!(
            fx.station.setup_history(),
            vec!["Closed".to_string(), "Office".to_string()]
        );
        assert_eq!(fx.station.connected_ssid().as_deref(), Some("Office"));
    }

    #[tokio::test]
    async fn test_reboot_policies() {
        let mut config = DeviceConfig::default();
        config.provision.success.reboot = true;
        config.provision.fail.reboot = true;
        let fx = fixture_with(config);
        fx.station.add_network("Home", "password123");
        fx.station.set_behaviour("Closed", Behaviour::Reject);

        fx.controller
            .start_test(TestSource::Explicit(sta("Home", "password123")))
            .unwrap()
            .await;
        assert_eq!(fx.system.restart_count(), 1);

        fx.controller
            .start_test(TestSource::Explicit(sta("Closed", "password123")))
            .unwrap()
            .await;
        assert_eq!(fx.system.restart_count(), 2);
    }

    #[tokio::test]
    async fn test_driver_refusal_fails_test() {
        let fx = fixture();
        fx.station.add_network("Home", "password123");
        fx.station.set_fail_connect(true);
        fx.controller.stage_sta_values(sta("Home", "password123")).unwrap();

        let report = fx.controller.start_test(TestSource::Staged).unwrap().await;
        assert_eq!(report.code, TestResultCode::Failed);
        assert!(!fx.controller.is_test_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_boot_test_does_not_run_after_reboot() {
        let fx = fixture();
        fx.station.add_network("Home", "password123");
        fx.controller.stage_sta_values(sta("Home", "password123")).unwrap();
        fx.controller.disable_boot_test().unwrap();

        let after_reboot = reboot(fx.station.clone(), fx.store.clone());
        after_reboot.controller.init();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(!after_reboot.controller.is_test_running());
        assert_eq!(after_reboot.station.connect_calls(), 0);
        assert_eq!(after_reboot.controller.last_test_ssid(), "");
    }

    #[tokio::test(start_paused = true)]
    async fn test_enabled_boot_test_runs_after_delay() {
        let fx = fixture();
        fx.station.add_network("Home", "password123");
        fx.controller.stage_sta_values(sta("Home", "password123")).unwrap();
        fx.controller.enable_boot_test().unwrap();
        let mut config = fx.controller.device_config();
        config.wifi.sta_enable = true;
        fx.store.save(&config).unwrap();

        let after_reboot = reboot(fx.station.clone(), fx.store.clone());
        after_reboot.controller.init();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(after_reboot.station.connect_calls(), 0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(after_reboot.station.connect_calls(), 1);
        assert!(after_reboot.controller.last_test_result());
        assert!(!after_reboot.controller.boot_test_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_running_test() {
        let fx = fixture();
        fx.station.set_behaviour("Void", Behaviour::Silent);
        fx.controller.stage_sta_values(sta("Void", "password123")).unwrap();

        let pending = fx.controller.start_test(TestSource::Staged).unwrap();
        tokio::task::yield_now().await;
        fx.controller.shutdown();

        assert_eq!(pending.await.code, TestResultCode::Failed);
        assert!(!fx.controller.is_test_running());
        assert_eq!(fx.controller.last_test_ssid(), "");
    }

    #[tokio::test]
    async fn test_results_visible_when_save_fails() {
        let fx = fixture();
        fx.station.add_network("Home", "password123");
        fx.controller.stage_sta_values(sta("Home", "password123")).unwrap();
        fx.controller.enable_boot_test().unwrap();
        fx.store.set_fail_saves(true);

        let report = fx.controller.start_test(TestSource::Staged).unwrap().await;
        assert_eq!(report.code, TestResultCode::Success);
        assert!(fx.controller.last_test_result());
        assert_eq!(fx.controller.last_test_ssid(), "Home");

        // Everything else stays as it is in flash
        let config = fx.controller.device_config();
        assert!(config.provision.boot.enable);
        assert!(config.wifi.sta.is_empty());
        assert_eq!(config.provision.sta.ssid, "Home");
        assert_eq!(stored(&fx).provision.results, TestResults::default());
    }

    #[tokio::test]
    async fn test_success_disconnect_drops_test_connection() {
        let mut config = DeviceConfig::default();
        config.provision.success.disconnect = true;
        let fx = fixture_with(config);
        fx.station.add_network("Home", "password123");

        let report = fx
            .controller
            .start_test(TestSource::Explicit(sta("Home", "password123")))
            .unwrap()
            .await;
        assert!(report.code.is_success());
        assert_eq!(fx.station.connected_ssid(), None);
        assert!(fx.controller.last_test_result());
    }

    #[tokio::test]
    async fn test_success_keeps_test_connection_by_default() {
        let fx = fixture();
        fx.station.add_network("Home", "password123");

        fx.controller
            .start_test(TestSource::Explicit(sta("Home", "password123")))
            .unwrap()
            .await;
        assert_eq!(fx.station.connected_ssid().as_deref(), Some("Home"));
    }

    #[tokio::test]
    async fn test_fail_clear_erases_staged() {
        let mut config = DeviceConfig::default();
        config.provision.fail.clear = true;
        let fx = fixture_with(config);
        fx.station.set_behaviour("Closed", Behaviour::Reject);
        fx.controller.stage_sta_values(sta("Closed", "password123")).unwrap();

        let report = fx.controller.start_test(TestSource::Staged).unwrap().await;
        assert_eq!(report.code, TestResultCode::Failed);
        assert!(fx.controller.staged_sta().is_empty());
        assert!(stored(&fx).provision.sta.is_empty());
        assert_eq!(fx.controller.last_test_ssid(), "Closed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_reconnect_leaves_station_down() {
        let mut config = DeviceConfig::default();
        config.wifi.sta = sta("Office", "officepass");
        config.wifi.sta_enable = true;
        config.provision.reconnect = false;
        let fx = fixture_with(config);
        fx.station.add_network("Office", "officepass");
        fx.station.set_connected("Office");
        fx.station.set_behaviour("Closed", Behaviour::Reject);
        fx.controller.stage_sta_values(sta("Closed", "password123")).unwrap();

        let report = fx.controller.start_test(TestSource::Staged).unwrap().await;
        assert_eq!(report.code, TestResultCode::Failed);
        assert_eq!(fx.station.setup_history(), vec!["Closed".to_string()]);
        assert_eq!(fx.station.connected_ssid(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_last_handle_cancels_boot_timer() {
        let fx = fixture();
        fx.station.add_network("Home", "password123");
        fx.controller.stage_sta_values(sta("Home", "password123")).unwrap();
        fx.controller.enable_boot_test().unwrap();
        let mut config = fx.controller.device_config();
        config.wifi.sta_enable = true;
        fx.store.save(&config).unwrap();

        let Fixture {
            controller,
            station,
            store,
            ..
        } = reboot(fx.station.clone(), fx.store.clone());
        controller.init();
        let other = controller.clone();
        drop(controller);

        // A remaining clone keeps the timer alive
        tokio::time::sleep(Duration::from_secs(1)).await;
        drop(other);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(station.connect_calls(), 0);
        let stored = store.snapshot().unwrap();
        assert!(stored.provision.boot.enable);
        assert_eq!(stored.provision.results, TestResults::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_last_handle_aborts_running_test() {
        let Fixture {
            controller,
            station,
            store,
            ..
        } = fixture();
        station.set_behaviour("Void", Behaviour::Silent);
        controller.stage_sta_values(sta("Void", "password123")).unwrap();

        let pending = controller.start_test(TestSource::Staged).unwrap();
        tokio::task::yield_now().await;
        drop(controller);

        assert_eq!(pending.await.code, TestResultCode::Failed);
        assert_eq!(store.snapshot().unwrap().provision.results, TestResults::default());
    }
}
