//! Scripting binding surface.
//!
//! The scripting environment on the device sees the controller through a
//! table of exposed names, each mapped to a native signature. This module
//! holds that table ([`BINDINGS`]), the `bool`/`String` returning functions
//! behind it ([`ProvisionWifi`]) and a dispatcher taking script values.
//!
//! Every failure is reported as `false` (and logged); nothing here panics or
//! returns an error to the script for a failed operation.
//!
//! # Example
//!
//! ```no_run
//! use provision_wifi::binding::ProvisionWifi;
//! use serde_json::json;
//! # fn demo(api: ProvisionWifi) {
//! let ok = api.dispatch("onBoot.enable", &[]).unwrap();
//! assert_eq!(ok, json!(true));
//!
//! api.dispatch("Test.SSIDandPass", &[json!("Guest"), json!("guestpass1")])
//!     .unwrap();
//! # }
//! ```

use crate::controller::{ProvisionController, ProvisionError, TestReport};
use log::{error, info};
use serde_json::Value;
use std::fmt;

/// What an exposed name does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    /// Enable the boot test.
    BootEnable,
    /// Disable the boot test.
    BootDisable,
    /// Connect the station with staged credentials.
    StaConnect,
    /// Disconnect the station.
    StaDisconnect,
    /// Copy staged credentials to the active station.
    StaCopy,
    /// Clear staged credentials.
    StaClear,
    /// Success flag of the last test.
    ResultSuccess,
    /// SSID of the last test.
    ResultSsid,
    /// Whether a test is running.
    IsRunning,
    /// Start a test of the staged credentials with a completion callback.
    TestRun,
    /// Start a test of explicit credentials with a completion callback.
    TestSsidAndPass,
    /// Fire-and-forget test of the staged credentials.
    Run,
}

/// One row of the binding table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingEntry {
    /// Name as seen by scripts.
    pub name: &'static str,
    /// Native signature in C notation.
    pub signature: &'static str,
    /// Operation behind the name.
    pub kind: BindingKind,
    /// Kept only for scripts written against older tables.
    pub deprecated: bool,
}

impl BindingEntry {
    const fn new(name: &'static str, signature: &'static str, kind: BindingKind) -> Self {
        Self {
            name,
            signature,
            kind,
            deprecated: false,
        }
    }

    const fn alias(name: &'static str, signature: &'static str, kind: BindingKind) -> Self {
        Self {
            name,
            signature,
            kind,
            deprecated: true,
        }
    }
}

/// The exposed binding table.
pub const BINDINGS: &[BindingEntry] = &[
    BindingEntry::new(
        "onBoot.enable",
        "bool mgos_provision_wifi_enable_boot_test(void)",
        BindingKind::BootEnable,
    ),
    BindingEntry::new(
        "onBoot.disable",
        "bool mgos_provision_wifi_disable_boot_test(void)",
        BindingKind::BootDisable,
    ),
    BindingEntry::new(
        "STA.connect",
        "bool mgos_provision_wifi_connect_sta(void)",
        BindingKind::StaConnect,
    ),
    BindingEntry::new(
        "STA.disconnect",
        "bool mgos_provision_wifi_disconnect_sta(void)",
        BindingKind::StaDisconnect,
    ),
    BindingEntry::new(
        "STA.copy",
        "bool mgos_provision_wifi_copy_sta_values(void)",
        BindingKind::StaCopy,
    ),
    BindingEntry::new(
        "STA.clear",
        "bool mgos_provision_wifi_clear_sta_values(void)",
        BindingKind::StaClear,
    ),
    BindingEntry::new(
        "Results.success",
        "bool mgos_provision_wifi_get_last_test_results(void)",
        BindingKind::ResultSuccess,
    ),
    BindingEntry::new(
        "Results.ssid",
        "char *mgos_provision_wifi_get_last_test_ssid(void)",
        BindingKind::ResultSsid,
    ),
    BindingEntry::new(
        "isRunning",
        "bool mgos_provision_wifi_is_test_running(void)",
        BindingKind::IsRunning,
    ),
    BindingEntry::new(
        "Test.run",
        "void mgos_provision_wifi_test(void (*)(int, char *, userdata), userdata)",
        BindingKind::TestRun,
    ),
    BindingEntry::new(
        "Test.SSIDandPass",
        "void mgos_provision_wifi_test_ssid_pass(char *, char *, void (*)(int, char *, userdata), userdata)",
        BindingKind::TestSsidAndPass,
    ),
    BindingEntry::new(
        "run",
        "void mgos_provision_wifi_run_test(void)",
        BindingKind::Run,
    ),
    BindingEntry::alias(
        "LastTest.success",
        "bool mgos_provision_wifi_get_last_test_results(void)",
        BindingKind::ResultSuccess,
    ),
    BindingEntry::alias(
        "LastTest.ssid",
        "char *mgos_provision_wifi_get_last_test_ssid(void)",
        BindingKind::ResultSsid,
    ),
    BindingEntry::alias(
        "runTest",
        "void mgos_provision_wifi_run_test(void)",
        BindingKind::Run,
    ),
    BindingEntry::alias(
        "test",
        "void mgos_provision_wifi_test(void (*)(int, char *, userdata), userdata)",
        BindingKind::TestRun,
    ),
];

/// Find a table entry by exposed name.
pub fn lookup(name: &str) -> Option<&'static BindingEntry> {
    BINDINGS.iter().find(|entry| entry.name == name)
}

/// Completion handed in by the script host: `(result code, ssid)`.
pub type ScriptCallback = Box<dyn FnOnce(i32, String) + Send + 'static>;

/// Errors in calling the binding table itself (not operation failures).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingError {
    /// No such exposed name.
    UnknownName(String),
    /// Arguments did not match the signature.
    BadArguments { name: String, expected: &'static str },
}

impl fmt::Display for BindingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownName(name) => write!(f, "unknown binding: {}", name),
            Self::BadArguments { name, expected } => {
                write!(f, "bad arguments for {}: expected {}", name, expected)
            }
        }
    }
}

impl std::error::Error for BindingError {}

/// Binding functions over a [`ProvisionController`].
#[derive(Clone)]
pub struct ProvisionWifi {
    controller: ProvisionController,
}

impl ProvisionWifi {
    /// Wrap a controller.
    pub fn new(controller: ProvisionController) -> Self {
        Self { controller }
    }

    /// The wrapped controller.
    pub fn controller(&self) -> &ProvisionController {
        &self.controller
    }

    /// `onBoot.enable`
    pub fn enable_boot_test(&self) -> bool {
        status("onBoot.enable", self.controller.enable_boot_test())
    }

    /// `onBoot.disable`
    pub fn disable_boot_test(&self) -> bool {
        status("onBoot.disable", self.controller.disable_boot_test())
    }

    /// `STA.connect`: join the network with the staged credentials.
    pub fn connect_sta(&self) -> bool {
        status("STA.connect", self.controller.connect_sta())
    }

    /// `STA.disconnect`
    pub fn disconnect_sta(&self) -> bool {
        status("STA.disconnect", self.controller.disconnect_sta())
    }

    /// `STA.copy`: staged credentials become the active station.
    pub fn copy_sta_values(&self) -> bool {
        status("STA.copy", self.controller.copy_sta_values())
    }

    /// `STA.clear`
    pub fn clear_sta_values(&self) -> bool {
        status("STA.clear", self.controller.clear_sta_values())
    }

    /// `isRunning`
    pub fn is_test_running(&self) -> bool {
        self.controller.is_test_running()
    }

    /// `Results.success` (alias `LastTest.success`).
    pub fn get_last_test_result(&self) -> bool {
        self.controller.last_test_result()
    }

    /// `Results.ssid` (alias `LastTest.ssid`).
    ///
    /// Returned by value, so the script owns its copy.
    pub fn get_last_test_ssid(&self) -> String {
        self.controller.last_test_ssid()
    }

    /// `run` (alias `runTest`): test the staged credentials, no callback.
    pub fn run_test(&self) {
        self.controller.run_test();
    }

    /// Test staged credentials; `callback(code, ssid)` runs exactly once.
    pub fn test<F>(&self, callback: F)
    where
        F: FnOnce(i32, String) + Send + 'static,
    {
        // Rejection already called back with Busy
        let _ = status(
            "Test.run",
            self.controller.test(move |report: TestReport| {
                callback(report.code.code(), report.ssid)
            }),
        );
    }

    /// Test explicit credentials; `callback(code, ssid)` runs exactly once.
    ///
    /// A missing SSID is tested as empty and reported as invalid credentials.
    pub fn test_ssid_pass<F>(&self, ssid: Option<&str>, pass: Option<&str>, callback: F)
    where
        F: FnOnce(i32, String) + Send + 'static,
    {
        let _ = status(
            "Test.SSIDandPass",
            self.controller.test_ssid_pass(
                ssid.unwrap_or_default(),
                pass.unwrap_or_default(),
                move |report: TestReport| callback(report.code.code(), report.ssid),
            ),
        );
    }

    /// Call an exposed name with script arguments.
    ///
    /// Test starts made this way have no script callback; their outcome is
    /// logged and readable through `Results.*`.
    pub fn dispatch(&self, name: &str, args: &[Value]) -> Result<Value, BindingError> {
        self.call(name, args, None)
    }

    /// Call an exposed name, with an optional completion for test starts.
    pub fn call(
        &self,
        name: &str,
        args: &[Value],
        callback: Option<ScriptCallback>,
    ) -> Result<Value, BindingError> {
        let entry = lookup(name).ok_or_else(|| BindingError::UnknownName(name.to_string()))?;
        if entry.deprecated {
            info!("Deprecated binding {} used", entry.name);
        }

        let callback: ScriptCallback = match callback {
            Some(callback) => callback,
            None => {
                let name = entry.name;
                Box::new(move |code: i32, ssid: String| {
                    info!("{} completed for {} with code {}", name, ssid, code);
                })
            }
        };

        let value = match entry.kind {
            BindingKind::BootEnable => Value::Bool(self.enable_boot_test()),
            BindingKind::BootDisable => Value::Bool(self.disable_boot_test()),
            BindingKind::StaConnect => Value::Bool(self.connect_sta()),
            BindingKind::StaDisconnect => Value::Bool(self.disconnect_sta()),
            BindingKind::StaCopy => Value::Bool(self.copy_sta_values()),
            BindingKind::StaClear => Value::Bool(self.clear_sta_values()),
            BindingKind::ResultSuccess => Value::Bool(self.get_last_test_result()),
            BindingKind::ResultSsid => Value::String(self.get_last_test_ssid()),
            BindingKind::IsRunning => Value::Bool(self.is_test_running()),
            BindingKind::TestRun => {
                self.test(callback);
                Value::Null
            }
            BindingKind::TestSsidAndPass => {
                let ssid = string_arg(entry, args, 0)?;
                let pass = string_arg(entry, args, 1)?;
                self.test_ssid_pass(ssid.as_deref(), pass.as_deref(), callback);
                Value::Null
            }
            BindingKind::Run => {
                self.run_test();
                Value::Null
            }
        };
        Ok(value)
    }
}

/// Log a failed operation and flatten it to the `bool` contract.
fn status(name: &str, result: Result<(), ProvisionError>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            error!("{} failed: {}", name, e);
            false
        }
    }
}

/// String or null argument at `index`; absent counts as null.
fn string_arg(
    entry: &BindingEntry,
    args: &[Value],
    index: usize,
) -> Result<Option<String>, BindingError> {
    match args.get(index) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(BindingError::BadArguments {
            name: entry.name.to_string(),
            expected: "string or null",
        }),
    }
}
