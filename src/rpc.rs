//! HTTP RPC endpoint for provisioning.
//!
//! Exposes the binding table over HTTP so a phone app or remote script can
//! drive provisioning. Uses `tiny_http` which works on both host and ESP32
//! (via std::net).
//!
//! # Endpoints
//!
//! - `GET /status` - controller snapshot as JSON
//! - `POST /call/<name>` - call an exposed binding; body is a JSON array of
//!   arguments (empty body means no arguments)
//!
//! # Example Response
//!
//! ```json
//! {
//!   "running": false,
//!   "last_success": true,
//!   "last_ssid": "Home",
//!   "boot_enabled": false,
//!   "staged_ssid": ""
//! }
//! ```

use crate::binding::{BindingError, ProvisionWifi};
use log::{error, info, warn};
use serde_json::{json, Value};
use std::io::Read;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tiny_http::{Header, Method, Request, Response, Server};

/// Default port for the RPC server.
pub const DEFAULT_RPC_PORT: u16 = 8080;

/// Environment variable overriding the RPC port on host.
pub const RPC_PORT_ENV: &str = "PROVISION_WIFI_PORT";

/// Largest accepted request body.
const MAX_BODY_LEN: u64 = 4096;

/// A routed reply: status code and JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// HTTP status code.
    pub status: u16,
    /// JSON body.
    pub body: Value,
}

impl Reply {
    fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    fn error(status: u16, message: impl Into<String>) -> Self {
        Self::new(status, json!({ "error": message.into() }))
    }
}

/// Controller snapshot served at `/status`.
pub fn status_json(api: &ProvisionWifi) -> Value {
    let controller = api.controller();
    let config = controller.device_config();
    json!({
        "running": controller.is_test_running(),
        "last_success": config.provision.results.success,
        "last_ssid": config.provision.results.ssid,
        "boot_enabled": config.provision.boot.enable,
        "staged_ssid": config.provision.sta.ssid,
    })
}

/// Route one request. Kept free of sockets so it can be tested directly.
pub fn route(api: &ProvisionWifi, method: &Method, path: &str, body: &[u8]) -> Reply {
    let path = path.split('?').next().unwrap_or("");

    if path == "/status" || path == "/status/" {
        if method != &Method::Get {
            return Reply::error(405, "use GET");
        }
        return Reply::new(200, status_json(api));
    }

    if let Some(name) = path.strip_prefix("/call/") {
        if method != &Method::Post {
            return Reply::error(405, "use POST");
        }

        let args: Vec<Value> = if body.iter().all(u8::is_ascii_whitespace) {
            Vec::new()
        } else {
            match serde_json::from_slice(body) {
                Ok(args) => args,
                Err(e) => return Reply::error(400, format!("arguments must be a JSON array: {}", e)),
            }
        };

        return match api.dispatch(name, &args) {
            Ok(result) => Reply::new(200, json!({ "result": result })),
            Err(e @ BindingError::UnknownName(_)) => Reply::error(404, e.to_string()),
            Err(e @ BindingError::BadArguments { .. }) => Reply::error(400, e.to_string()),
        };
    }

    Reply::error(404, "not found")
}

/// HTTP RPC server.
///
/// Runs in a background thread. Drop it to stop the server.
pub struct RpcServer {
    /// Server thread handle.
    handle: Option<thread::JoinHandle<()>>,
    /// Flag to signal shutdown.
    shutdown: Arc<AtomicBool>,
}

impl RpcServer {
    /// Start the RPC server.
    ///
    /// # Arguments
    ///
    /// * `bind_addr` - IP address to bind to (use `None` for 0.0.0.0)
    /// * `port` - Port to listen on
    /// * `api` - Binding functions to serve
    pub fn start(
        bind_addr: Option<IpAddr>,
        port: u16,
        api: ProvisionWifi,
    ) -> Result<Self, std::io::Error> {
        let addr = match bind_addr {
            Some(ip) => format!("{}:{}", ip, port),
            None => format!("0.0.0.0:{}", port),
        };

        let server = Server::http(&addr)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::AddrInUse, format!("{}", e)))?;

        info!("Provisioning RPC listening on http://{}/status", addr);

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();

        let handle = thread::spawn(move || {
            Self::run_server(server, api, shutdown_clone);
        });

        Ok(Self {
            handle: Some(handle),
            shutdown,
        })
    }

    /// Port from `PROVISION_WIFI_PORT`, or the default.
    pub fn port_from_env() -> u16 {
        match std::env::var(RPC_PORT_ENV) {
            Ok(value) => value.parse().unwrap_or_else(|_| {
                warn!("Invalid {}='{}', using {}", RPC_PORT_ENV, value, DEFAULT_RPC_PORT);
                DEFAULT_RPC_PORT
            }),
            Err(_) => DEFAULT_RPC_PORT,
        }
    }

    fn run_server(server: Server, api: ProvisionWifi, shutdown: Arc<AtomicBool>) {
        loop {
            // Acquire pairs with the Release in stop()
            if shutdown.load(Ordering::Acquire) {
                info!("Provisioning RPC shutting down");
                break;
            }

            match server.recv_timeout(Duration::from_millis(100)) {
                Ok(Some(request)) => Self::handle(&api, request),
                Ok(None) => {}
                Err(e) => {
                    error!("RPC server error: {}", e);
                    break;
                }
            }
        }
    }

    fn handle(api: &ProvisionWifi, mut request: Request) {
        let mut body = Vec::new();
        if let Err(e) = request
            .as_reader()
            .take(MAX_BODY_LEN)
            .read_to_end(&mut body)
        {
            warn!("Failed to read RPC request body: {}", e);
            return;
        }

        let reply = route(api, request.method(), request.url(), &body);
        let content_type = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]);

        let mut response = Response::from_string(reply.body.to_string()).with_status_code(reply.status);
        if let Ok(header) = content_type {
            response = response.with_header(header);
        }

        if let Err(e) = request.respond(response) {
            warn!("Failed to send RPC response: {}", e);
        }
    }

    /// Stop the server.
    ///
    /// Note: May take up to 100ms due to polling interval.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.stop();
    }
}
