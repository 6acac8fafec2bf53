//! systemd readiness notification
//!
//! When started under `Type=notify`, systemd passes a datagram socket in
//! `NOTIFY_SOCKET`. Outside systemd every call is a no-op.

use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Sends `sd_notify` style state strings to the service manager
#[derive(Debug, Clone, Default)]
pub struct SystemdNotifier {
    notify_socket: Option<String>,
}

impl SystemdNotifier {
    /// Notifier for the socket named by `NOTIFY_SOCKET`, if any
    pub fn from_env() -> Self {
        let notify_socket = std::env::var("NOTIFY_SOCKET").ok().filter(|s| !s.is_empty());
        if notify_socket.is_some() {
            debug!("Systemd NOTIFY_SOCKET detected");
        }
        Self { notify_socket }
    }

    /// Notifier for an explicit socket path
    pub fn with_socket(path: impl Into<PathBuf>) -> Self {
        Self {
            notify_socket: Some(path.into().to_string_lossy().into_owned()),
        }
    }

    /// Whether a service manager is listening
    pub fn is_enabled(&self) -> bool {
        self.notify_socket.is_some()
    }

    /// Startup finished
    pub fn ready(&self, status: &str) {
        self.notify(&format!("READY=1\nSTATUS={}", status));
    }

    /// Shutdown started
    pub fn stopping(&self) {
        self.notify("STOPPING=1");
    }

    /// Send a raw state string; failures are logged, never fatal
    pub fn notify(&self, state: &str) {
        let Some(target) = &self.notify_socket else {
            return;
        };
        debug!("Sending systemd notification: {}", state.replace('\n', " "));

        let socket = match UnixDatagram::unbound() {
            Ok(socket) => socket,
            Err(e) => {
                warn!("Failed to create Unix datagram socket: {}", e);
                return;
            }
        };

        if let Err(e) = send(&socket, target, state.as_bytes()) {
            warn!("Failed to send systemd notification: {}", e);
        }
    }
}

#[cfg(target_os = "linux")]
fn send(socket: &UnixDatagram, target: &str, payload: &[u8]) -> std::io::Result<usize> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::SocketAddr;

    match target.strip_prefix('@') {
        Some(name) => {
            let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
            socket.send_to_addr(payload, &addr)
        }
        None => socket.send_to(payload, target),
    }
}

#[cfg(not(target_os = "linux"))]
fn send(socket: &UnixDatagram, target: &str, payload: &[u8]) -> std::io::Result<usize> {
    socket.send_to(payload, target)
}
