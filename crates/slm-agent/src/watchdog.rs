//! systemd notification socket support.
//!
//! Minimal sd_notify: READY on startup, WATCHDOG on every heartbeat cycle so
//! a wedged loop gets restarted by the supervisor, STOPPING on shutdown.
//! Absent `NOTIFY_SOCKET` (not under systemd) every call is a quiet no-op.

use std::os::unix::net::UnixDatagram;
use tracing::debug;

pub const READY: &str = "READY=1";
pub const WATCHDOG: &str = "WATCHDOG=1";
pub const STOPPING: &str = "STOPPING=1";

/// Send a notification state to systemd. Returns whether it was delivered.
pub fn sd_notify(state: &str) -> bool {
    let Ok(socket_path) = std::env::var("NOTIFY_SOCKET") else {
        return false;
    };
    if socket_path.is_empty() {
        return false;
    }

    let Ok(socket) = UnixDatagram::unbound() else {
        return false;
    };

    let sent = if let Some(name) = socket_path.strip_prefix('@') {
        send_abstract(&socket, name, state)
    } else {
        socket.send_to(state.as_bytes(), &socket_path).is_ok()
    };

    if sent {
        debug!(state, "sd_notify delivered");
    }
    sent
}

#[cfg(target_os = "linux")]
fn send_abstract(socket: &UnixDatagram, name: &str, state: &str) -> bool {
    use std::os::linux::net::SocketAddrExt;
    let Ok(addr) = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes()) else {
        return false;
    };
    socket.send_to_addr(state.as_bytes(), &addr).is_ok()
}

#[cfg(not(target_os = "linux"))]
fn send_abstract(_socket: &UnixDatagram, _name: &str, _state: &str) -> bool {
    false
}
