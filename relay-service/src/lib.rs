//! `pagetap-relay`: the relay process service and the bridge that feeds it.
//!
//! The service listens on a Unix domain socket at
//! `$XDG_RUNTIME_DIR/pagetap-relay.sock` and speaks JSON-RPC-lite. Bridge
//! processes connect to the same socket, forward the envelopes their pages
//! emit, and receive `bridge.command` notifications in return.
//!
//! - [`ipc`]: socket server and method dispatch
//! - [`bridge_client`]: the bridge side of the socket plus the CDP wiring
//! - [`link`]: persistent backend command link
//! - [`protocol`]: method names and parameter types

use std::path::{Path, PathBuf};

use pagetap_core::config::RelayConfig;

pub mod bridge_client;
pub mod ipc;
pub mod link;
pub mod logging;
pub mod protocol;

/// Protocol version for the relay socket.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Default socket filename.
pub const SOCKET_FILENAME: &str = "pagetap-relay.sock";

/// Get the default socket path using XDG_RUNTIME_DIR.
///
/// Falls back to `/tmp/pagetap-relay-<username>.sock` if XDG_RUNTIME_DIR is not set.
pub fn default_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join(SOCKET_FILENAME)
    } else {
        let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
        PathBuf::from(format!("/tmp/pagetap-relay-{user}.sock"))
    }
}

/// Command-line override, then config, then the default.
pub fn resolve_socket_path(flag: Option<&Path>, config: &RelayConfig) -> PathBuf {
    flag.map(Path::to_path_buf)
        .or_else(|| config.socket_path.clone())
        .unwrap_or_else(default_socket_path)
}
