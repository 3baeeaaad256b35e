//! Default paths for warmstart components
//!
//! - Launcher socket: `$XDG_RUNTIME_DIR/warmstart/launcher.sock` or `/tmp/warmstart-$USER/launcher.sock`
//! - Config: `/etc/warmstart/warmstartd.toml`

use std::path::PathBuf;

/// Environment variable for overriding the launcher socket path
pub const WARMSTART_SOCKET_ENV: &str = "WARMSTART_SOCKET";

/// Socket filename within the socket directory
const SOCKET_FILENAME: &str = "launcher.sock";

/// Application subdirectory name
const APP_DIR: &str = "warmstart";

/// Get the default launcher socket path.
///
/// Order of precedence:
/// 1. `$WARMSTART_SOCKET` environment variable (if set)
/// 2. `$XDG_RUNTIME_DIR/warmstart/launcher.sock` (if XDG_RUNTIME_DIR is set)
/// 3. `/tmp/warmstart-$USER/launcher.sock` (fallback)
pub fn default_socket_path() -> PathBuf {
    if let Ok(path) = std::env::var(WARMSTART_SOCKET_ENV) {
        return PathBuf::from(path);
    }

    socket_path_without_env()
}

/// Get the socket path without checking the WARMSTART_SOCKET env var.
pub fn socket_path_without_env() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join(APP_DIR).join(SOCKET_FILENAME);
    }

    let username = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    PathBuf::from(format!("/tmp/{}-{}", APP_DIR, username)).join(SOCKET_FILENAME)
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    PathBuf::from("/etc").join(APP_DIR).join("warmstartd.toml")
}
