//! Validated configuration structures

use crate::schema::{RawConfig, RawDaemonConfig, RawSecurity, RawSocket, SocketKind};
use std::path::PathBuf;
use std::time::Duration;
use warmstart_api::ProtocolLimits;
use warmstart_util::{ReportOutput, default_socket_path};

/// Socket files are created with the registry's mode unless configured
pub use warmstart_ipc::DEFAULT_SOCKET_MODE;

const DEFAULT_RECEIVE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MAX_RESPAWN_DELAY_SECS: u64 = 60;
const DEFAULT_LOG_LEVEL: &str = "info";

/// Validated configuration ready for use by the daemon
#[derive(Debug, Clone)]
pub struct Config {
    pub daemon: DaemonSettings,
    pub limits: ProtocolLimits,
    pub security: SecuritySettings,
    pub sockets: Vec<SocketConfig>,
}

impl Config {
    /// Convert from raw config (after validation)
    pub fn from_raw(raw: RawConfig) -> Self {
        Self {
            daemon: DaemonSettings::from_raw(raw.daemon),
            limits: raw.limits,
            security: SecuritySettings::from_raw(raw.security),
            sockets: raw.sockets.into_iter().map(SocketConfig::from_raw).collect(),
        }
    }

    /// Replace the configured sockets with launcher sockets at `paths`
    pub fn override_sockets(&mut self, paths: impl IntoIterator<Item = PathBuf>) {
        self.sockets = paths
            .into_iter()
            .map(|path| SocketConfig {
                path,
                kind: SocketKind::Launcher,
                mode: DEFAULT_SOCKET_MODE,
            })
            .collect();
    }
}

impl Default for Config {
    /// A single launcher socket at the per-user default location
    fn default() -> Self {
        Self {
            daemon: DaemonSettings::default(),
            limits: ProtocolLimits::default(),
            security: SecuritySettings::default(),
            sockets: vec![SocketConfig {
                path: default_socket_path(),
                kind: SocketKind::Launcher,
                mode: DEFAULT_SOCKET_MODE,
            }],
        }
    }
}

/// Daemon-level settings
#[derive(Debug, Clone)]
pub struct DaemonSettings {
    pub log_output: ReportOutput,
    pub log_level: String,
    /// None means reads never time out
    pub receive_timeout: Option<Duration>,
    pub max_respawn_delay: Duration,
}

impl DaemonSettings {
    fn from_raw(raw: RawDaemonConfig) -> Self {
        // 0 disables the timeout
        let timeout_ms = raw.receive_timeout_ms.unwrap_or(DEFAULT_RECEIVE_TIMEOUT_MS);
        let receive_timeout = (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms));

        Self {
            log_output: raw.log_output.unwrap_or_default(),
            log_level: raw
                .log_level
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            receive_timeout,
            max_respawn_delay: Duration::from_secs(
                raw.max_respawn_delay_secs
                    .unwrap_or(DEFAULT_MAX_RESPAWN_DELAY_SECS),
            ),
        }
    }
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self::from_raw(RawDaemonConfig::default())
    }
}

/// Peer credential requirements
#[derive(Debug, Clone, Default)]
pub struct SecuritySettings {
    pub require_credentials: bool,
    pub allowed_uids: Vec<u32>,
    pub allowed_gids: Vec<u32>,
}

impl SecuritySettings {
    fn from_raw(raw: RawSecurity) -> Self {
        Self {
            require_credentials: raw.require_credentials,
            allowed_uids: raw.allowed_uids,
            allowed_gids: raw.allowed_gids,
        }
    }
}

/// One listening socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketConfig {
    pub path: PathBuf,
    pub kind: SocketKind,
    pub mode: u32,
}

impl SocketConfig {
    fn from_raw(raw: RawSocket) -> Self {
        Self {
            path: raw.path,
            kind: raw.kind,
            mode: raw.mode.unwrap_or(DEFAULT_SOCKET_MODE),
        }
    }

    pub fn is_booster(&self) -> bool {
        self.kind == SocketKind::Booster
    }
}
