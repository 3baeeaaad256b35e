//! Raw configuration schema (as parsed from TOML)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use warmstart_api::ProtocolLimits;
use warmstart_util::ReportOutput;

/// Raw configuration as parsed from TOML
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawConfig {
    /// Config schema version
    pub config_version: u32,

    /// Global daemon settings
    #[serde(default)]
    pub daemon: RawDaemonConfig,

    /// Bounds on what a peer may send
    #[serde(default)]
    pub limits: ProtocolLimits,

    /// Peer credential requirements
    #[serde(default)]
    pub security: RawSecurity,

    /// Sockets to listen on
    #[serde(default)]
    pub sockets: Vec<RawSocket>,
}

/// Daemon-level settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawDaemonConfig {
    /// Diagnostics sink: "console" or "syslog"
    pub log_output: Option<ReportOutput>,

    /// Default log level (overridden by RUST_LOG)
    pub log_level: Option<String>,

    /// Per-read timeout on invoker connections; 0 disables
    pub receive_timeout_ms: Option<u64>,

    /// Upper bound on the respawn delay a booster honours
    pub max_respawn_delay_secs: Option<u64>,
}

/// Credential requirements
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawSecurity {
    #[serde(default)]
    pub require_credentials: bool,

    #[serde(default)]
    pub allowed_uids: Vec<u32>,

    #[serde(default)]
    pub allowed_gids: Vec<u32>,
}

/// What a socket serves
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SocketKind {
    /// Launches a fresh process per request
    #[default]
    Launcher,
    /// Pre-warmed; paces its own restart with the requested respawn delay
    Booster,
}

/// Raw socket definition
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawSocket {
    pub path: PathBuf,

    #[serde(default)]
    pub kind: SocketKind,

    /// File mode of the socket (default 0o666)
    pub mode: Option<u32>,
}
