//! Configuration validation

use crate::schema::RawConfig;
use std::collections::HashSet;
use thiserror::Error;

/// Validation error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("No sockets configured")]
    NoSockets,

    #[error("Duplicate socket path: {0}")]
    DuplicateSocket(String),

    #[error("Socket path must be absolute: {0}")]
    RelativeSocketPath(String),

    #[error("Socket '{path}': {mode:#o} is not a permission mode")]
    InvalidSocketMode { path: String, mode: u32 },

    #[error("Limit '{0}' must be greater than zero")]
    ZeroLimit(&'static str),

    #[error("require_credentials is set but no allowed_uids or allowed_gids are listed")]
    NoAllowedIdentities,

    #[error("Invalid log level '{0}'")]
    InvalidLogLevel(String),
}

/// Validate a raw configuration
pub fn validate_config(config: &RawConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if config.sockets.is_empty() {
        errors.push(ValidationError::NoSockets);
    }

    let mut seen_paths = HashSet::new();
    for socket in &config.sockets {
        let display = socket.path.display().to_string();

        if !seen_paths.insert(&socket.path) {
            errors.push(ValidationError::DuplicateSocket(display.clone()));
        }

        if !socket.path.is_absolute() {
            errors.push(ValidationError::RelativeSocketPath(display.clone()));
        }

        if let Some(mode) = socket.mode
            && mode > 0o7777
        {
            errors.push(ValidationError::InvalidSocketMode {
                path: display,
                mode,
            });
        }
    }

    let limits = &config.limits;
    for (name, value) in [
        ("max_args", limits.max_args),
        ("max_env", limits.max_env),
        ("max_string_len", limits.max_string_len),
        ("max_request_bytes", limits.max_request_bytes),
    ] {
        if value == 0 {
            errors.push(ValidationError::ZeroLimit(name));
        }
    }

    let security = &config.security;
    if security.require_credentials
        && security.allowed_uids.is_empty()
        && security.allowed_gids.is_empty()
    {
        errors.push(ValidationError::NoAllowedIdentities);
    }

    if let Some(level) = &config.daemon.log_level
        && level.parse::<tracing::Level>().is_err()
    {
        errors.push(ValidationError::InvalidLogLevel(level.clone()));
    }

    errors
}
