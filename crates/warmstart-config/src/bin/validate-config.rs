//! Config validation CLI tool
//!
//! Validates a warmstartd configuration file and reports any errors.

use std::path::PathBuf;
use std::process::ExitCode;
use warmstart_config::{ConfigError, SocketKind};
use warmstart_util::default_config_path;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    let config_path = match args.get(1) {
        Some(path) => PathBuf::from(path),
        None => {
            let default_path = default_config_path();
            eprintln!("Usage: validate-config [config-file]");
            eprintln!();
            eprintln!("Validates a warmstartd configuration file.");
            eprintln!();
            eprintln!("Example:");
            eprintln!("  validate-config {}", default_path.display());
            return ExitCode::from(2);
        }
    };

    if !config_path.exists() {
        eprintln!("Error: Configuration file not found: {}", config_path.display());
        return ExitCode::from(1);
    }

    match warmstart_config::load_config(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!();
            println!("Summary:");
            println!("  Config version: {}", warmstart_config::CURRENT_CONFIG_VERSION);
            println!("  Log output: {:?}", config.daemon.log_output);
            match config.daemon.receive_timeout {
                Some(timeout) => println!("  Receive timeout: {} ms", timeout.as_millis()),
                None => println!("  Receive timeout: none"),
            }
            println!(
                "  Limits: {} args, {} env, {} bytes per string, {} bytes per request",
                config.limits.max_args,
                config.limits.max_env,
                config.limits.max_string_len,
                config.limits.max_request_bytes
            );
            if config.security.require_credentials {
                println!(
                    "  Credentials: uids {:?}, gids {:?}",
                    config.security.allowed_uids, config.security.allowed_gids
                );
            }

            println!();
            println!("Sockets:");
            for socket in &config.sockets {
                let kind = match socket.kind {
                    SocketKind::Launcher => "launcher",
                    SocketKind::Booster => "booster",
                };
                println!("  - {} [{}] mode {:o}", socket.path.display(), kind, socket.mode);
            }

            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed");
            eprintln!();
            match &e {
                ConfigError::ReadError(io_err) => {
                    eprintln!("Failed to read file: {}", io_err);
                }
                ConfigError::ParseError(parse_err) => {
                    eprintln!("TOML parse error:");
                    eprintln!("  {}", parse_err);
                }
                ConfigError::ValidationFailed { errors } => {
                    eprintln!("Validation errors ({}):", errors.len());
                    for err in errors {
                        eprintln!("  - {}", err);
                    }
                }
                ConfigError::UnsupportedVersion(ver) => {
                    eprintln!(
                        "Unsupported config version: {} (expected {})",
                        ver,
                        warmstart_config::CURRENT_CONFIG_VERSION
                    );
                }
            }
            ExitCode::from(1)
        }
    }
}
