//! warmstartd - launch daemon
//!
//! Listens on one or more Unix sockets, receives launch requests from
//! invokers, starts the requested programs and reports their pid and exit
//! status back. It wires together:
//! - Configuration loading
//! - Reporting (console or syslog)
//! - The socket registry
//! - One accept loop per socket

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use warmstart_config::{Config, SocketConfig, load_config};
use warmstart_ipc::SocketRegistry;
use warmstart_util::{ReportOutput, default_config_path, die, init_reporting};
use warmstartd::{LinuxSpawner, ServeContext, accept_loop};

/// How long in-flight connections get after shutdown starts
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// warmstartd - Launch daemon for pre-started applications
#[derive(Parser, Debug)]
#[command(name = "warmstartd")]
#[command(about = "Launch daemon for pre-started applications", long_about = None)]
struct Args {
    /// Configuration file path; built-in defaults apply when it does not exist
    #[arg(short, long, default_value_os_t = default_config_path())]
    config: PathBuf,

    /// Launcher socket to listen on instead of the configured ones (repeatable)
    #[arg(short, long, env = "WARMSTART_SOCKET")]
    socket: Vec<PathBuf>,

    /// Log level (overrides the configuration file)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Report to syslog instead of the console
    #[arg(long)]
    syslog: bool,
}

fn read_config(args: &Args) -> Result<Config> {
    let mut config = if args.config.exists() {
        load_config(&args.config)
            .with_context(|| format!("Failed to load config from {:?}", args.config))?
    } else {
        Config::default()
    };

    if !args.socket.is_empty() {
        config.override_sockets(args.socket.iter().cloned());
    }

    Ok(config)
}

/// Main service state
struct Service {
    config: Config,
    registry: Arc<SocketRegistry>,
}

impl Service {
    /// Bind every configured socket. Failing to bind any of them is fatal.
    fn new(config: Config) -> Self {
        let registry = Arc::new(SocketRegistry::new());

        for socket in &config.sockets {
            if let Err(e) = registry.init(&socket.path, socket.mode) {
                registry.close_all();
                die(1, format!("cannot listen on {}: {}", socket.path.display(), e));
            }
        }

        Self { config, registry }
    }

    async fn run(self) -> Result<()> {
        let context = Arc::new(ServeContext::from_config(
            &self.config,
            self.registry.clone(),
            Arc::new(LinuxSpawner::new()),
        ));

        for socket in &self.config.sockets {
            spawn_accept_loop(context.clone(), socket.clone());
        }

        // Set up signal handlers
        let mut sigterm = signal(SignalKind::terminate())
            .context("Failed to create SIGTERM handler")?;
        let mut sigint = signal(SignalKind::interrupt())
            .context("Failed to create SIGINT handler")?;
        let mut sighup = signal(SignalKind::hangup())
            .context("Failed to create SIGHUP handler")?;

        info!(sockets = self.registry.len(), "Service running");

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("Received SIGINT, shutting down"),
            _ = sighup.recv() => info!("Received SIGHUP, shutting down"),
        }

        self.registry.close_all();
        Ok(())
    }
}

fn spawn_accept_loop(context: Arc<ServeContext>, socket: SocketConfig) {
    let runtime = Handle::current();
    tokio::task::spawn_blocking(move || accept_loop(context, socket, runtime));
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = read_config(&args);

    // Reporting comes up before anything can fail; config errors go through it
    let settings = config.as_ref().ok().map(|c| &c.daemon);
    let output = if args.syslog {
        ReportOutput::Syslog
    } else {
        settings.map(|d| d.log_output).unwrap_or_default()
    };
    let level = args
        .log_level
        .clone()
        .or_else(|| settings.map(|d| d.log_level.clone()))
        .unwrap_or_else(|| "info".to_string());
    let sink = init_reporting("warmstartd", output, &level);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        output = ?sink.output(),
        "warmstartd starting"
    );

    let config = config.unwrap_or_else(|e| die(1, format!("{:#}", e)));
    if !args.config.exists() {
        warn!(config_path = %args.config.display(), "No configuration file, using defaults");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start runtime")?;

    let service = Service::new(config);
    runtime.block_on(service.run())?;

    // Connections still waiting on children are abandoned
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    info!("Shutdown complete");
    Ok(())
}
