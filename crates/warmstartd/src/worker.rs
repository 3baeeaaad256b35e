//! Serving invoker connections
//!
//! One blocking accept loop runs per listening socket. A launcher socket
//! hands every accepted connection to its own blocking task; a booster
//! socket launches inline and then holds off accepting for the respawn
//! delay the invoker asked for.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, error, info, info_span, warn};
use warmstart_config::{Config, SecuritySettings, SocketConfig};
use warmstart_ipc::{
    Connection, ConnectionOptions, ConnectionState, CredentialPolicy, CredentialRequirement,
    ErrorKind, IpcError, SocketRegistry, Transport,
};
use warmstart_util::ConnectionId;

use crate::{SpawnError, SpawnedChild, Spawner};

/// Back-off after an accept error that is not a shutdown
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Anything that ends the handling of one connection early
#[derive(Debug, Error)]
pub enum ServeError {
    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),
}

impl ServeError {
    /// Log the failure at a level matching its kind. Nothing here is fatal
    /// to the daemon.
    pub fn report(&self) {
        match self {
            ServeError::Ipc(e) => match e.kind() {
                ErrorKind::Protocol => warn!(error = %e, "Malformed request dropped"),
                ErrorKind::Security => warn!(error = %e, "Peer rejected"),
                ErrorKind::Send => info!(error = %e, "Invoker went away"),
                ErrorKind::Resource => error!(error = %e, "Connection failed"),
                ErrorKind::Usage => error!(error = %e, "Connection misused"),
            },
            ServeError::Spawn(e) => error!(error = %e, "Launch failed"),
        }
    }
}

/// A child started for a connection that still has to be waited on
pub struct Launched {
    child: Box<dyn SpawnedChild>,
    pid: u32,
    respawn_delay: Duration,
}

impl Launched {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Respawn delay the invoker requested
    pub fn respawn_delay(&self) -> Duration {
        self.respawn_delay
    }
}

/// How a connection ended after a successful launch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Served {
    pub pid: u32,
    /// Raw wait status of the child
    pub wait_status: i32,
    /// False for detached requests and invokers that left early
    pub status_delivered: bool,
}

/// Receive a request, start it and tell the invoker its pid.
///
/// Once a child exists this never fails: if the pid cannot be delivered
/// the failure is logged and the child is still handed back for reaping.
pub fn launch<T: Transport>(
    conn: &mut Connection<T>,
    spawner: &dyn Spawner,
) -> Result<Launched, ServeError> {
    let request = conn.receive()?;

    let exec = request.exec.clone();
    let detached = request.is_detached();
    let respawn_delay = request.respawn_delay();

    let child = match spawner.spawn(request) {
        Ok(child) => child,
        Err(e) => {
            conn.close();
            return Err(e.into());
        }
    };

    let pid = child.pid();
    info!(pid = pid, exec = %exec.display(), detached = detached, "Launched");

    if let Err(e) = conn.send_pid(pid) {
        ServeError::from(e).report();
    }

    Ok(Launched {
        child,
        pid,
        respawn_delay,
    })
}

/// Wait for a launched child and report its status if the invoker wants it.
/// The connection is closed on return.
pub fn finish<T: Transport>(
    conn: &mut Connection<T>,
    mut launched: Launched,
) -> Result<Served, ServeError> {
    let pid = launched.pid;
    let result = launched.child.wait();

    let wait_status = match result {
        Ok(status) => status,
        Err(e) => {
            conn.close();
            return Err(e.into());
        }
    };
    debug!(pid = pid, wait_status = wait_status, "Child exited");

    // A closed connection means the pid could not be delivered either
    let sent = (conn.is_exit_status_expected() && conn.state() == ConnectionState::Completed)
        .then(|| conn.send_exit_status(wait_status));
    conn.close();

    Ok(Served {
        pid,
        wait_status,
        status_delivered: sent.transpose()?.is_some(),
    })
}

/// Handle one accepted connection from request to exit status
pub fn serve_connection<T: Transport>(
    conn: &mut Connection<T>,
    spawner: &dyn Spawner,
) -> Result<Served, ServeError> {
    let launched = launch(conn, spawner)?;
    finish(conn, launched)
}

/// How long a booster waits before accepting again
pub fn respawn_pause(requested: Duration, max: Duration) -> Duration {
    requested.min(max)
}

/// Build the credential policy from configuration
pub fn credential_policy(security: &SecuritySettings) -> CredentialPolicy {
    if !security.require_credentials {
        return CredentialPolicy::Disabled;
    }

    let requirements = security
        .allowed_uids
        .iter()
        .map(|uid| CredentialRequirement::Uid(*uid))
        .chain(
            security
                .allowed_gids
                .iter()
                .map(|gid| CredentialRequirement::Gid(*gid)),
        )
        .collect();

    CredentialPolicy::Require(requirements)
}

/// State shared by every accept loop
pub struct ServeContext {
    pub registry: Arc<SocketRegistry>,
    pub spawner: Arc<dyn Spawner>,
    pub options: ConnectionOptions,
    pub max_respawn_delay: Duration,
}

impl ServeContext {
    pub fn from_config(
        config: &Config,
        registry: Arc<SocketRegistry>,
        spawner: Arc<dyn Spawner>,
    ) -> Self {
        Self {
            registry,
            spawner,
            options: ConnectionOptions {
                limits: config.limits,
                receive_timeout: config.daemon.receive_timeout,
                credential_policy: credential_policy(&config.security),
            },
            max_respawn_delay: config.daemon.max_respawn_delay,
        }
    }
}

/// Accept connections on `socket` until the registry closes it.
///
/// Blocking; run it on a blocking task. Connections are served on
/// blocking tasks of `runtime`.
pub fn accept_loop(ctx: Arc<ServeContext>, socket: SocketConfig, runtime: Handle) {
    let path = socket.path.display().to_string();
    info!(socket = %path, kind = ?socket.kind, "Accepting connections");

    loop {
        let mut conn = Connection::new(&socket.path, ctx.options.clone());

        match conn.accept(&ctx.registry) {
            Ok(()) => {}
            Err(IpcError::NotInitialized(_)) => break,
            // Already logged by the connection
            Err(e) if e.kind() == ErrorKind::Security => continue,
            Err(e) => {
                // close_all shuts the listener down under a blocked accept
                if ctx.registry.find(&socket.path).is_err() {
                    break;
                }
                warn!(socket = %path, error = %e, "Accept failed");
                std::thread::sleep(ACCEPT_RETRY_DELAY);
                continue;
            }
        }

        let span = info_span!(
            "connection",
            id = %ConnectionId::new(),
            socket = %path,
            peer_pid = ?conn.peer_pid(),
        );

        if socket.is_booster() {
            let launched = span.in_scope(|| launch(&mut conn, ctx.spawner.as_ref()));
            match launched {
                Ok(launched) => {
                    let pause = respawn_pause(launched.respawn_delay(), ctx.max_respawn_delay);
                    runtime.spawn_blocking(move || {
                        span.in_scope(|| report_outcome(finish(&mut conn, launched)))
                    });

                    if !pause.is_zero() {
                        info!(socket = %path, delay_ms = pause.as_millis() as u64, "Pausing before next launch");
                        std::thread::sleep(pause);
                    }
                }
                Err(e) => span.in_scope(|| e.report()),
            }
        } else {
            let spawner = ctx.spawner.clone();
            runtime.spawn_blocking(move || {
                span.in_scope(|| report_outcome(serve_connection(&mut conn, spawner.as_ref())))
            });
        }
    }

    info!(socket = %path, "Stopped accepting");
}

fn report_outcome(outcome: Result<Served, ServeError>) {
    match outcome {
        Ok(served) => debug!(
            pid = served.pid,
            wait_status = served.wait_status,
            delivered = served.status_delivered,
            "Connection done"
        ),
        Err(e) => e.report(),
    }
}
