//! Registry of listening sockets
//!
//! Built once at daemon startup, torn down at shutdown. Every connection
//! looks up its listening socket here by path.

use nix::sys::socket::{shutdown, Shutdown};
use std::collections::HashMap;
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use crate::{IpcError, IpcResult};

/// Default mode for socket files: any local user may connect
pub const DEFAULT_SOCKET_MODE: u32 = 0o666;

/// Process-wide map from socket path to listening socket
#[derive(Debug, Default)]
pub struct SocketRegistry {
    sockets: Mutex<HashMap<PathBuf, Arc<UnixListener>>>,
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, Arc<UnixListener>>> {
        self.sockets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create, bind and listen on a socket at `path` and register it.
    ///
    /// A stale socket file left by a previous run is removed first.
    pub fn init(&self, path: impl AsRef<Path>, mode: u32) -> IpcResult<()> {
        let path = path.as_ref();
        let mut sockets = self.lock();

        if sockets.contains_key(path) {
            return Err(IpcError::AlreadyInitialized(path.to_path_buf()));
        }

        let socket_err = |source| IpcError::Socket {
            path: path.to_path_buf(),
            source,
        };

        if let Ok(meta) = std::fs::symlink_metadata(path)
            && meta.file_type().is_socket()
        {
            debug!(path = %path.display(), "Removing stale socket");
            std::fs::remove_file(path).map_err(socket_err)?;
        }

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(socket_err)?;
        }

        let listener = UnixListener::bind(path).map_err(socket_err)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .map_err(socket_err)?;

        info!(path = %path.display(), mode = %format!("{:o}", mode), "Socket listening");

        sockets.insert(path.to_path_buf(), Arc::new(listener));
        Ok(())
    }

    /// Look up the listening socket for `path`
    pub fn find(&self, path: impl AsRef<Path>) -> IpcResult<Arc<UnixListener>> {
        let path = path.as_ref();
        self.lock()
            .get(path)
            .cloned()
            .ok_or_else(|| IpcError::NotInitialized(path.to_path_buf()))
    }

    /// Close every registered socket and forget it
    pub fn close_all(&self) {
        let drained: Vec<_> = self.lock().drain().collect();

        for (path, listener) in drained {
            // Wakes any worker blocked in accept on this socket
            if let Err(e) = shutdown(listener.as_raw_fd(), Shutdown::Both) {
                debug!(path = %path.display(), error = %e, "Socket shutdown failed");
            }

            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "Failed to remove socket file");
            }

            info!(path = %path.display(), "Socket closed");
        }
    }

    /// Registered socket paths
    pub fn ids(&self) -> Vec<PathBuf> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Drop for SocketRegistry {
    fn drop(&mut self) {
        self.close_all();
    }
}
