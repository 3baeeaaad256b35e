//! Mock spawner for testing

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use warmstart_api::{IO_SLOT_COUNT, LaunchRequest};

use crate::{SpawnError, SpawnResult, SpawnedChild, Spawner};

/// What the mock was asked to launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRecord {
    pub pid: u32,
    pub app_name: Option<String>,
    pub exec: PathBuf,
    pub args: Vec<OsString>,
    pub env: Vec<OsString>,
    pub io: [i32; IO_SLOT_COUNT],
    pub uid: u32,
    pub gid: u32,
    pub priority: i32,
    pub detached: bool,
}

/// Spawner that records requests instead of creating processes
pub struct MockSpawner {
    next_pid: AtomicU32,
    launched: Arc<Mutex<Vec<LaunchRecord>>>,
    reaped: Arc<Mutex<Vec<u32>>>,

    /// Configure spawn to fail
    pub fail_spawn: Arc<Mutex<bool>>,

    /// Raw wait status every child reports
    pub wait_status: Arc<Mutex<i32>>,

    /// How long `wait` blocks before returning
    pub exit_delay: Arc<Mutex<Option<Duration>>>,
}

impl MockSpawner {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(1000),
            launched: Arc::new(Mutex::new(Vec::new())),
            reaped: Arc::new(Mutex::new(Vec::new())),
            fail_spawn: Arc::new(Mutex::new(false)),
            wait_status: Arc::new(Mutex::new(0)),
            exit_delay: Arc::new(Mutex::new(None)),
        }
    }

    /// Every request launched so far
    pub fn launched(&self) -> Vec<LaunchRecord> {
        self.launched.lock().unwrap().clone()
    }

    /// Pids whose `wait` has returned
    pub fn reaped(&self) -> Vec<u32> {
        self.reaped.lock().unwrap().clone()
    }

    pub fn set_wait_status(&self, status: i32) {
        *self.wait_status.lock().unwrap() = status;
    }
}

impl Default for MockSpawner {
    fn default() -> Self {
        Self::new()
    }
}

impl Spawner for MockSpawner {
    fn spawn(&self, request: LaunchRequest) -> SpawnResult<Box<dyn SpawnedChild>> {
        if *self.fail_spawn.lock().unwrap() {
            return Err(SpawnError::Failed("Mock spawn failure".into()));
        }

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let detached = request.is_detached();

        self.launched.lock().unwrap().push(LaunchRecord {
            pid,
            app_name: request.app_name,
            exec: request.exec,
            args: request.args,
            env: request.env,
            io: request.io.numbers(),
            uid: request.uid,
            gid: request.gid,
            priority: request.priority,
            detached,
        });

        Ok(Box::new(MockChild {
            pid,
            status: *self.wait_status.lock().unwrap(),
            delay: *self.exit_delay.lock().unwrap(),
            reaped: self.reaped.clone(),
        }))
    }
}

struct MockChild {
    pid: u32,
    status: i32,
    delay: Option<Duration>,
    reaped: Arc<Mutex<Vec<u32>>>,
}

impl SpawnedChild for MockChild {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn wait(&mut self) -> SpawnResult<i32> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.reaped.lock().unwrap().push(self.pid);
        Ok(self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warmstart_api::{IoDescriptors, OptionFlags};

    fn request() -> LaunchRequest {
        LaunchRequest {
            app_name: Some("app".into()),
            exec: PathBuf::from("/usr/bin/app"),
            args: vec!["app".into()],
            env: vec![],
            io: IoDescriptors::default(),
            uid: 1000,
            gid: 100,
            priority: 0,
            respawn_delay: 0,
            options: OptionFlags::DETACH,
            credentials: None,
        }
    }

    #[test]
    fn mock_records_and_reaps() {
        let spawner = MockSpawner::new();
        spawner.set_wait_status(7 << 8);

        let mut child = spawner.spawn(request()).unwrap();
        assert_eq!(child.pid(), 1000);
        assert_eq!(child.wait().unwrap(), 7 << 8);

        let launched = spawner.launched();
        assert_eq!(launched.len(), 1);
        assert_eq!(launched[0].io, [0, 1, 2]);
        assert!(launched[0].detached);
        assert_eq!(spawner.reaped(), vec![1000]);
    }

    #[test]
    fn mock_spawn_failure() {
        let spawner = MockSpawner::new();
        *spawner.fail_spawn.lock().unwrap() = true;

        assert!(spawner.spawn(request()).is_err());
        assert!(spawner.launched().is_empty());
    }
}
