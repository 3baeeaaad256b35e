//! Turning a launch request into a running child process

use nix::errno::Errno;
use nix::unistd::{getegid, geteuid};
use std::io;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::ptr;
use thiserror::Error;
use tracing::debug;
use warmstart_api::{IoSlot, LaunchRequest};

/// Nice values accepted from invokers
pub const PRIORITY_RANGE: std::ops::RangeInclusive<i32> = -20..=19;

/// Errors from spawning or waiting on a child
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("Failed to launch {exec:?}: {source}")]
    Launch {
        exec: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot run as uid {uid} gid {gid}: daemon runs as uid {daemon_uid} gid {daemon_gid} without root")]
    IdentityNotPermitted {
        uid: u32,
        gid: u32,
        daemon_uid: u32,
        daemon_gid: u32,
    },

    #[error("Priority {0} is outside -20..=19")]
    InvalidPriority(i32),

    #[error("Waiting for pid {pid} failed: {source}")]
    Wait {
        pid: u32,
        #[source]
        source: io::Error,
    },

    #[error("Spawn failed: {0}")]
    Failed(String),
}

pub type SpawnResult<T> = Result<T, SpawnError>;

/// A launched process the daemon is responsible for reaping
pub trait SpawnedChild: Send {
    fn pid(&self) -> u32;

    /// Block until the process exits and return its raw wait status
    fn wait(&mut self) -> SpawnResult<i32>;
}

/// Process creation boundary.
///
/// The daemon only ever talks to this trait so the connection handling can
/// be exercised with `MockSpawner`.
pub trait Spawner: Send + Sync {
    /// Start `request`. Ownership of its I/O descriptors passes to the child.
    fn spawn(&self, request: LaunchRequest) -> SpawnResult<Box<dyn SpawnedChild>>;
}

/// Spawns requests with `std::process::Command`
#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxSpawner;

impl LinuxSpawner {
    pub fn new() -> Self {
        Self
    }
}

impl Spawner for LinuxSpawner {
    fn spawn(&self, request: LaunchRequest) -> SpawnResult<Box<dyn SpawnedChild>> {
        if !PRIORITY_RANGE.contains(&request.priority) {
            return Err(SpawnError::InvalidPriority(request.priority));
        }

        let mut cmd = Command::new(&request.exec);

        // argv[0] comes from the invoker, which may differ from the path
        if let Some((arg0, rest)) = request.args.split_first() {
            cmd.arg0(arg0);
            cmd.args(rest);
        }

        cmd.env_clear();
        cmd.envs(request.env_pairs());

        let switch = identity_switch(request.uid, request.gid)?;
        let priority = request.priority;
        if priority != 0 || switch.is_some() {
            // SAFETY: prepare_child only makes async-signal-safe libc calls
            // that affect the child being set up
            unsafe {
                cmd.pre_exec(move || prepare_child(priority, switch));
            }
        }

        let exec = request.exec;
        let [stdin, stdout, stderr] = request.io.into_slots();
        cmd.stdin(slot_stdio(stdin));
        cmd.stdout(slot_stdio(stdout));
        cmd.stderr(slot_stdio(stderr));

        let child = cmd
            .spawn()
            .map_err(|source| SpawnError::Launch {
                exec: exec.clone(),
                source,
            })?;

        let pid = child.id();
        debug!(pid = pid, exec = %exec.display(), priority = priority, "Process spawned");

        Ok(Box::new(LinuxChild { child, pid }))
    }
}

/// Ids the child must switch to. Only root can switch; otherwise the request
/// must ask for the daemon's own ids and no switch happens.
fn identity_switch(uid: u32, gid: u32) -> SpawnResult<Option<(u32, u32)>> {
    let (daemon_uid, daemon_gid) = (geteuid(), getegid());

    if daemon_uid.is_root() {
        return Ok(Some((uid, gid)));
    }

    if uid != daemon_uid.as_raw() || gid != daemon_gid.as_raw() {
        return Err(SpawnError::IdentityNotPermitted {
            uid,
            gid,
            daemon_uid: daemon_uid.as_raw(),
            daemon_gid: daemon_gid.as_raw(),
        });
    }

    Ok(None)
}

/// Runs in the forked child before exec.
///
/// The priority is set before the ids switch, and only when it lowers the
/// current one. Then supplementary groups, gid and uid are switched in that
/// order.
fn prepare_child(priority: i32, switch: Option<(u32, u32)>) -> io::Result<()> {
    if priority != 0 {
        // getpriority can legitimately return -1, so errno decides
        Errno::clear();
        // SAFETY: plain syscall on the calling process
        let current = unsafe { libc::getpriority(libc::PRIO_PROCESS, 0) };
        if current == -1 && Errno::last_raw() != 0 {
            return Err(io::Error::last_os_error());
        }
        if current < priority {
            // SAFETY: as above
            if unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, priority) } == -1 {
                return Err(io::Error::last_os_error());
            }
        }
    }

    if let Some((uid, gid)) = switch {
        // SAFETY: plain syscalls on the calling process; a null list with a
        // zero count clears the supplementary groups
        unsafe {
            if libc::setgroups(0, ptr::null()) == -1
                || libc::setgid(gid) == -1
                || libc::setuid(uid) == -1
            {
                return Err(io::Error::last_os_error());
            }
        }
    }

    Ok(())
}

/// Slots that arrived without a descriptor read from and write to /dev/null
fn slot_stdio(slot: IoSlot) -> Stdio {
    slot.into_fd().map(Stdio::from).unwrap_or_else(Stdio::null)
}

struct LinuxChild {
    child: Child,
    pid: u32,
}

impl SpawnedChild for LinuxChild {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn wait(&mut self) -> SpawnResult<i32> {
        self.child
            .wait()
            .map(|status| status.into_raw())
            .map_err(|source| SpawnError::Wait {
                pid: self.pid,
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;
    use std::io::{Read, Seek, SeekFrom};
    use std::os::fd::OwnedFd;
    use std::process::ExitStatus;
    use warmstart_api::{IoDescriptors, OptionFlags};

    fn request(args: &[&str], env: &[&str]) -> LaunchRequest {
        LaunchRequest {
            app_name: None,
            exec: PathBuf::from("/bin/sh"),
            args: args.iter().map(OsString::from).collect(),
            env: env.iter().map(OsString::from).collect(),
            io: IoDescriptors::default(),
            uid: geteuid().as_raw(),
            gid: getegid().as_raw(),
            priority: 0,
            respawn_delay: 0,
            options: OptionFlags::empty(),
            credentials: None,
        }
    }

    fn exit_code(status: i32) -> Option<i32> {
        ExitStatus::from_raw(status).code()
    }

    #[test]
    fn exit_code_is_reported() {
        let mut child = LinuxSpawner::new()
            .spawn(request(&["sh", "-c", "exit 3"], &[]))
            .unwrap();
        assert!(child.pid() > 0);
        assert_eq!(exit_code(child.wait().unwrap()), Some(3));
    }

    #[test]
    fn environment_is_exactly_the_requested_one() {
        let script = r#"[ "$GREETING" = hello ] && [ -z "$HOME" ]"#;
        let mut child = LinuxSpawner::new()
            .spawn(request(&["sh", "-c", script], &["GREETING=hello"]))
            .unwrap();
        assert_eq!(exit_code(child.wait().unwrap()), Some(0));
    }

    #[test]
    fn passed_descriptors_become_stdio() {
        let file = tempfile::tempfile().unwrap();
        let fds: [OwnedFd; 3] = [
            file.try_clone().unwrap().into(),
            file.try_clone().unwrap().into(),
            file.try_clone().unwrap().into(),
        ];

        let mut req = request(&["sh", "-c", "echo launched"], &[]);
        req.io = IoDescriptors::with_descriptors([0, 1, 2], fds);

        let mut child = LinuxSpawner::new().spawn(req).unwrap();
        assert_eq!(exit_code(child.wait().unwrap()), Some(0));

        let mut file = file;
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut out = String::new();
        file.read_to_string(&mut out).unwrap();
        assert_eq!(out, "launched\n");
    }

    fn nice_value_of_child(priority: i32) -> i32 {
        let file = tempfile::tempfile().unwrap();
        let fds: [OwnedFd; 3] = [
            file.try_clone().unwrap().into(),
            file.try_clone().unwrap().into(),
            file.try_clone().unwrap().into(),
        ];

        // Field 19 of /proc/<pid>/stat is the nice value
        let script = r#"read -r stat < /proc/$$/stat; set -- $stat; echo "${19}""#;
        let mut req = request(&["sh", "-c", script], &[]);
        req.io = IoDescriptors::with_descriptors([0, 1, 2], fds);
        req.priority = priority;

        let mut child = LinuxSpawner::new().spawn(req).unwrap();
        assert_eq!(exit_code(child.wait().unwrap()), Some(0));

        let mut file = file;
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut out = String::new();
        file.read_to_string(&mut out).unwrap();
        out.trim().parse().unwrap()
    }

    fn own_nice_value() -> i32 {
        unsafe { libc::getpriority(libc::PRIO_PROCESS, 0) }
    }

    #[test]
    fn lower_priority_is_applied() {
        assert_eq!(nice_value_of_child(5), own_nice_value().max(5));
    }

    #[test]
    fn higher_priority_is_left_alone() {
        assert_eq!(nice_value_of_child(-5), own_nice_value());
    }

    #[test]
    fn priority_is_applied_before_dropping_to_another_user() {
        if !geteuid().is_root() {
            return;
        }

        let script = r#"while read -r key uid rest; do
            [ "$key" = Uid: ] && [ "$uid" = 65534 ] && exit 0
        done < /proc/$$/status
        exit 1"#;
        let mut req = request(&["sh", "-c", script], &[]);
        req.uid = 65534;
        req.gid = 65534;
        req.priority = -5;

        let mut child = LinuxSpawner::new().spawn(req).unwrap();
        assert_eq!(exit_code(child.wait().unwrap()), Some(0));

        let mut req = request(&["sh", "-c", "exit 0"], &[]);
        req.uid = 65534;
        req.gid = 65534;
        req.priority = 7;
        let mut child = LinuxSpawner::new().spawn(req).unwrap();
        assert_eq!(exit_code(child.wait().unwrap()), Some(0));
    }

    #[test]
    fn out_of_range_priority_is_rejected() {
        let mut req = request(&["sh"], &[]);
        req.priority = 40;
        assert!(matches!(
            LinuxSpawner::new().spawn(req),
            Err(SpawnError::InvalidPriority(40))
        ));
    }

    #[test]
    fn missing_executable_is_a_launch_error() {
        let mut req = request(&["nothing"], &[]);
        req.exec = PathBuf::from("/nonexistent/warmstart-test-binary");
        assert!(matches!(
            LinuxSpawner::new().spawn(req),
            Err(SpawnError::Launch { .. })
        ));
    }

    #[test]
    fn foreign_identity_needs_root() {
        if geteuid().is_root() {
            return;
        }
        let mut req = request(&["sh"], &[]);
        req.uid = geteuid().as_raw() + 1;
        assert!(matches!(
            LinuxSpawner::new().spawn(req),
            Err(SpawnError::IdentityNotPermitted { .. })
        ));
    }
}
