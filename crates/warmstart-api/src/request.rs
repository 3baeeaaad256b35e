//! Request record and launch description

use std::ffi::{OsStr, OsString};
use std::os::fd::OwnedFd;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::time::Duration;

use crate::OptionFlags;

/// Number of I/O slots carried by a request (stdin, stdout, stderr)
pub const IO_SLOT_COUNT: usize = 3;

/// Credentials of the connected peer as reported by the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,
}

/// One standard I/O slot of the launched process
#[derive(Debug)]
pub struct IoSlot {
    number: i32,
    fd: Option<OwnedFd>,
}

impl IoSlot {
    pub fn new(number: i32, fd: Option<OwnedFd>) -> Self {
        Self { number, fd }
    }

    pub fn into_fd(self) -> Option<OwnedFd> {
        self.fd
    }
}

/// The stdin/stdout/stderr triple
#[derive(Debug)]
pub struct IoDescriptors {
    slots: [IoSlot; IO_SLOT_COUNT],
}

impl IoDescriptors {
    /// Slots identified by number only, nothing transferred
    pub fn from_numbers(numbers: [i32; IO_SLOT_COUNT]) -> Self {
        Self {
            slots: numbers.map(|n| IoSlot::new(n, None)),
        }
    }

    /// Slots backed by descriptors received over the socket
    pub fn with_descriptors(numbers: [i32; IO_SLOT_COUNT], fds: [OwnedFd; IO_SLOT_COUNT]) -> Self {
        let [n0, n1, n2] = numbers;
        let [f0, f1, f2] = fds;
        Self {
            slots: [
                IoSlot::new(n0, Some(f0)),
                IoSlot::new(n1, Some(f1)),
                IoSlot::new(n2, Some(f2)),
            ],
        }
    }

    pub fn numbers(&self) -> [i32; IO_SLOT_COUNT] {
        [
            self.slots[0].number,
            self.slots[1].number,
            self.slots[2].number,
        ]
    }

    /// True when every slot carries a transferred descriptor
    pub fn has_descriptors(&self) -> bool {
        self.slots.iter().all(|s| s.fd.is_some())
    }

    pub fn into_slots(self) -> [IoSlot; IO_SLOT_COUNT] {
        self.slots
    }
}

impl Default for IoDescriptors {
    fn default() -> Self {
        Self::from_numbers([0, 1, 2])
    }
}

/// A fully received launch request, handed to the spawner
#[derive(Debug)]
pub struct LaunchRequest {
    /// Application name, used by boosters to pick what to run
    pub app_name: Option<String>,
    pub exec: PathBuf,
    pub args: Vec<OsString>,
    /// `KEY=VALUE` entries
    pub env: Vec<OsString>,
    pub io: IoDescriptors,
    pub uid: u32,
    pub gid: u32,
    /// Scheduling priority (nice value); range is checked by the spawner
    pub priority: i32,
    /// Booster respawn delay in seconds
    pub respawn_delay: u32,
    pub options: OptionFlags,
    /// Peer credentials captured at accept time
    pub credentials: Option<PeerCredentials>,
}

impl LaunchRequest {
    pub fn respawn_delay(&self) -> Duration {
        Duration::from_secs(u64::from(self.respawn_delay))
    }

    pub fn is_detached(&self) -> bool {
        self.options.contains(OptionFlags::DETACH)
    }

    /// Environment split at the first `=`; entries without one are skipped
    pub fn env_pairs(&self) -> impl Iterator<Item = (&OsStr, &OsStr)> {
        self.env.iter().filter_map(|entry| {
            let bytes = entry.as_bytes();
            let eq = bytes.iter().position(|b| *b == b'=')?;
            Some((
                OsStr::from_bytes(&bytes[..eq]),
                OsStr::from_bytes(&bytes[eq + 1..]),
            ))
        })
    }
}

/// What an invoker asks the daemon to launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub app_name: Option<String>,
    pub exec: PathBuf,
    pub args: Vec<OsString>,
    pub env: Vec<OsString>,
    pub uid: u32,
    pub gid: u32,
    pub priority: i32,
    pub respawn_delay: u32,
    pub detach: bool,
}

impl Invocation {
    pub fn new(exec: impl Into<PathBuf>, uid: u32, gid: u32) -> Self {
        Self {
            app_name: None,
            exec: exec.into(),
            args: Vec::new(),
            env: Vec::new(),
            uid,
            gid,
            priority: 0,
            respawn_delay: 0,
            detach: false,
        }
    }

    pub fn with_app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = Some(name.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env<I, S>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.env = env.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_respawn_delay(mut self, seconds: u32) -> Self {
        self.respawn_delay = seconds;
        self
    }

    pub fn detached(mut self, detach: bool) -> Self {
        self.detach = detach;
        self
    }

    pub fn options(&self) -> OptionFlags {
        if self.detach {
            OptionFlags::DETACH
        } else {
            OptionFlags::empty()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with_env(env: &[&str]) -> LaunchRequest {
        LaunchRequest {
            app_name: None,
            exec: PathBuf::from("/bin/true"),
            args: vec![],
            env: env.iter().map(OsString::from).collect(),
            io: IoDescriptors::default(),
            uid: 1000,
            gid: 1000,
            priority: 0,
            respawn_delay: 3,
            options: OptionFlags::empty(),
            credentials: None,
        }
    }

    #[test]
    fn env_pairs_split_at_first_equals() {
        let request = request_with_env(&["PATH=/usr/bin", "EMPTY=", "A=b=c", "NOEQUALS"]);
        let pairs: Vec<_> = request.env_pairs().collect();

        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0], (OsStr::new("PATH"), OsStr::new("/usr/bin")));
        assert_eq!(pairs[1], (OsStr::new("EMPTY"), OsStr::new("")));
        assert_eq!(pairs[2], (OsStr::new("A"), OsStr::new("b=c")));
    }

    #[test]
    fn default_io_slots_are_standard_numbers() {
        let io = IoDescriptors::default();
        assert_eq!(io.numbers(), [0, 1, 2]);
        assert!(!io.has_descriptors());
        assert!(io.into_slots().into_iter().all(|slot| slot.into_fd().is_none()));
    }

    #[test]
    fn request_helpers() {
        let mut request = request_with_env(&[]);
        assert_eq!(request.respawn_delay(), Duration::from_secs(3));
        assert!(!request.is_detached());

        request.options = OptionFlags::DETACH;
        assert!(request.is_detached());
    }

    #[test]
    fn invocation_builder() {
        let inv = Invocation::new("/usr/bin/app", 1000, 100)
            .with_app_name("app")
            .with_args(["/usr/bin/app", "--flag"])
            .with_env(["HOME=/home/user"])
            .with_priority(-5)
            .with_respawn_delay(2)
            .detached(true);

        assert_eq!(inv.args.len(), 2);
        assert_eq!(inv.env, vec![OsString::from("HOME=/home/user")]);
        assert_eq!(inv.priority, -5);
        assert_eq!(inv.options(), OptionFlags::DETACH);
        assert_eq!(Invocation::new("/x", 0, 0).options(), OptionFlags::empty());
    }
}
