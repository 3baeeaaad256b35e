//! Peer credential lookup and policy

use nix::sys::socket::{getsockopt, sockopt};
use std::fmt;
use std::io;
use std::os::fd::BorrowedFd;
use warmstart_api::PeerCredentials;

/// Read the peer's pid/uid/gid from a connected Unix socket (SO_PEERCRED)
pub fn peer_credentials(fd: BorrowedFd<'_>) -> io::Result<PeerCredentials> {
    let cred = getsockopt(&fd, sockopt::PeerCredentials)?;
    Ok(PeerCredentials {
        pid: u32::try_from(cred.pid()).unwrap_or(0),
        uid: cred.uid(),
        gid: cred.gid(),
    })
}

/// One acceptable identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialRequirement {
    Uid(u32),
    Gid(u32),
}

impl CredentialRequirement {
    pub fn is_satisfied_by(&self, peer: &PeerCredentials) -> bool {
        match self {
            CredentialRequirement::Uid(uid) => peer.uid == *uid,
            CredentialRequirement::Gid(gid) => peer.gid == *gid,
        }
    }
}

impl fmt::Display for CredentialRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialRequirement::Uid(uid) => write!(f, "uid {}", uid),
            CredentialRequirement::Gid(gid) => write!(f, "gid {}", gid),
        }
    }
}

/// Which peers may talk to a launcher socket
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CredentialPolicy {
    /// Every peer is accepted; credentials are still recorded when available
    #[default]
    Disabled,
    /// The peer must satisfy at least one requirement
    Require(Vec<CredentialRequirement>),
}

impl CredentialPolicy {
    /// Check a peer against the policy; `Err` carries the rejection reason
    pub fn check(&self, peer: Option<&PeerCredentials>) -> Result<(), String> {
        let requirements = match self {
            CredentialPolicy::Disabled => return Ok(()),
            CredentialPolicy::Require(requirements) => requirements,
        };

        let Some(peer) = peer else {
            return Err("peer credentials unavailable".into());
        };

        if requirements.iter().any(|r| r.is_satisfied_by(peer)) {
            Ok(())
        } else {
            Err(format!(
                "pid {} uid {} gid {} matches no allowed identity",
                peer.pid, peer.uid, peer.gid
            ))
        }
    }
}
