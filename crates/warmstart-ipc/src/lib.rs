//! IPC layer for warmstartd
//!
//! Provides:
//! - Framing primitives over a pluggable transport (real socket or memory)
//! - The socket registry holding every listening socket of the daemon
//! - Peer credential checks
//! - The per-connection protocol state machine
//! - The invoker-side client

mod client;
mod connection;
mod credentials;
mod framing;
mod registry;
mod transport;

pub use client::*;
pub use connection::*;
pub use credentials::*;
pub use framing::*;
pub use registry::*;
pub use transport::*;

use std::io;
use std::path::PathBuf;
use thiserror::Error;
use warmstart_api::Tag;

/// Structural problems with what the peer sent
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Truncated frame")]
    Truncated,

    #[error("Receive timed out")]
    TimedOut,

    #[error("Unknown tag {0:#010x}")]
    UnknownTag(u32),

    #[error("Unexpected {0} frame")]
    UnexpectedTag(Tag),

    #[error("{0} sent more than once")]
    DuplicateField(Tag),

    #[error("Request ended without {0}")]
    MissingField(Tag),

    #[error("{0} is empty")]
    EmptyField(Tag),

    #[error("{field} count {count} exceeds limit {limit}")]
    CountTooLarge { field: Tag, count: u32, limit: u32 },

    #[error("String length {len} exceeds limit {limit}")]
    StringTooLong { len: u32, limit: u32 },

    #[error("Request strings exceed {limit} bytes in total")]
    RequestTooLarge { limit: u32 },

    #[error("String contains a NUL byte")]
    InteriorNul,

    #[error("String is not valid UTF-8")]
    InvalidUtf8,

    #[error("Unknown option bits {0:#x}")]
    UnknownOptions(u32),

    #[error("Expected {expected} descriptors, received {received}")]
    BadDescriptors { expected: usize, received: usize },

    #[error("Read failed: {0}")]
    Io(#[source] io::Error),
}

/// Coarse classification used by the daemon to decide what to do with an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or hostile peer input; drop the connection
    Protocol,
    /// Socket syscall failure; fatal at startup, recoverable per connection
    Resource,
    /// Peer failed the credential policy
    Security,
    /// Pid or exit status could not be delivered
    Send,
    /// Misuse of the API by the daemon itself
    Usage,
}

/// IPC errors
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Socket {path:?}: {source}")]
    Socket {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Socket {0:?} is already initialized")]
    AlreadyInitialized(PathBuf),

    #[error("Accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("Peer rejected: {0}")]
    Security(String),

    #[error("Failed to send {what}: {source}")]
    Send {
        what: Tag,
        #[source]
        source: io::Error,
    },

    #[error("Socket {0:?} was never initialized")]
    NotInitialized(PathBuf),

    #[error("Exit status was not requested by the invoker")]
    ExitStatusNotExpected,

    #[error("{0} already sent")]
    AlreadySent(Tag),

    #[error("Connection is {0}")]
    InvalidState(ConnectionState),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl IpcError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IpcError::Protocol(_) => ErrorKind::Protocol,
            IpcError::Socket { .. }
            | IpcError::AlreadyInitialized(_)
            | IpcError::Accept(_)
            | IpcError::Io(_) => ErrorKind::Resource,
            IpcError::Security(_) => ErrorKind::Security,
            IpcError::Send { .. } => ErrorKind::Send,
            IpcError::NotInitialized(_)
            | IpcError::ExitStatusNotExpected
            | IpcError::AlreadySent(_)
            | IpcError::InvalidState(_) => ErrorKind::Usage,
        }
    }
}

pub type IpcResult<T> = Result<T, IpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_classify_into_kinds() {
        assert_eq!(
            IpcError::from(ProtocolError::Truncated).kind(),
            ErrorKind::Protocol
        );
        assert_eq!(
            IpcError::Security("uid 1000".into()).kind(),
            ErrorKind::Security
        );
        assert_eq!(
            IpcError::Send {
                what: Tag::Pid,
                source: io::ErrorKind::BrokenPipe.into(),
            }
            .kind(),
            ErrorKind::Send
        );
        assert_eq!(
            IpcError::NotInitialized(PathBuf::from("/run/x.sock")).kind(),
            ErrorKind::Usage
        );
        assert_eq!(
            IpcError::Accept(io::ErrorKind::Other.into()).kind(),
            ErrorKind::Resource
        );
    }

    #[test]
    fn unknown_tag_message_is_hex() {
        let msg = ProtocolError::UnknownTag(0x1234).to_string();
        assert!(msg.contains("0x00001234"));
    }
}
