//! Invoker-side client

use std::io;
use std::os::fd::BorrowedFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;
use warmstart_api::{IO_SLOT_COUNT, Invocation, Tag};

use crate::{FrameReader, FrameWriter, IpcResult, ProtocolError, SocketTransport};

/// Write every frame of `invocation`, followed by `End`.
///
/// `stdio` are the descriptors the launched process should use as its
/// stdin, stdout and stderr.
pub fn encode_invocation<W: FrameWriter + ?Sized>(
    writer: &mut W,
    invocation: &Invocation,
    stdio: [BorrowedFd<'_>; IO_SLOT_COUNT],
) -> io::Result<()> {
    writer.send_tag(Tag::Options)?;
    writer.send_u32(invocation.options().bits())?;

    if let Some(name) = &invocation.app_name {
        writer.send_tag(Tag::AppName)?;
        writer.send_string(name.as_bytes())?;
    }

    writer.send_tag(Tag::Exec)?;
    writer.send_string(invocation.exec.as_os_str().as_bytes())?;

    writer.send_tag(Tag::Args)?;
    writer.send_u32(list_len(&invocation.args)?)?;
    for arg in &invocation.args {
        writer.send_string(arg.as_bytes())?;
    }

    writer.send_tag(Tag::Env)?;
    writer.send_u32(list_len(&invocation.env)?)?;
    for var in &invocation.env {
        writer.send_string(var.as_bytes())?;
    }

    writer.send_tag(Tag::Io)?;
    writer.send_descriptors(stdio)?;

    writer.send_tag(Tag::Ids)?;
    writer.send_u32(invocation.uid)?;
    writer.send_u32(invocation.gid)?;

    writer.send_tag(Tag::Priority)?;
    writer.send_i32(invocation.priority)?;

    writer.send_tag(Tag::Delay)?;
    writer.send_u32(invocation.respawn_delay)?;

    writer.send_tag(Tag::End)
}

fn list_len<T>(list: &[T]) -> io::Result<u32> {
    u32::try_from(list.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "too many entries"))
}

/// Connection from an invoker to a launcher socket
#[derive(Debug)]
pub struct InvokerClient {
    transport: SocketTransport,
}

impl InvokerClient {
    /// Connect to the launcher listening at `socket_path`
    pub fn connect(socket_path: impl AsRef<Path>) -> IpcResult<Self> {
        let stream = UnixStream::connect(socket_path)?;
        Ok(Self {
            transport: SocketTransport::new(stream),
        })
    }

    /// Bound how long `recv_pid`/`recv_exit_status` block
    pub fn set_receive_timeout(&mut self, timeout: Option<Duration>) -> IpcResult<()> {
        self.transport.set_receive_timeout(timeout)?;
        Ok(())
    }

    /// Send a launch request
    pub fn send(
        &mut self,
        invocation: &Invocation,
        stdio: [BorrowedFd<'_>; IO_SLOT_COUNT],
    ) -> IpcResult<()> {
        encode_invocation(&mut self.transport, invocation, stdio)?;
        Ok(())
    }

    /// Wait for the pid of the launched process
    pub fn recv_pid(&mut self) -> IpcResult<u32> {
        self.expect_tag(Tag::Pid)?;
        Ok(self.transport.recv_u32()?)
    }

    /// Wait for the wait status of the launched process
    pub fn recv_exit_status(&mut self) -> IpcResult<i32> {
        self.expect_tag(Tag::ExitStatus)?;
        Ok(self.transport.recv_i32()?)
    }

    fn expect_tag(&mut self, expected: Tag) -> Result<(), ProtocolError> {
        let raw = self.transport.recv_tag()?;
        match Tag::from_u32(raw) {
            Some(tag) if tag == expected => Ok(()),
            Some(tag) => Err(ProtocolError::UnexpectedTag(tag)),
            None => Err(ProtocolError::UnknownTag(raw)),
        }
    }
}
