//! Transports: a real Unix stream socket and an in-memory double

use nix::sys::socket::{
    recvmsg, send, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags,
};
use std::io::{self, Cursor, IoSlice, IoSliceMut, Read};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};
use warmstart_api::{IO_SLOT_COUNT, IoDescriptors, PeerCredentials};

use crate::framing::read_error;
use crate::{FrameReader, FrameWriter, ProtocolError, peer_credentials};

/// Size of the slot-number payload that travels with the descriptors
const IO_PAYLOAD_LEN: usize = IO_SLOT_COUNT * 4;

/// A connected transport: framing in both directions plus peer identity
pub trait Transport: FrameReader + FrameWriter {
    /// Credentials of the process on the other end
    fn peer_credentials(&self) -> io::Result<PeerCredentials>;

    /// Fail every read after `deadline` with a timeout, however the bytes
    /// trickle in. `None` removes the deadline.
    fn set_deadline(&mut self, _deadline: Option<Instant>) {}
}

/// Transport over an accepted or connected Unix stream socket
#[derive(Debug)]
pub struct SocketTransport {
    stream: UnixStream,
    deadline: Option<Instant>,
    /// Per-read timeout to restore once the deadline is lifted
    read_timeout: Option<Duration>,
}

impl SocketTransport {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            deadline: None,
            read_timeout: None,
        }
    }

    /// Bound every blocking read; `None` waits forever
    pub fn set_receive_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.read_timeout = timeout;
        self.stream.set_read_timeout(timeout)
    }

    pub fn stream(&self) -> &UnixStream {
        &self.stream
    }

    /// Shrink the socket's read timeout to what is left before the deadline
    fn arm_deadline(&self) -> io::Result<()> {
        let Some(deadline) = self.deadline else {
            return Ok(());
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::ErrorKind::TimedOut.into());
        }
        let timeout = match self.read_timeout {
            Some(per_read) => per_read.min(remaining),
            None => remaining,
        };
        self.stream.set_read_timeout(Some(timeout))
    }
}

impl FrameReader for SocketTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.arm_deadline()?;
        self.stream.read(buf)
    }

    fn recv_descriptors(&mut self) -> Result<IoDescriptors, ProtocolError> {
        self.arm_deadline().map_err(read_error)?;

        let mut payload = [0u8; IO_PAYLOAD_LEN];
        let mut received: Vec<OwnedFd> = Vec::new();

        let bytes = {
            let mut iov = [IoSliceMut::new(&mut payload)];
            let mut cmsg_buf = nix::cmsg_space!([RawFd; IO_SLOT_COUNT]);

            let msg = loop {
                match recvmsg::<()>(
                    self.stream.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsg_buf),
                    MsgFlags::MSG_CMSG_CLOEXEC,
                ) {
                    Err(nix::errno::Errno::EINTR) => continue,
                    other => break other.map_err(|e| read_error(e.into()))?,
                }
            };

            for cmsg in msg.cmsgs().map_err(|e| read_error(e.into()))? {
                if let ControlMessageOwned::ScmRights(fds) = cmsg {
                    // SAFETY: the kernel just installed these descriptors in
                    // this process and nothing else refers to them
                    received.extend(fds.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
                }
            }

            if msg.flags.contains(MsgFlags::MSG_CTRUNC) {
                return Err(ProtocolError::BadDescriptors {
                    expected: IO_SLOT_COUNT,
                    received: received.len(),
                });
            }

            msg.bytes
        };

        if bytes == 0 {
            return Err(ProtocolError::Truncated);
        }
        if bytes < IO_PAYLOAD_LEN {
            self.recv_exact(&mut payload[bytes..], false)?;
        }

        let fds = match <[OwnedFd; IO_SLOT_COUNT]>::try_from(received) {
            Ok(fds) => fds,
            // Whatever did arrive is closed when the vector drops
            Err(received) => {
                return Err(ProtocolError::BadDescriptors {
                    expected: IO_SLOT_COUNT,
                    received: received.len(),
                });
            }
        };

        Ok(IoDescriptors::with_descriptors(slot_numbers(&payload), fds))
    }
}

impl FrameWriter for SocketTransport {
    fn write_all(&mut self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            // MSG_NOSIGNAL: a vanished peer must surface as EPIPE, not SIGPIPE
            match send(self.stream.as_raw_fd(), buf, MsgFlags::MSG_NOSIGNAL) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => buf = &buf[n..],
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn send_descriptors(&mut self, fds: [BorrowedFd<'_>; IO_SLOT_COUNT]) -> io::Result<()> {
        let raw = fds.map(|fd| fd.as_raw_fd());
        let mut payload = [0u8; IO_PAYLOAD_LEN];
        for (chunk, fd) in payload.chunks_exact_mut(4).zip(raw) {
            chunk.copy_from_slice(&fd.to_le_bytes());
        }

        let iov = [IoSlice::new(&payload)];
        let cmsg = [ControlMessage::ScmRights(&raw)];

        loop {
            match sendmsg::<()>(
                self.stream.as_raw_fd(),
                &iov,
                &cmsg,
                MsgFlags::MSG_NOSIGNAL,
                None,
            ) {
                Ok(n) if n == IO_PAYLOAD_LEN => return Ok(()),
                // The descriptors went with the first byte; finish the payload
                Ok(n) => return self.write_all(&payload[n..]),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Transport for SocketTransport {
    fn peer_credentials(&self) -> io::Result<PeerCredentials> {
        peer_credentials(self.stream.as_fd())
    }

    fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
        if deadline.is_none() {
            // Nothing to report here; a broken socket fails the next read
            let _ = self.stream.set_read_timeout(self.read_timeout);
        }
    }
}

fn slot_numbers(payload: &[u8; IO_PAYLOAD_LEN]) -> [i32; IO_SLOT_COUNT] {
    let mut numbers = [0i32; IO_SLOT_COUNT];
    for (n, chunk) in numbers.iter_mut().zip(payload.chunks_exact(4)) {
        *n = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    numbers
}

/// In-memory transport for driving a connection without a socket.
///
/// Reads consume a canned byte sequence; writes are captured. `Io` frames
/// carry slot numbers only, no descriptors change hands.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    input: Cursor<Vec<u8>>,
    output: Vec<u8>,
    peer_gone: bool,
    credentials: Option<PeerCredentials>,
}

impl MemoryTransport {
    pub fn new(input: Vec<u8>) -> Self {
        Self {
            input: Cursor::new(input),
            ..Self::default()
        }
    }

    /// Credentials reported as the peer's
    pub fn with_credentials(mut self, credentials: PeerCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Make every later write fail as if the peer had closed its end
    pub fn disconnect_peer(&mut self) {
        self.peer_gone = true;
    }

    /// Everything written so far
    pub fn output(&self) -> &[u8] {
        &self.output
    }
}

impl FrameReader for MemoryTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.input.read(buf)
    }

    fn recv_descriptors(&mut self) -> Result<IoDescriptors, ProtocolError> {
        let mut numbers = [0i32; IO_SLOT_COUNT];
        for n in &mut numbers {
            *n = self.recv_i32()?;
        }
        Ok(IoDescriptors::from_numbers(numbers))
    }
}

impl FrameWriter for MemoryTransport {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        if self.peer_gone {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        self.output.extend_from_slice(buf);
        Ok(())
    }

    fn send_descriptors(&mut self, fds: [BorrowedFd<'_>; IO_SLOT_COUNT]) -> io::Result<()> {
        self.output.send_descriptors(fds)
    }
}

impl Transport for MemoryTransport {
    fn peer_credentials(&self) -> io::Result<PeerCredentials> {
        self.credentials
            .ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "no peer credentials"))
    }
}
