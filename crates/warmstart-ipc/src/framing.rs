//! Framing primitives
//!
//! Tags and integers are little-endian. A string is a `u32` byte length
//! followed by the bytes. These traits are the seam between the protocol
//! state machine and the bytes: `SocketTransport` implements them over a
//! real socket, `MemoryTransport` over canned buffers.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};
use warmstart_api::{IO_SLOT_COUNT, IoDescriptors, Tag};

use crate::ProtocolError;

/// Map a read error onto the protocol error space
pub(crate) fn read_error(err: io::Error) -> ProtocolError {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ProtocolError::TimedOut,
        io::ErrorKind::UnexpectedEof => ProtocolError::Truncated,
        _ => ProtocolError::Io(err),
    }
}

/// Receiving half of a transport
pub trait FrameReader {
    /// Read up to `buf.len()` bytes; `Ok(0)` means end of stream
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Receive the three I/O slots that follow an `Io` tag
    fn recv_descriptors(&mut self) -> Result<IoDescriptors, ProtocolError>;

    /// Fill `buf` completely.
    ///
    /// End of stream before the first byte is `ConnectionClosed` when
    /// `at_boundary` is set, `Truncated` otherwise.
    fn recv_exact(&mut self, buf: &mut [u8], at_boundary: bool) -> Result<(), ProtocolError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 && at_boundary => return Err(ProtocolError::ConnectionClosed),
                Ok(0) => return Err(ProtocolError::Truncated),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(read_error(e)),
            }
        }
        Ok(())
    }

    /// Read the raw tag of the next frame
    fn recv_tag(&mut self) -> Result<u32, ProtocolError> {
        let mut buf = [0u8; 4];
        self.recv_exact(&mut buf, true)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn recv_u32(&mut self) -> Result<u32, ProtocolError> {
        let mut buf = [0u8; 4];
        self.recv_exact(&mut buf, false)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn recv_i32(&mut self) -> Result<i32, ProtocolError> {
        let mut buf = [0u8; 4];
        self.recv_exact(&mut buf, false)?;
        Ok(i32::from_le_bytes(buf))
    }

    /// Read a length-prefixed string of at most `max_len` bytes.
    ///
    /// The length is checked before anything is allocated.
    fn recv_string(&mut self, max_len: u32) -> Result<Vec<u8>, ProtocolError> {
        let len = self.recv_u32()?;
        if len > max_len {
            return Err(ProtocolError::StringTooLong {
                len,
                limit: max_len,
            });
        }

        let mut buf = vec![0u8; len as usize];
        self.recv_exact(&mut buf, false)?;
        Ok(buf)
    }
}

/// Sending half of a transport
pub trait FrameWriter {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Send the three I/O slots that follow an `Io` tag
    fn send_descriptors(&mut self, fds: [BorrowedFd<'_>; IO_SLOT_COUNT]) -> io::Result<()>;

    fn send_tag(&mut self, tag: Tag) -> io::Result<()> {
        self.send_u32(tag.value())
    }

    fn send_u32(&mut self, value: u32) -> io::Result<()> {
        self.write_all(&value.to_le_bytes())
    }

    fn send_i32(&mut self, value: i32) -> io::Result<()> {
        self.write_all(&value.to_le_bytes())
    }

    fn send_string(&mut self, value: &[u8]) -> io::Result<()> {
        let len = u32::try_from(value.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "string too long"))?;
        self.send_u32(len)?;
        self.write_all(value)
    }
}

/// Byte buffers encode frames directly; used to build canned input
impl FrameWriter for Vec<u8> {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.extend_from_slice(buf);
        Ok(())
    }

    fn send_descriptors(&mut self, fds: [BorrowedFd<'_>; IO_SLOT_COUNT]) -> io::Result<()> {
        for fd in fds {
            self.send_i32(fd.as_raw_fd())?;
        }
        Ok(())
    }
}
