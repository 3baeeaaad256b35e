//! One invoker connection and the launch protocol state machine

use std::ffi::OsString;
use std::fmt;
use std::os::unix::ffi::OsStringExt;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use warmstart_api::{
    IoDescriptors, LaunchRequest, OptionFlags, PeerCredentials, ProtocolLimits, Tag,
};

use crate::{
    CredentialPolicy, FrameReader, IpcError, IpcResult, ProtocolError, SocketRegistry,
    SocketTransport, Transport,
};

/// Where a connection is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not yet accepted
    Idle,
    /// Peer accepted and admitted by the credential policy
    Accepted,
    /// Request frames are being read
    Receiving,
    /// A full request was received; responses may be sent
    Completed,
    /// The request was rejected and the socket released
    Aborted,
    /// Closed explicitly
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Accepted => "accepted",
            ConnectionState::Receiving => "receiving",
            ConnectionState::Completed => "completed",
            ConnectionState::Aborted => "aborted",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Per-connection settings
#[derive(Debug, Clone, Default)]
pub struct ConnectionOptions {
    pub limits: ProtocolLimits,
    /// Bounds every blocking read on a real socket, and the whole request
    pub receive_timeout: Option<Duration>,
    pub credential_policy: CredentialPolicy,
}

/// An accepted invoker connection.
///
/// Generic over the transport so the whole protocol can be driven from a
/// `MemoryTransport` without touching a socket.
pub struct Connection<T = SocketTransport> {
    socket_id: PathBuf,
    options: ConnectionOptions,
    transport: Option<T>,
    state: ConnectionState,
    peer: Option<PeerCredentials>,
    exit_status_expected: bool,
    pid_sent: bool,
}

impl Connection<SocketTransport> {
    /// Create an idle connection for the socket registered under `socket_id`
    pub fn new(socket_id: impl Into<PathBuf>, options: ConnectionOptions) -> Self {
        Self {
            socket_id: socket_id.into(),
            options,
            transport: None,
            state: ConnectionState::Idle,
            peer: None,
            exit_status_expected: false,
            pid_sent: false,
        }
    }

    /// Block until an invoker connects, then apply the credential policy.
    ///
    /// A rejected peer is disconnected and reported as `IpcError::Security`.
    pub fn accept(&mut self, registry: &SocketRegistry) -> IpcResult<()> {
        if self.state != ConnectionState::Idle {
            return Err(IpcError::InvalidState(self.state));
        }

        let listener = registry.find(&self.socket_id)?;
        let (stream, _) = listener.accept().map_err(IpcError::Accept)?;

        let mut transport = SocketTransport::new(stream);
        transport
            .set_receive_timeout(self.options.receive_timeout)
            .map_err(IpcError::Accept)?;

        self.admit(transport)
    }
}

impl<T: Transport> Connection<T> {
    /// Wrap an already connected transport, applying the credential policy
    pub fn with_transport(
        socket_id: impl Into<PathBuf>,
        transport: T,
        options: ConnectionOptions,
    ) -> IpcResult<Self> {
        let mut conn = Self {
            socket_id: socket_id.into(),
            options,
            transport: None,
            state: ConnectionState::Idle,
            peer: None,
            exit_status_expected: false,
            pid_sent: false,
        };
        conn.admit(transport)?;
        Ok(conn)
    }

    fn admit(&mut self, transport: T) -> IpcResult<()> {
        let peer = match transport.peer_credentials() {
            Ok(peer) => Some(peer),
            Err(e) => {
                debug!(socket = %self.socket_id.display(), error = %e, "Peer credentials unavailable");
                None
            }
        };

        if let Err(reason) = self.options.credential_policy.check(peer.as_ref()) {
            warn!(socket = %self.socket_id.display(), reason = %reason, "Rejecting peer");
            self.peer = peer;
            self.state = ConnectionState::Closed;
            return Err(IpcError::Security(reason));
        }

        debug!(
            socket = %self.socket_id.display(),
            peer_pid = ?peer.map(|p| p.pid),
            peer_uid = ?peer.map(|p| p.uid),
            "Peer accepted"
        );

        self.peer = peer;
        self.transport = Some(transport);
        self.state = ConnectionState::Accepted;
        Ok(())
    }

    /// Read request frames until `End`.
    ///
    /// Any failure aborts the whole request and releases the socket; no
    /// partially filled request is ever returned.
    pub fn receive(&mut self) -> IpcResult<LaunchRequest> {
        if self.state != ConnectionState::Accepted {
            return Err(IpcError::InvalidState(self.state));
        }
        let Some(transport) = self.transport.as_mut() else {
            return Err(IpcError::InvalidState(self.state));
        };

        self.state = ConnectionState::Receiving;
        transport.set_deadline(self.options.receive_timeout.map(|t| Instant::now() + t));

        let result = read_request(transport, &self.options.limits);
        transport.set_deadline(None);

        match result {
            Ok(mut request) => {
                request.credentials = self.peer;
                self.exit_status_expected = !request.is_detached();
                self.state = ConnectionState::Completed;

                debug!(
                    socket = %self.socket_id.display(),
                    exec = %request.exec.display(),
                    argc = request.args.len(),
                    envc = request.env.len(),
                    "Request received"
                );
                Ok(request)
            }
            Err(e) => {
                debug!(socket = %self.socket_id.display(), error = %e, "Aborting request");
                self.transport = None;
                self.state = ConnectionState::Aborted;
                Err(e.into())
            }
        }
    }

    /// True when the invoker waits for the child's exit status
    pub fn is_exit_status_expected(&self) -> bool {
        self.exit_status_expected
    }

    /// Tell the invoker the pid of the launched process. Sent at most once.
    pub fn send_pid(&mut self, pid: u32) -> IpcResult<()> {
        if self.pid_sent {
            return Err(IpcError::AlreadySent(Tag::Pid));
        }
        self.send_frame(Tag::Pid, pid.to_le_bytes())?;
        self.pid_sent = true;
        Ok(())
    }

    /// Report the wait status of the launched process
    pub fn send_exit_status(&mut self, status: i32) -> IpcResult<()> {
        if !self.exit_status_expected {
            return Err(IpcError::ExitStatusNotExpected);
        }
        self.send_frame(Tag::ExitStatus, status.to_le_bytes())
    }

    fn send_frame(&mut self, tag: Tag, payload: [u8; 4]) -> IpcResult<()> {
        if self.state != ConnectionState::Completed {
            return Err(IpcError::InvalidState(self.state));
        }
        let Some(transport) = self.transport.as_mut() else {
            return Err(IpcError::InvalidState(self.state));
        };

        let result = transport
            .send_tag(tag)
            .and_then(|()| transport.write_all(&payload));

        if let Err(source) = result {
            // The invoker went away; the caller decides how loudly to say so
            self.close();
            return Err(IpcError::Send { what: tag, source });
        }
        Ok(())
    }

    /// Pid of the connected process, captured at accept time
    pub fn peer_pid(&self) -> Option<u32> {
        self.peer.map(|p| p.pid)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Release the socket. Safe to call any number of times.
    pub fn close(&mut self) {
        if self.transport.take().is_some() {
            debug!(socket = %self.socket_id.display(), "Connection closed");
        }
        self.state = ConnectionState::Closed;
    }
}

/// Fields collected while frames arrive
#[derive(Default)]
struct RequestFields {
    seen: [bool; Tag::REQUEST_FIELDS.len()],
    options: OptionFlags,
    app_name: Option<String>,
    exec: Option<PathBuf>,
    args: Vec<OsString>,
    env: Vec<OsString>,
    io: Option<IoDescriptors>,
    ids: Option<(u32, u32)>,
    priority: i32,
    respawn_delay: u32,
}

impl RequestFields {
    fn mark_seen(&mut self, tag: Tag) -> Result<(), ProtocolError> {
        let index = tag.field_index().ok_or(ProtocolError::UnexpectedTag(tag))?;
        if std::mem::replace(&mut self.seen[index], true) {
            return Err(ProtocolError::DuplicateField(tag));
        }
        Ok(())
    }

    fn finish(self) -> Result<LaunchRequest, ProtocolError> {
        let exec = self.exec.ok_or(ProtocolError::MissingField(Tag::Exec))?;
        let (uid, gid) = self.ids.ok_or(ProtocolError::MissingField(Tag::Ids))?;

        Ok(LaunchRequest {
            app_name: self.app_name,
            exec,
            args: self.args,
            env: self.env,
            io: self.io.unwrap_or_default(),
            uid,
            gid,
            priority: self.priority,
            respawn_delay: self.respawn_delay,
            options: self.options,
            credentials: None,
        })
    }
}

/// Drive the frame loop until `End` and build the request
fn read_request<R: FrameReader + ?Sized>(
    reader: &mut R,
    limits: &ProtocolLimits,
) -> Result<LaunchRequest, ProtocolError> {
    let mut fields = RequestFields::default();
    let mut budget = limits.max_request_bytes;

    loop {
        let raw = reader.recv_tag()?;
        let tag = Tag::from_u32(raw).ok_or(ProtocolError::UnknownTag(raw))?;

        if tag == Tag::End {
            return fields.finish();
        }

        fields.mark_seen(tag)?;

        match tag {
            Tag::Options => {
                let bits = reader.recv_u32()?;
                fields.options =
                    OptionFlags::from_bits(bits).ok_or(ProtocolError::UnknownOptions(bits))?;
            }
            Tag::AppName => {
                let name = recv_c_string(reader, limits, &mut budget)?;
                let name = String::from_utf8(name).map_err(|_| ProtocolError::InvalidUtf8)?;
                fields.app_name = Some(name);
            }
            Tag::Exec => {
                let path = recv_c_string(reader, limits, &mut budget)?;
                if path.is_empty() {
                    return Err(ProtocolError::EmptyField(Tag::Exec));
                }
                fields.exec = Some(PathBuf::from(OsString::from_vec(path)));
            }
            Tag::Args => {
                fields.args =
                    recv_string_list(reader, Tag::Args, limits.max_args, limits, &mut budget)?;
            }
            Tag::Env => {
                fields.env = recv_string_list(reader, Tag::Env, limits.max_env, limits, &mut budget)?;
            }
            Tag::Io => fields.io = Some(reader.recv_descriptors()?),
            Tag::Ids => {
                let uid = reader.recv_u32()?;
                let gid = reader.recv_u32()?;
                fields.ids = Some((uid, gid));
            }
            Tag::Priority => fields.priority = reader.recv_i32()?,
            Tag::Delay => fields.respawn_delay = reader.recv_u32()?,
            Tag::End | Tag::Pid | Tag::ExitStatus => {
                return Err(ProtocolError::UnexpectedTag(tag));
            }
        }
    }
}

/// A string headed for exec: bounded and free of NUL bytes.
///
/// Its length is charged to `budget`, the string bytes the request may
/// still carry.
fn recv_c_string<R: FrameReader + ?Sized>(
    reader: &mut R,
    limits: &ProtocolLimits,
    budget: &mut u32,
) -> Result<Vec<u8>, ProtocolError> {
    let bytes = reader
        .recv_string(limits.max_string_len.min(*budget))
        .map_err(|e| match e {
            ProtocolError::StringTooLong { len, .. } if len <= limits.max_string_len => {
                ProtocolError::RequestTooLarge {
                    limit: limits.max_request_bytes,
                }
            }
            e => e,
        })?;
    if bytes.contains(&0) {
        return Err(ProtocolError::InteriorNul);
    }
    *budget -= bytes.len() as u32;
    Ok(bytes)
}

/// A declared count followed by that many strings.
///
/// The count is checked against `max` before anything is allocated.
fn recv_string_list<R: FrameReader + ?Sized>(
    reader: &mut R,
    field: Tag,
    max: u32,
    limits: &ProtocolLimits,
    budget: &mut u32,
) -> Result<Vec<OsString>, ProtocolError> {
    let count = reader.recv_u32()?;
    if count > max {
        return Err(ProtocolError::CountTooLarge {
            field,
            count,
            limit: max,
        });
    }

    let mut list = Vec::with_capacity(count as usize);
    for _ in 0..count {
        list.push(OsString::from_vec(recv_c_string(reader, limits, budget)?));
    }
    Ok(list)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CredentialRequirement, ErrorKind, FrameWriter, MemoryTransport};
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::thread;

    const SOCKET: &str = "/run/warmstart/test.sock";

    fn send_strings(buf: &mut Vec<u8>, tag: Tag, items: &[&str]) {
        buf.send_tag(tag).unwrap();
        buf.send_u32(items.len() as u32).unwrap();
        for item in items {
            buf.send_string(item.as_bytes()).unwrap();
        }
    }

    /// EXEC, ARGS, ENV, IO, IDS, PRIORITY, DELAY without the END frame
    fn scenario_frames() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.send_tag(Tag::Exec).unwrap();
        buf.send_string(b"/bin/true").unwrap();
        send_strings(&mut buf, Tag::Args, &["/bin/true"]);
        send_strings(&mut buf, Tag::Env, &[]);
        buf.send_tag(Tag::Io).unwrap();
        for n in [0, 1, 2] {
            buf.send_i32(n).unwrap();
        }
        buf.send_tag(Tag::Ids).unwrap();
        buf.send_u32(1000).unwrap();
        buf.send_u32(1000).unwrap();
        buf.send_tag(Tag::Priority).unwrap();
        buf.send_i32(0).unwrap();
        buf.send_tag(Tag::Delay).unwrap();
        buf.send_u32(0).unwrap();
        buf
    }

    fn with_end(mut buf: Vec<u8>) -> Vec<u8> {
        buf.send_tag(Tag::End).unwrap();
        buf
    }

    fn connection(input: Vec<u8>) -> Connection<MemoryTransport> {
        Connection::with_transport(SOCKET, MemoryTransport::new(input), ConnectionOptions::default())
            .unwrap()
    }

    fn connection_with_limits(input: Vec<u8>, limits: ProtocolLimits) -> Connection<MemoryTransport> {
        let options = ConnectionOptions {
            limits,
            ..ConnectionOptions::default()
        };
        Connection::with_transport(SOCKET, MemoryTransport::new(input), options).unwrap()
    }

    fn output_of(conn: &Connection<MemoryTransport>) -> Vec<u8> {
        conn.transport
            .as_ref()
            .map(|t| t.output().to_vec())
            .unwrap_or_default()
    }

    #[test]
    fn complete_request_is_received() {
        let mut conn = connection(with_end(scenario_frames()));
        let request = conn.receive().unwrap();

        assert_eq!(request.exec, PathBuf::from("/bin/true"));
        assert_eq!(request.args, vec![OsString::from("/bin/true")]);
        assert!(request.env.is_empty());
        assert_eq!(request.io.numbers(), [0, 1, 2]);
        assert_eq!((request.uid, request.gid), (1000, 1000));
        assert_eq!(request.priority, 0);
        assert_eq!(request.respawn_delay, 0);
        assert_eq!(conn.state(), ConnectionState::Completed);
        assert!(conn.is_exit_status_expected());
    }

    #[test]
    fn missing_end_fails_without_a_request() {
        let mut conn = connection(scenario_frames());
        let err = conn.receive().unwrap_err();

        assert!(matches!(
            err,
            IpcError::Protocol(ProtocolError::ConnectionClosed)
        ));
        assert_eq!(conn.state(), ConnectionState::Aborted);
        assert!(conn.send_pid(1).is_err());
    }

    #[test]
    fn field_order_is_up_to_the_sender() {
        let mut buf = Vec::new();
        buf.send_tag(Tag::Delay).unwrap();
        buf.send_u32(5).unwrap();
        buf.send_tag(Tag::Ids).unwrap();
        buf.send_u32(1).unwrap();
        buf.send_u32(2).unwrap();
        send_strings(&mut buf, Tag::Env, &["A=1", "B=2"]);
        buf.send_tag(Tag::Exec).unwrap();
        buf.send_string(b"/usr/bin/app").unwrap();
        buf.send_tag(Tag::AppName).unwrap();
        buf.send_string(b"app").unwrap();
        buf.send_tag(Tag::Priority).unwrap();
        buf.send_i32(-5).unwrap();
        buf.send_tag(Tag::End).unwrap();

        let request = connection(buf).receive().unwrap();
        assert_eq!(request.respawn_delay, 5);
        assert_eq!(request.env.len(), 2);
        assert_eq!(request.app_name.as_deref(), Some("app"));
        assert_eq!(request.priority, -5);
        assert!(request.args.is_empty());
        assert_eq!(request.io.numbers(), [0, 1, 2]);
    }

    #[test]
    fn unknown_tag_aborts() {
        let mut buf = scenario_frames();
        buf.send_u32(0x0bad_f00d).unwrap();
        buf.send_tag(Tag::End).unwrap();

        let mut conn = connection(buf);
        assert!(matches!(
            conn.receive(),
            Err(IpcError::Protocol(ProtocolError::UnknownTag(0x0bad_f00d)))
        ));
    }

    #[test]
    fn response_tag_in_request_aborts() {
        let mut buf = Vec::new();
        buf.send_tag(Tag::Pid).unwrap();
        buf.send_u32(1).unwrap();

        assert!(matches!(
            connection(buf).receive(),
            Err(IpcError::Protocol(ProtocolError::UnexpectedTag(Tag::Pid)))
        ));
    }

    #[test]
    fn duplicate_field_aborts() {
        let mut buf = scenario_frames();
        buf.send_tag(Tag::Ids).unwrap();
        buf.send_u32(0).unwrap();
        buf.send_u32(0).unwrap();
        buf.send_tag(Tag::End).unwrap();

        assert!(matches!(
            connection(buf).receive(),
            Err(IpcError::Protocol(ProtocolError::DuplicateField(Tag::Ids)))
        ));
    }

    #[test]
    fn exec_and_ids_are_required() {
        let mut buf = Vec::new();
        buf.send_tag(Tag::Ids).unwrap();
        buf.send_u32(1).unwrap();
        buf.send_u32(1).unwrap();
        buf.send_tag(Tag::End).unwrap();
        assert!(matches!(
            connection(buf).receive(),
            Err(IpcError::Protocol(ProtocolError::MissingField(Tag::Exec)))
        ));

        let mut buf = Vec::new();
        buf.send_tag(Tag::Exec).unwrap();
        buf.send_string(b"/bin/true").unwrap();
        buf.send_tag(Tag::End).unwrap();
        assert!(matches!(
            connection(buf).receive(),
            Err(IpcError::Protocol(ProtocolError::MissingField(Tag::Ids)))
        ));
    }

    #[test]
    fn oversized_arg_count_is_rejected_before_allocation() {
        let mut buf = Vec::new();
        buf.send_tag(Tag::Args).unwrap();
        // No strings follow; a receiver that trusted the count would either
        // allocate for it or fail later with a truncated frame
        buf.send_u32(u32::MAX).unwrap();

        let err = connection(buf).receive().unwrap_err();
        assert!(matches!(
            err,
            IpcError::Protocol(ProtocolError::CountTooLarge {
                field: Tag::Args,
                count: u32::MAX,
                limit: ProtocolLimits::DEFAULT_MAX_ARGS,
            })
        ));
    }

    #[test]
    fn env_count_uses_its_own_limit() {
        let limits = ProtocolLimits {
            max_env: 1,
            ..ProtocolLimits::default()
        };
        let mut buf = Vec::new();
        send_strings(&mut buf, Tag::Env, &["A=1", "B=2"]);

        let err = connection_with_limits(buf, limits).receive().unwrap_err();
        assert!(matches!(
            err,
            IpcError::Protocol(ProtocolError::CountTooLarge {
                field: Tag::Env,
                count: 2,
                limit: 1,
            })
        ));
    }

    #[test]
    fn string_bytes_are_bounded_across_the_request() {
        let limits = ProtocolLimits {
            max_string_len: 8,
            max_request_bytes: 20,
            ..ProtocolLimits::default()
        };
        let mut buf = Vec::new();
        buf.send_tag(Tag::Exec).unwrap();
        buf.send_string(b"/bin/sh").unwrap();
        // Each string fits on its own; the third crosses the total
        send_strings(&mut buf, Tag::Env, &["A=123456", "B=12", "C=123456"]);

        let err = connection_with_limits(buf, limits).receive().unwrap_err();
        assert!(matches!(
            err,
            IpcError::Protocol(ProtocolError::RequestTooLarge { limit: 20 })
        ));
    }

    #[test]
    fn single_long_string_is_still_string_too_long() {
        let limits = ProtocolLimits {
            max_string_len: 8,
            max_request_bytes: 20,
            ..ProtocolLimits::default()
        };
        let mut buf = Vec::new();
        buf.send_tag(Tag::Exec).unwrap();
        buf.send_string(b"/usr/bin/longer").unwrap();

        let err = connection_with_limits(buf, limits).receive().unwrap_err();
        assert!(matches!(
            err,
            IpcError::Protocol(ProtocolError::StringTooLong { len: 15, limit: 8 })
        ));
    }

    #[test]
    fn slow_sender_cannot_outlast_the_receive_timeout() {
        let (invoker, daemon) = UnixStream::pair().unwrap();
        let options = ConnectionOptions {
            receive_timeout: Some(Duration::from_millis(200)),
            ..ConnectionOptions::default()
        };
        let mut conn =
            Connection::with_transport(SOCKET, SocketTransport::new(daemon), options).unwrap();

        // A complete request, delivered one byte every 50ms
        let frames = with_end(scenario_frames());
        let dripper = thread::spawn(move || {
            let mut invoker = invoker;
            for byte in frames {
                if invoker.write_all(&[byte]).is_err() {
                    break;
                }
                thread::sleep(Duration::from_millis(50));
            }
        });

        let started = Instant::now();
        let err = conn.receive().unwrap_err();

        assert!(matches!(err, IpcError::Protocol(ProtocolError::TimedOut)));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(conn.state(), ConnectionState::Aborted);
        dripper.join().unwrap();
    }

    #[test]
    fn declared_arg_count_must_be_delivered() {
        let mut buf = Vec::new();
        buf.send_tag(Tag::Args).unwrap();
        buf.send_u32(3).unwrap();
        buf.send_string(b"one").unwrap();

        assert!(matches!(
            connection(buf).receive(),
            Err(IpcError::Protocol(ProtocolError::Truncated))
        ));
    }

    #[test]
    fn nul_in_exec_is_rejected() {
        let mut buf = Vec::new();
        buf.send_tag(Tag::Exec).unwrap();
        buf.send_string(b"/bin/true\0/bin/sh").unwrap();

        assert!(matches!(
            connection(buf).receive(),
            Err(IpcError::Protocol(ProtocolError::InteriorNul))
        ));
    }

    #[test]
    fn unknown_option_bits_are_rejected() {
        let mut buf = Vec::new();
        buf.send_tag(Tag::Options).unwrap();
        buf.send_u32(0x80).unwrap();

        assert!(matches!(
            connection(buf).receive(),
            Err(IpcError::Protocol(ProtocolError::UnknownOptions(0x80)))
        ));
    }

    #[test]
    fn detached_request_expects_no_exit_status() {
        let mut buf = Vec::new();
        buf.send_tag(Tag::Options).unwrap();
        buf.send_u32(OptionFlags::DETACH.bits()).unwrap();
        buf.extend(with_end(scenario_frames()));

        let mut conn = connection(buf);
        let request = conn.receive().unwrap();
        assert!(request.is_detached());
        assert!(!conn.is_exit_status_expected());
        assert!(matches!(
            conn.send_exit_status(0),
            Err(IpcError::ExitStatusNotExpected)
        ));
    }

    #[test]
    fn pid_and_exit_status_are_framed() {
        let mut conn = connection(with_end(scenario_frames()));
        conn.receive().unwrap();

        conn.send_pid(1234).unwrap();
        conn.send_exit_status(256).unwrap();

        let mut expected = Vec::new();
        expected.send_tag(Tag::Pid).unwrap();
        expected.send_u32(1234).unwrap();
        expected.send_tag(Tag::ExitStatus).unwrap();
        expected.send_i32(256).unwrap();
        assert_eq!(output_of(&conn), expected);
    }

    #[test]
    fn pid_is_sent_once() {
        let mut conn = connection(with_end(scenario_frames()));
        conn.receive().unwrap();
        conn.send_pid(1).unwrap();
        assert!(matches!(
            conn.send_pid(1),
            Err(IpcError::AlreadySent(Tag::Pid))
        ));
    }

    #[test]
    fn exit_status_to_vanished_peer_is_a_send_failure() {
        let mut conn = connection(with_end(scenario_frames()));
        conn.receive().unwrap();
        assert!(conn.is_exit_status_expected());

        conn.transport.as_mut().unwrap().disconnect_peer();
        let err = conn.send_exit_status(0).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Send);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn close_is_idempotent() {
        let mut conn = connection(with_end(scenario_frames()));
        conn.close();
        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(matches!(
            conn.receive(),
            Err(IpcError::InvalidState(ConnectionState::Closed))
        ));
    }

    #[test]
    fn receive_twice_is_rejected() {
        let mut conn = connection(with_end(scenario_frames()));
        conn.receive().unwrap();
        assert!(matches!(
            conn.receive(),
            Err(IpcError::InvalidState(ConnectionState::Completed))
        ));
    }

    #[test]
    fn credentials_flow_into_request() {
        let creds = PeerCredentials {
            pid: 77,
            uid: 1000,
            gid: 1000,
        };
        let transport = MemoryTransport::new(with_end(scenario_frames())).with_credentials(creds);
        let mut conn =
            Connection::with_transport(SOCKET, transport, ConnectionOptions::default()).unwrap();

        assert_eq!(conn.peer_pid(), Some(77));
        let request = conn.receive().unwrap();
        assert_eq!(request.credentials, Some(creds));
    }

    #[test]
    fn credential_mismatch_rejects_peer() {
        let creds = PeerCredentials {
            pid: 77,
            uid: 1000,
            gid: 1000,
        };
        let options = ConnectionOptions {
            credential_policy: CredentialPolicy::Require(vec![CredentialRequirement::Uid(0)]),
            ..ConnectionOptions::default()
        };
        let transport = MemoryTransport::new(with_end(scenario_frames())).with_credentials(creds);

        let err = Connection::with_transport(SOCKET, transport, options).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Security);
    }
}
