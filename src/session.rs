//! NETCONF sessions
//!
//! A session is one long-lived conversation with a peer: capability
//! negotiation up front, then rpc / rpc-reply / notification traffic until
//! one side closes. The session owns its transport behind a mutex that is
//! held for the whole of any single message read or write, so message
//! boundaries never interleave on the wire.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::*;

use crate::error::{Error, Result};
use crate::framing::{encode, FrameDecoder, Version};
use crate::message::{self, MsgType};
use crate::rpc::{Reply, Rpc};
use crate::transport::{PollOutcome, ReadOutcome, Transport, TransportKind};
use crate::xml::{self, Element};

/// Opaque handle to the embedder's schema/XML context. Sessions share it
/// by `Arc`; the library never looks inside.
#[derive(Debug, Default)]
pub struct SchemaContext {
    /// Directory the embedding application searches for YANG modules.
    pub searchpath: Option<std::path::PathBuf>,
}

/// Which end of the conversation this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Lifecycle state; transitions are forward-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionStatus {
    Starting,
    Running,
    Closing,
    Invalid,
}

/// Why an invalid session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermReason {
    /// Orderly close-session exchange.
    Closed,
    /// Torn down by the embedder, e.g. answering kill-session.
    Killed,
    /// Transport dropped under us.
    Dropped,
    /// Hello or idle deadline expired.
    Timeout,
    /// Capability negotiation failed.
    BadHello,
    Other,
}

/// Transport, decoder and receive buffer: everything guarded by the
/// transport mutex.
pub(crate) struct SessionIo {
    pub(crate) transport: Transport,
    decoder: FrameDecoder,
    buf: Vec<u8>,
}

pub(crate) enum RawRead {
    Msg(Vec<u8>),
    TimedOut,
    Eof,
}

impl SessionIo {
    pub(crate) fn new(transport: Transport) -> SessionIo {
        SessionIo {
            transport,
            // hello always travels in 1.0 framing
            decoder: FrameDecoder::new(Version::V10),
            buf: Vec::new(),
        }
    }

    pub(crate) fn switch_version(&mut self, version: Version) {
        self.decoder = FrameDecoder::new(version);
    }

    /// Drain one whole framed message, waiting up to `timeout_ms`.
    fn read_framed(&mut self, timeout_ms: i32) -> Result<RawRead> {
        let deadline = deadline(timeout_ms);
        loop {
            if let Some(msg) = self.decoder.decode(&mut self.buf)? {
                return Ok(RawRead::Msg(msg));
            }
            match self.transport.poll_readable(remaining_ms(deadline))? {
                PollOutcome::Ready => {}
                PollOutcome::Timeout => return Ok(RawRead::TimedOut),
                PollOutcome::Disconnect => return Ok(RawRead::Eof),
            }
            let mut chunk = [0u8; 8192];
            let mut eof = false;
            loop {
                match self.transport.read(&mut chunk)? {
                    ReadOutcome::Data(n) => self.buf.extend_from_slice(&chunk[..n]),
                    ReadOutcome::WouldBlock => break,
                    ReadOutcome::Eof => {
                        eof = true;
                        break;
                    }
                }
            }
            if eof {
                // a whole message may have arrived together with the close
                return match self.decoder.decode(&mut self.buf)? {
                    Some(msg) => Ok(RawRead::Msg(msg)),
                    None => Ok(RawRead::Eof),
                };
            }
        }
    }

    fn write_framed(&mut self, version: Version, payload: &[u8]) -> Result<()> {
        let framed = encode(version, payload);
        self.transport.write_all(&framed)
    }
}

pub(crate) fn deadline(timeout_ms: i32) -> Option<Instant> {
    if timeout_ms < 0 {
        None
    } else {
        Some(Instant::now() + Duration::from_millis(timeout_ms as u64))
    }
}

pub(crate) fn remaining_ms(deadline: Option<Instant>) -> i32 {
    match deadline {
        None => -1,
        Some(d) => {
            let left = d.saturating_duration_since(Instant::now()).as_millis();
            left.min(i32::MAX as u128) as i32
        }
    }
}

struct ClientSide {
    msg_id: AtomicU64,
    replies: Mutex<VecDeque<Element>>,
    notifications: Mutex<VecDeque<Element>>,
}

struct ServerSide {
    username: Option<String>,
    last_activity: Mutex<Instant>,
}

enum Side {
    Client(ClientSide),
    Server(ServerSide),
}

struct SessionState {
    status: SessionStatus,
    term_reason: Option<TermReason>,
}

/// One NETCONF session, client or server side, over any transport.
pub struct Session {
    role: Role,
    version: Version,
    session_id: u32,
    /// Capabilities the peer advertised in its hello.
    capabilities: Vec<String>,
    peer_host: Option<String>,
    peer_port: Option<u16>,
    context: Option<Arc<SchemaContext>>,
    io: Mutex<SessionIo>,
    state: Mutex<SessionState>,
    side: Side,
}

/// What a finished handshake settles on.
pub(crate) struct HandshakeOutcome {
    pub(crate) version: Version,
    pub(crate) peer_caps: Vec<String>,
    pub(crate) session_id: u32,
}

/// Exchange hellos on a fresh transport. Both hellos travel in 1.0
/// framing; the negotiated version applies from the next message on.
pub(crate) fn run_handshake(
    io: &mut SessionIo,
    role: Role,
    local_caps: &[String],
    local_session_id: Option<u32>,
    timeout_ms: i32,
) -> Result<HandshakeOutcome> {
    let hello = message::build_hello(local_caps, local_session_id);
    io.write_framed(Version::V10, hello.to_xml().as_bytes())?;

    let raw = match io.read_framed(timeout_ms)? {
        RawRead::Msg(m) => m,
        RawRead::TimedOut => return Err(Error::Timeout),
        RawRead::Eof => return Err(Error::Transport("connection dropped during hello".into())),
    };
    let text = String::from_utf8_lossy(&raw);
    let root = xml::parse(&text)?;
    if message::classify(&root) != MsgType::Hello {
        return Err(Error::ProtocolViolation(format!(
            "expected hello, got <{}>",
            root.name
        )));
    }
    let (peer_caps, peer_sid) = message::parse_hello(&root)?;
    let session_id = match (role, peer_sid) {
        (Role::Client, Some(sid)) => sid,
        (Role::Client, None) => {
            return Err(Error::ProtocolViolation("server hello missing session-id".into()))
        }
        (Role::Server, None) => local_session_id.unwrap_or(0),
        (Role::Server, Some(_)) => {
            return Err(Error::ProtocolViolation("client hello carries a session-id".into()))
        }
    };
    let version = message::resolve_version(local_caps, &peer_caps)?;
    debug!("hello done: session {session_id}, version {version:?}");
    Ok(HandshakeOutcome {
        version,
        peer_caps,
        session_id,
    })
}

impl Session {
    /// Freeze a negotiated transport into a running session.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new_running(
        role: Role,
        mut io: SessionIo,
        outcome: HandshakeOutcome,
        context: Option<Arc<SchemaContext>>,
        peer_host: Option<String>,
        peer_port: Option<u16>,
        username: Option<String>,
    ) -> Session {
        io.switch_version(outcome.version);
        let side = match role {
            Role::Client => Side::Client(ClientSide {
                // the first rpc of a fresh session carries id 100
                msg_id: AtomicU64::new(100),
                replies: Mutex::new(VecDeque::new()),
                notifications: Mutex::new(VecDeque::new()),
            }),
            Role::Server => Side::Server(ServerSide {
                username,
                last_activity: Mutex::new(Instant::now()),
            }),
        };
        info!(
            "session {} running ({:?}, {:?}, peer {}:{})",
            outcome.session_id,
            role,
            outcome.version,
            peer_host.as_deref().unwrap_or("-"),
            peer_port.unwrap_or(0),
        );
        Session {
            role,
            version: outcome.version,
            session_id: outcome.session_id,
            capabilities: outcome.peer_caps,
            peer_host,
            peer_port,
            context,
            io: Mutex::new(io),
            state: Mutex::new(SessionState {
                status: SessionStatus::Running,
                term_reason: None,
            }),
            side,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Capabilities the peer advertised.
    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    pub fn peer_host(&self) -> Option<&str> {
        self.peer_host.as_deref()
    }

    pub fn peer_port(&self) -> Option<u16> {
        self.peer_port
    }

    pub fn context(&self) -> Option<&Arc<SchemaContext>> {
        self.context.as_ref()
    }

    /// Authenticated username (server role).
    pub fn username(&self) -> Option<&str> {
        match &self.side {
            Side::Server(s) => s.username.as_deref(),
            Side::Client(_) => None,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.state.lock().unwrap().status
    }

    pub fn termination_reason(&self) -> Option<TermReason> {
        self.state.lock().unwrap().term_reason
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.io.lock().unwrap().transport.kind()
    }

    /// The shared SSH connection, for opening or accepting sibling
    /// sessions multiplexed over it.
    pub fn ssh_connection(&self) -> Option<Arc<crate::transport::ssh::SshConnection>> {
        match &self.io.lock().unwrap().transport {
            Transport::Ssh(chan) => Some(Arc::clone(chan.connection())),
            _ => None,
        }
    }

    /// Override the next outgoing message-id (client role).
    pub fn set_next_message_id(&self, id: u64) -> Result<()> {
        match &self.side {
            Side::Client(c) => {
                c.msg_id.store(id, Ordering::Relaxed);
                Ok(())
            }
            Side::Server(_) => Err(Error::InvalidArg("message-id counter is client-side".into())),
        }
    }

    fn client_side(&self) -> Result<&ClientSide> {
        match &self.side {
            Side::Client(c) => Ok(c),
            Side::Server(_) => Err(Error::InvalidArg("client-side operation on a server session".into())),
        }
    }

    fn server_side(&self) -> Result<&ServerSide> {
        match &self.side {
            Side::Server(s) => Ok(s),
            Side::Client(_) => Err(Error::InvalidArg("server-side operation on a client session".into())),
        }
    }

    fn ensure_running(&self) -> Result<()> {
        let state = self.state.lock().unwrap();
        if state.status == SessionStatus::Running {
            Ok(())
        } else {
            Err(Error::InvalidArg(format!(
                "session {} is {:?}, not running",
                self.session_id, state.status
            )))
        }
    }

    /// Move the status forward; backward transitions are ignored.
    fn advance(&self, to: SessionStatus) {
        let mut state = self.state.lock().unwrap();
        if to > state.status {
            state.status = to;
        }
    }

    pub(crate) fn set_invalid(&self, reason: TermReason) {
        let mut state = self.state.lock().unwrap();
        if state.status != SessionStatus::Invalid {
            debug!("session {} -> invalid ({:?})", self.session_id, reason);
            state.status = SessionStatus::Invalid;
        }
        state.term_reason.get_or_insert(reason);
    }

    /// Instant of the last rpc handled (server role), for idle tracking.
    pub(crate) fn last_activity(&self) -> Option<Instant> {
        match &self.side {
            Side::Server(s) => Some(*s.last_activity.lock().unwrap()),
            Side::Client(_) => None,
        }
    }

    pub(crate) fn io_try_lock(&self) -> Option<MutexGuard<'_, SessionIo>> {
        self.io.try_lock().ok()
    }

    /// Read one whole message and classify it. `Ok(None)` when no
    /// complete message arrived within the timeout.
    pub fn read_msg(&self, timeout_ms: i32) -> Result<Option<(MsgType, Element)>> {
        let mut io = self.io.lock().unwrap();
        self.read_msg_with(&mut io, timeout_ms)
    }

    pub(crate) fn read_msg_with(
        &self,
        io: &mut SessionIo,
        timeout_ms: i32,
    ) -> Result<Option<(MsgType, Element)>> {
        self.ensure_running()?;
        let raw = match io.read_framed(timeout_ms) {
            Ok(RawRead::Msg(m)) => m,
            Ok(RawRead::TimedOut) => return Ok(None),
            Ok(RawRead::Eof) => {
                self.set_invalid(TermReason::Dropped);
                return Err(Error::Transport("connection dropped by peer".into()));
            }
            Err(e) => {
                match &e {
                    Error::MalformedMessage(_) => self.set_invalid(TermReason::Other),
                    Error::Transport(_) => self.set_invalid(TermReason::Dropped),
                    _ => {}
                }
                return Err(e);
            }
        };
        let text = String::from_utf8_lossy(&raw);
        trace!("session {} <- {}", self.session_id, text);
        let root = match xml::parse(&text) {
            Ok(root) => root,
            Err(e) => {
                self.set_invalid(TermReason::Other);
                return Err(e);
            }
        };
        let kind = message::classify(&root);
        match (self.role, kind) {
            (Role::Server, MsgType::Rpc) => {
                if let Side::Server(s) = &self.side {
                    *s.last_activity.lock().unwrap() = Instant::now();
                }
                Ok(Some((kind, root)))
            }
            (Role::Client, MsgType::Reply) | (Role::Client, MsgType::Notification) => {
                Ok(Some((kind, root)))
            }
            (_, MsgType::Hello) => {
                self.set_invalid(TermReason::Other);
                Err(Error::ProtocolViolation("hello after session establishment".into()))
            }
            (_, MsgType::Unknown) => {
                self.set_invalid(TermReason::Other);
                Err(Error::MalformedMessage(format!(
                    "unknown message element <{}>",
                    root.name
                )))
            }
            (Role::Server, _) => Err(Error::WrongSide("rpc-reply or notification", "server")),
            (Role::Client, _) => Err(Error::WrongSide("rpc", "client")),
        }
    }

    pub(crate) fn write_payload_with(&self, io: &mut SessionIo, payload: &Element) -> Result<()> {
        let text = payload.to_xml();
        trace!("session {} -> {}", self.session_id, text);
        if let Err(e) = io.write_framed(self.version, text.as_bytes()) {
            self.set_invalid(TermReason::Dropped);
            return Err(e);
        }
        Ok(())
    }

    /// Send one rpc; returns the message-id assigned to it.
    pub fn send_rpc(&self, rpc: &Rpc) -> Result<u64> {
        self.send_rpc_with_attrs(rpc, &[])
    }

    /// Send one rpc with extra envelope attributes.
    pub fn send_rpc_with_attrs(&self, rpc: &Rpc, attrs: &[(String, String)]) -> Result<u64> {
        self.ensure_running()?;
        let side = self.client_side()?;
        let id = side.msg_id.fetch_add(1, Ordering::Relaxed);
        let envelope = message::build_rpc(id, attrs, rpc.to_element());
        debug!("session {} sending {} (id {})", self.session_id, rpc.op_name(), id);
        let mut io = self.io.lock().unwrap();
        self.write_payload_with(&mut io, &envelope)?;
        Ok(id)
    }

    /// Wait for the reply matching `message_id`. Replies to other rpcs
    /// and notifications arriving first are queued for their own readers.
    pub fn recv_reply(&self, message_id: u64, timeout_ms: i32) -> Result<Element> {
        self.ensure_running()?;
        let side = self.client_side()?;
        let wanted = message_id.to_string();
        let deadline = deadline(timeout_ms);
        loop {
            {
                let mut replies = side.replies.lock().unwrap();
                if let Some(pos) = replies
                    .iter()
                    .position(|r| r.attr("message-id") == Some(wanted.as_str()))
                {
                    return Ok(replies.remove(pos).unwrap_or_default());
                }
            }
            let mut io = self.io.lock().unwrap();
            match self.read_msg_with(&mut io, remaining_ms(deadline))? {
                None => return Err(Error::Timeout),
                Some((MsgType::Reply, root)) => {
                    if root.attr("message-id") == Some(wanted.as_str()) {
                        return Ok(root);
                    }
                    // reply to some other in-flight rpc
                    side.replies.lock().unwrap().push_back(root);
                }
                Some((MsgType::Notification, root)) => {
                    side.notifications.lock().unwrap().push_back(root);
                }
                Some((other, _)) => {
                    return Err(Error::ProtocolViolation(format!(
                        "unexpected {other:?} while waiting for a reply"
                    )))
                }
            }
        }
    }

    /// Wait for the next notification, queueing replies for their readers.
    pub fn recv_notification(&self, timeout_ms: i32) -> Result<Element> {
        self.ensure_running()?;
        let side = self.client_side()?;
        let deadline = deadline(timeout_ms);
        loop {
            if let Some(n) = side.notifications.lock().unwrap().pop_front() {
                return Ok(n);
            }
            let mut io = self.io.lock().unwrap();
            match self.read_msg_with(&mut io, remaining_ms(deadline))? {
                None => return Err(Error::Timeout),
                Some((MsgType::Notification, root)) => return Ok(root),
                Some((MsgType::Reply, root)) => {
                    side.replies.lock().unwrap().push_back(root);
                }
                Some((other, _)) => {
                    return Err(Error::ProtocolViolation(format!(
                        "unexpected {other:?} while waiting for a notification"
                    )))
                }
            }
        }
    }

    /// Convenience: send an rpc and wait for its reply.
    pub fn call(&self, rpc: &Rpc, timeout_ms: i32) -> Result<Element> {
        let id = self.send_rpc(rpc)?;
        self.recv_reply(id, timeout_ms)
    }

    /// Receive the next rpc (server role). `Ok(None)` on timeout.
    pub fn recv_rpc(&self, timeout_ms: i32) -> Result<Option<Element>> {
        self.server_side()?;
        let mut io = self.io.lock().unwrap();
        Ok(self.read_msg_with(&mut io, timeout_ms)?.map(|(_, root)| root))
    }

    /// Answer an rpc; `message_id` is the id from the request envelope.
    pub fn send_reply(&self, message_id: &str, reply: Reply) -> Result<()> {
        self.ensure_running()?;
        self.server_side()?;
        let envelope = message::build_reply(message_id, reply.into_content());
        let mut io = self.io.lock().unwrap();
        self.write_payload_with(&mut io, &envelope)
    }

    /// Push one event notification to the peer (server role).
    pub fn send_notification(&self, event_time: &str, event: Element) -> Result<()> {
        self.ensure_running()?;
        self.server_side()?;
        let envelope = message::build_notification(event_time, event);
        let mut io = self.io.lock().unwrap();
        self.write_payload_with(&mut io, &envelope)
    }

    /// Orderly close. A running client sends `<close-session>` and waits
    /// briefly for the ok before tearing the transport down.
    pub fn close(&self) {
        if self.role == Role::Client && self.status() == SessionStatus::Running {
            if let Ok(id) = self.send_rpc(&Rpc::CloseSession) {
                match self.recv_reply(id, 2000) {
                    Ok(_) => debug!("session {} close acknowledged", self.session_id),
                    Err(e) => debug!("session {} close reply not received: {e}", self.session_id),
                }
            }
        }
        self.teardown(TermReason::Closed);
    }

    /// Immediate teardown without the close-session exchange.
    pub fn kill(&self) {
        self.teardown(TermReason::Killed);
    }

    pub(crate) fn teardown(&self, reason: TermReason) {
        self.advance(SessionStatus::Closing);
        if let Side::Client(c) = &self.side {
            c.replies.lock().unwrap().clear();
            c.notifications.lock().unwrap().clear();
        }
        if let Ok(mut io) = self.io.lock() {
            io.transport.shutdown();
            io.buf.clear();
        }
        info!("session {} closed ({reason:?})", self.session_id);
        self.set_invalid(reason);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.session_id)
            .field("role", &self.role)
            .field("version", &self.version)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::Datastore;
    use crate::transport::fd::FdTransport;
    use std::os::fd::OwnedFd;
    use std::thread;

    const LOCK_RPC_10: &str = "<rpc message-id=\"101\" xmlns=\"urn:ietf:params:xml:ns:netconf:base:1.0\"><lock><target><running/></target></lock></rpc>]]>]]>";

    /// A session over pipes, plus the peer ends: write into `feed` to
    /// give the session input, read from `drain` to see its output.
    fn fd_session(role: Role, version: Version) -> (Session, OwnedFd, OwnedFd) {
        let (in_r, in_w) = nix::unistd::pipe().unwrap();
        let (out_r, out_w) = nix::unistd::pipe().unwrap();
        let transport = Transport::Fd(FdTransport::new(in_r, out_w).unwrap());
        let session = Session::new_running(
            role,
            SessionIo::new(transport),
            HandshakeOutcome {
                version,
                peer_caps: vec![version.capability().to_string()],
                session_id: 1,
            },
            None,
            None,
            None,
            match role {
                Role::Server => Some("admin".to_string()),
                Role::Client => None,
            },
        );
        (session, in_w, out_r)
    }

    fn feed(fd: &OwnedFd, bytes: &[u8]) {
        let mut written = 0;
        while written < bytes.len() {
            written += nix::unistd::write(fd, &bytes[written..]).unwrap();
        }
    }

    fn drain(fd: &OwnedFd) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match nix::unistd::read(fd, &mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(nix::errno::Errno::EAGAIN) => break,
                Err(e) => panic!("drain: {e}"),
            }
            if out.ends_with(b"]]>]]>") || out.ends_with(b"\n##\n") {
                break;
            }
        }
        out
    }

    #[test]
    fn status_only_moves_forward() {
        assert!(SessionStatus::Starting < SessionStatus::Running);
        assert!(SessionStatus::Running < SessionStatus::Closing);
        assert!(SessionStatus::Closing < SessionStatus::Invalid);
    }

    #[test]
    fn deadline_accounting() {
        assert_eq!(remaining_ms(None), -1);
        let d = deadline(0);
        assert_eq!(remaining_ms(d), 0);
        let d = deadline(10_000);
        let left = remaining_ms(d);
        assert!(left > 9_000 && left <= 10_000);
    }

    #[test]
    fn server_reads_lock_rpc_in_10_framing() {
        let (session, feed_fd, _drain_fd) = fd_session(Role::Server, Version::V10);
        feed(&feed_fd, LOCK_RPC_10.as_bytes());
        let (kind, root) = session.read_msg(1000).unwrap().expect("a whole message");
        assert_eq!(kind, MsgType::Rpc);
        assert_eq!(root.name, "rpc");
        assert_eq!(root.attr("message-id"), Some("101"));
        assert_eq!(root.first_child().unwrap().name, "lock");
        assert_eq!(session.status(), SessionStatus::Running);
    }

    #[test]
    fn client_rejects_rpc_as_wrong_side() {
        let (session, feed_fd, _drain_fd) = fd_session(Role::Client, Version::V10);
        feed(&feed_fd, LOCK_RPC_10.as_bytes());
        match session.read_msg(1000) {
            Err(Error::WrongSide(_, side)) => assert_eq!(side, "client"),
            other => panic!("expected WrongSide, got {other:?}"),
        }
        // wrong-side is not fatal
        assert_eq!(session.status(), SessionStatus::Running);
    }

    #[test]
    fn lock_rpc_11_exact_wire_image() {
        let (session, _feed_fd, drain_fd) = fd_session(Role::Client, Version::V11);
        session.set_next_message_id(1000).unwrap();
        let id = session
            .send_rpc(&Rpc::Lock {
                target: Datastore::Running,
            })
            .unwrap();
        assert_eq!(id, 1000);
        let payload = "<rpc message-id=\"1000\" xmlns=\"urn:ietf:params:xml:ns:netconf:base:1.0\"><lock><target><running/></target></lock></rpc>";
        let expected = format!("\n#{}\n{}\n##\n", payload.len(), payload);
        assert_eq!(drain(&drain_fd), expected.as_bytes());
    }

    #[test]
    fn message_arriving_with_the_close_is_still_delivered() {
        let (session, feed_fd, _drain_fd) = fd_session(Role::Server, Version::V10);
        // the peer's last message and its close coalesce
        feed(&feed_fd, LOCK_RPC_10.as_bytes());
        drop(feed_fd);
        let (kind, root) = session.read_msg(1000).unwrap().expect("a whole message");
        assert_eq!(kind, MsgType::Rpc);
        assert_eq!(root.attr("message-id"), Some("101"));
        assert_eq!(session.status(), SessionStatus::Running);
        // only the next read reports the drop
        match session.read_msg(1000) {
            Err(Error::Transport(_)) => {}
            other => panic!("expected Transport error, got {other:?}"),
        }
        assert_eq!(session.termination_reason(), Some(TermReason::Dropped));
    }

    #[test]
    fn eof_marks_session_dropped() {
        let (session, feed_fd, _drain_fd) = fd_session(Role::Client, Version::V10);
        drop(feed_fd);
        match session.read_msg(1000) {
            Err(Error::Transport(_)) => {}
            other => panic!("expected Transport error, got {other:?}"),
        }
        assert_eq!(session.status(), SessionStatus::Invalid);
        assert_eq!(session.termination_reason(), Some(TermReason::Dropped));
    }

    #[test]
    fn malformed_framing_invalidates_session() {
        let (session, feed_fd, _drain_fd) = fd_session(Role::Server, Version::V11);
        feed(&feed_fd, b"\n#0\n");
        match session.read_msg(1000) {
            Err(Error::MalformedMessage(_)) => {}
            other => panic!("expected MalformedMessage, got {other:?}"),
        }
        assert_eq!(session.status(), SessionStatus::Invalid);
    }

    #[test]
    fn duplicate_hello_is_a_protocol_violation() {
        let (session, feed_fd, _drain_fd) = fd_session(Role::Client, Version::V10);
        feed(
            &feed_fd,
            b"<hello xmlns=\"urn:ietf:params:xml:ns:netconf:base:1.0\"><capabilities><capability>urn:ietf:params:netconf:base:1.0</capability></capabilities></hello>]]>]]>",
        );
        match session.read_msg(1000) {
            Err(Error::ProtocolViolation(_)) => {}
            other => panic!("expected ProtocolViolation, got {other:?}"),
        }
        assert_eq!(session.status(), SessionStatus::Invalid);
    }

    fn handshake_pair(
        client_caps: Vec<String>,
        server_caps: Vec<String>,
    ) -> (Result<HandshakeOutcome>, Result<HandshakeOutcome>) {
        let (c_in, s_out) = nix::unistd::pipe().unwrap();
        let (s_in, c_out) = nix::unistd::pipe().unwrap();
        let client = thread::spawn(move || {
            let transport = Transport::Fd(FdTransport::new(c_in, c_out).unwrap());
            let mut io = SessionIo::new(transport);
            run_handshake(&mut io, Role::Client, &client_caps, None, 5000)
        });
        let server = {
            let transport = Transport::Fd(FdTransport::new(s_in, s_out).unwrap());
            let mut io = SessionIo::new(transport);
            run_handshake(&mut io, Role::Server, &server_caps, Some(7), 5000)
        };
        (client.join().unwrap(), server)
    }

    #[test]
    fn hello_negotiates_highest_common_version() {
        let (client, server) = handshake_pair(
            vec![
                Version::V10.capability().to_string(),
                Version::V11.capability().to_string(),
            ],
            vec![Version::V11.capability().to_string()],
        );
        let client = client.unwrap();
        let server = server.unwrap();
        assert_eq!(client.version, Version::V11);
        assert_eq!(server.version, Version::V11);
        // the client learns the server-assigned id
        assert_eq!(client.session_id, 7);
        assert_eq!(server.session_id, 7);
    }

    #[test]
    fn rpc_before_hello_is_a_protocol_violation() {
        let (s_in, feeder) = nix::unistd::pipe().unwrap();
        let (_sink, s_out) = nix::unistd::pipe().unwrap();
        feed(&feeder, LOCK_RPC_10.as_bytes());
        let transport = Transport::Fd(FdTransport::new(s_in, s_out).unwrap());
        let mut io = SessionIo::new(transport);
        let caps = vec![Version::V10.capability().to_string()];
        match run_handshake(&mut io, Role::Server, &caps, Some(1), 1000) {
            Err(Error::ProtocolViolation(_)) => {}
            other => panic!("expected ProtocolViolation, got {other:?}"),
        }
    }

    #[test]
    fn hello_with_no_common_base_fails_both_sides() {
        let (client, server) = handshake_pair(
            vec![Version::V10.capability().to_string()],
            vec![Version::V11.capability().to_string()],
        );
        assert!(matches!(client, Err(Error::ProtocolViolation(_))));
        assert!(matches!(server, Err(Error::ProtocolViolation(_))));
    }
}
