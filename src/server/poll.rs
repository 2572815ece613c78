//! Multi-session poll and dispatch
//!
//! A poll set is a mutable collection of server sessions jointly drained
//! by any number of worker threads. Each `poll` call services at most one
//! ready session: it try-locks the session's transport mutex (skipping
//! sessions another worker holds), reads one message, runs the rpc
//! callback and writes the reply, all under the lock. The member scan
//! starts at a rotating offset so a busy early session cannot starve the
//! rest.
//!
//! Sessions are not descriptor-backed on every transport (an SSH channel
//! waits on its bridge, not a pollable fd), so readiness is checked with
//! zero-timeout probes in short sweeps rather than one poll(2) call.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::*;

use crate::error::Error;
use crate::message::MsgType;
use crate::rpc::{Reply, RpcError};
use crate::session::{deadline, remaining_ms, Role, Session, SessionStatus, TermReason};
use crate::transport::PollOutcome;
use crate::xml::Element;

/// Pause between readiness sweeps.
const SWEEP_SLEEP: Duration = Duration::from_millis(10);

/// What one `poll` call did, with the wire-protocol result codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchEvent {
    /// Nothing became ready within the timeout.
    Timeout = 0,
    /// A ready session was serviced but no whole rpc was available yet.
    Dispatched = 1,
    /// The peer closed the session (close-session, EOF, or idle expiry).
    SessionClosed = 2,
    /// An rpc was handled and its reply sent.
    RpcHandled = 3,
    /// The handler rejected the rpc; an rpc-error reply was sent.
    RpcError = 4,
    /// Reading or replying failed; the session is invalid.
    Error = 5,
}

impl DispatchEvent {
    pub fn code(&self) -> u8 {
        *self as u8
    }
}

/// The rpc callback: gets the session and the whole `<rpc>` envelope,
/// returns the reply content or an rpc-error.
pub type RpcHandler<'a> = &'a (dyn Fn(&Session, &Element) -> std::result::Result<Reply, RpcError>
         + Send
         + Sync);

struct Members {
    sessions: Vec<Arc<Session>>,
    offset: usize,
}

/// A set of sessions polled and dispatched together.
pub struct PollSet {
    members: Mutex<Members>,
    /// Seconds of rpc inactivity before a member is dropped; 0 disables.
    idle_timeout: u32,
}

impl Default for PollSet {
    fn default() -> Self {
        PollSet::new()
    }
}

impl PollSet {
    pub fn new() -> PollSet {
        PollSet::with_idle_timeout(0)
    }

    pub fn with_idle_timeout(idle_timeout: u32) -> PollSet {
        PollSet {
            members: Mutex::new(Members {
                sessions: Vec::new(),
                offset: 0,
            }),
            idle_timeout,
        }
    }

    /// Add a server session. The set owns no session lifetime; it holds
    /// plain shared handles.
    pub fn add(&self, session: Arc<Session>) -> crate::error::Result<()> {
        if session.role() != Role::Server {
            return Err(Error::InvalidArg("poll sets hold server sessions".into()));
        }
        let mut members = self.members.lock().unwrap();
        if members
            .sessions
            .iter()
            .any(|s| s.session_id() == session.session_id())
        {
            return Err(Error::InvalidArg(format!(
                "session {} already in the poll set",
                session.session_id()
            )));
        }
        members.sessions.push(session);
        Ok(())
    }

    /// Remove a session by identity. Returns whether it was present.
    pub fn remove(&self, session: &Session) -> bool {
        self.remove_id(session.session_id())
    }

    fn remove_id(&self, id: u32) -> bool {
        let mut members = self.members.lock().unwrap();
        let before = members.sessions.len();
        members.sessions.retain(|s| s.session_id() != id);
        members.sessions.len() != before
    }

    pub fn clear(&self) {
        self.members.lock().unwrap().sessions.clear();
    }

    pub fn len(&self) -> usize {
        self.members.lock().unwrap().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Members in scan order, starting one past where the last scan
    /// started.
    fn snapshot(&self) -> Vec<Arc<Session>> {
        let mut members = self.members.lock().unwrap();
        let n = members.sessions.len();
        if n == 0 {
            return Vec::new();
        }
        members.offset = (members.offset + 1) % n;
        let off = members.offset;
        let mut out = Vec::with_capacity(n);
        out.extend_from_slice(&members.sessions[off..]);
        out.extend_from_slice(&members.sessions[..off]);
        out
    }

    /// Wait up to `timeout_ms` for a member to become readable and
    /// dispatch exactly one. Safe to call from many workers at once; the
    /// try-lock discipline keeps each session on a single worker.
    pub fn poll(
        &self,
        timeout_ms: i32,
        handler: RpcHandler<'_>,
    ) -> (DispatchEvent, Option<Arc<Session>>) {
        let deadline = deadline(timeout_ms);
        loop {
            for session in self.snapshot() {
                if session.status() != SessionStatus::Running {
                    // already torn down; drop our handle
                    self.remove_id(session.session_id());
                    continue;
                }
                if self.idle_expired(&session) {
                    info!("session {} idle timeout", session.session_id());
                    session.teardown(TermReason::Timeout);
                    self.remove_id(session.session_id());
                    return (DispatchEvent::SessionClosed, Some(session));
                }
                let Some(mut io) = session.io_try_lock() else {
                    // another worker is on it
                    continue;
                };
                let ready = match io.transport.poll_readable(0) {
                    Ok(PollOutcome::Ready) => true,
                    Ok(PollOutcome::Timeout) => false,
                    Ok(PollOutcome::Disconnect) => true,
                    Err(e) => {
                        warn!("session {}: {e}", session.session_id());
                        session.set_invalid(TermReason::Dropped);
                        drop(io);
                        self.remove_id(session.session_id());
                        return (DispatchEvent::Error, Some(session));
                    }
                };
                if !ready {
                    continue;
                }
                let event = self.dispatch(&session, &mut io, handler);
                drop(io);
                if session.status() == SessionStatus::Invalid {
                    self.remove_id(session.session_id());
                }
                return (event, Some(session));
            }
            let left = remaining_ms(deadline);
            if left == 0 {
                return (DispatchEvent::Timeout, None);
            }
            let nap = if left < 0 {
                SWEEP_SLEEP
            } else {
                SWEEP_SLEEP.min(Duration::from_millis(left as u64))
            };
            thread::sleep(nap);
        }
    }

    fn idle_expired(&self, session: &Session) -> bool {
        if self.idle_timeout == 0 {
            return false;
        }
        match session.last_activity() {
            Some(at) => at.elapsed() >= Duration::from_secs(self.idle_timeout as u64),
            None => false,
        }
    }

    fn dispatch(
        &self,
        session: &Arc<Session>,
        io: &mut crate::session::SessionIo,
        handler: RpcHandler<'_>,
    ) -> DispatchEvent {
        let rpc = match session.read_msg_with(io, 0) {
            Ok(None) => return DispatchEvent::Dispatched,
            Ok(Some((MsgType::Rpc, rpc))) => rpc,
            // server-side read_msg only surfaces rpc
            Ok(Some((other, _))) => {
                warn!("session {}: unexpected {other:?}", session.session_id());
                return DispatchEvent::Error;
            }
            Err(e) => {
                return if session.termination_reason() == Some(TermReason::Dropped) {
                    debug!("session {} dropped by peer", session.session_id());
                    DispatchEvent::SessionClosed
                } else {
                    warn!("session {}: {e}", session.session_id());
                    DispatchEvent::Error
                };
            }
        };

        let message_id = match rpc.attr("message-id") {
            Some(id) => id.to_string(),
            None => {
                let err = RpcError::new(
                    "rpc",
                    "missing-attribute",
                    Some("rpc without a message-id attribute"),
                );
                let reply = crate::message::build_reply("0", Reply::Errors(vec![err]).into_content());
                let _ = session.write_payload_with(io, &reply);
                return DispatchEvent::RpcError;
            }
        };

        // close-session is answered here; the embedder never sees it
        if rpc
            .first_child()
            .map(|op| op.name == "close-session")
            .unwrap_or(false)
        {
            let reply = crate::message::build_reply(&message_id, Reply::Ok.into_content());
            let _ = session.write_payload_with(io, &reply);
            session.set_invalid(TermReason::Closed);
            debug!("session {} closed by peer", session.session_id());
            return DispatchEvent::SessionClosed;
        }

        let (content, event) = match handler(session, &rpc) {
            Ok(reply) => (reply.into_content(), DispatchEvent::RpcHandled),
            Err(rpc_err) => (
                Reply::Errors(vec![rpc_err]).into_content(),
                DispatchEvent::RpcError,
            ),
        };
        let reply = crate::message::build_reply(&message_id, content);
        match session.write_payload_with(io, &reply) {
            Ok(()) => event,
            Err(e) => {
                warn!("session {} reply failed: {e}", session.session_id());
                DispatchEvent::Error
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_codes_match_protocol() {
        assert_eq!(DispatchEvent::Timeout.code(), 0);
        assert_eq!(DispatchEvent::Dispatched.code(), 1);
        assert_eq!(DispatchEvent::SessionClosed.code(), 2);
        assert_eq!(DispatchEvent::RpcHandled.code(), 3);
        assert_eq!(DispatchEvent::RpcError.code(), 4);
        assert_eq!(DispatchEvent::Error.code(), 5);
    }
}
