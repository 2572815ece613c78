//! Server side: options, acceptors and the poll engine
//!
//! The `Server` value owns everything process-wide: global options, the
//! session-id counter, the listening endpoints, and one option family per
//! transport kind, each behind its own mutex so reconfiguration never
//! stalls unrelated handshakes.

use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use log::*;

use crate::config::{ServerConfig, SshServerConfig, TlsServerConfig};
use crate::error::Result;
use crate::framing::Version;
use crate::session::{run_handshake, Role, SchemaContext, Session, SessionIo};
use crate::transport::{fd::FdTransport, Transport};

pub mod acceptor;
pub mod poll;
pub mod ssh;
pub mod tls;

pub use acceptor::Endpoint;
pub use poll::{DispatchEvent, PollSet};

/// Checks a password for server-side SSH authentication. The library has
/// no user database; the embedder supplies the verdict.
pub type PasswordVerifier = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// A NETCONF server: shared options plus listening state.
pub struct Server {
    config: ServerConfig,
    context: Option<Arc<SchemaContext>>,
    next_session_id: AtomicU32,
    pub(crate) ssh_opts: Mutex<SshServerConfig>,
    pub(crate) tls_opts: Mutex<TlsServerConfig>,
    pub(crate) password_verifier: Mutex<Option<PasswordVerifier>>,
    pub(crate) endpoints: Mutex<Vec<Endpoint>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Server {
        let context = config.schema_searchpath.as_ref().map(|p| {
            Arc::new(SchemaContext {
                searchpath: Some(p.clone()),
            })
        });
        Server {
            config,
            context,
            next_session_id: AtomicU32::new(1),
            ssh_opts: Mutex::new(SshServerConfig::default()),
            tls_opts: Mutex::new(TlsServerConfig::default()),
            password_verifier: Mutex::new(None),
            endpoints: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn context(&self) -> Option<&Arc<SchemaContext>> {
        self.context.as_ref()
    }

    /// Allocate a session id, unique within this process.
    pub(crate) fn next_session_id(&self) -> u32 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Capabilities this server advertises in its hello.
    pub fn capabilities(&self) -> Vec<String> {
        let mut caps = vec![
            Version::V10.capability().to_string(),
            Version::V11.capability().to_string(),
            self.config.with_defaults.capability(),
        ];
        caps.extend(self.config.capabilities.iter().cloned());
        caps
    }

    /// Mutate the SSH option family under its own lock.
    pub fn update_ssh_options(&self, f: impl FnOnce(&mut SshServerConfig)) {
        f(&mut self.ssh_opts.lock().unwrap());
    }

    /// Mutate the TLS option family under its own lock.
    pub fn update_tls_options(&self, f: impl FnOnce(&mut TlsServerConfig)) {
        f(&mut self.tls_opts.lock().unwrap());
    }

    /// Install the password/keyboard-interactive verdict callback.
    pub fn set_password_verifier(&self, verifier: PasswordVerifier) {
        *self.password_verifier.lock().unwrap() = Some(verifier);
    }

    pub(crate) fn snapshot_ssh(&self) -> SshServerConfig {
        self.ssh_opts.lock().unwrap().clone()
    }

    pub(crate) fn snapshot_tls(&self) -> TlsServerConfig {
        self.tls_opts.lock().unwrap().clone()
    }

    pub(crate) fn hello_timeout_ms(&self) -> i32 {
        (self.config.hello_timeout as i64 * 1000).min(i32::MAX as i64) as i32
    }

    /// Build a poll set inheriting this server's idle timeout.
    pub fn new_poll_set(&self) -> PollSet {
        PollSet::with_idle_timeout(self.config.idle_timeout)
    }

    /// Run the hello exchange on an attached transport and freeze the
    /// server-side session.
    pub(crate) fn establish(
        &self,
        transport: Transport,
        username: Option<String>,
        peer_host: Option<String>,
        peer_port: Option<u16>,
    ) -> Result<Arc<Session>> {
        let mut io = SessionIo::new(transport);
        let caps = self.capabilities();
        let sid = self.next_session_id();
        let outcome = run_handshake(&mut io, Role::Server, &caps, Some(sid), self.hello_timeout_ms())?;
        let session = Session::new_running(
            Role::Server,
            io,
            outcome,
            self.context.clone(),
            peer_host,
            peer_port,
            username,
        );
        Ok(Arc::new(session))
    }

    /// Accept a session over a caller-provided descriptor pair, the
    /// inetd-style deployment where the transport already exists.
    pub fn accept_fd(&self, input: OwnedFd, output: OwnedFd) -> Result<Arc<Session>> {
        debug!("accepting session on descriptor pair");
        let transport = Transport::Fd(FdTransport::new(input, output)?);
        self.establish(transport, None, None, None)
    }
}
