//! Server-side SSH handshake and authentication
//!
//! An accepted TCP connection is handed to russh, which runs the key
//! exchange and calls back into the handler for every authentication
//! attempt and channel request. The handler enforces the configured
//! method set and attempt limit, checks public keys against the
//! authorized-key list and passwords against the embedder's verifier,
//! and forwards every `netconf` subsystem channel (the first one and any
//! later siblings) to the blocking side through the connection's queue.

use std::collections::HashMap;
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;

use log::*;
use russh::keys::{load_public_key, load_secret_key, PublicKey};
use russh::server::{self, Auth, Msg};
use russh::{Channel, ChannelId, MethodSet};

use super::{PasswordVerifier, Server};
use crate::config::{SshAuthMethod, SshServerConfig};
use crate::error::{Error, Result};
use crate::transport::ssh::{spawn_bridge, IncomingChannel, SshConnection};

/// One authorized key, loaded and bound to its username.
struct LoadedKey {
    key: PublicKey,
    username: String,
}

struct ServerHandler {
    methods: Vec<SshAuthMethod>,
    attempts_left: u16,
    authorized: Arc<Vec<LoadedKey>>,
    verifier: Option<PasswordVerifier>,
    user_tx: std_mpsc::Sender<String>,
    chan_tx: std_mpsc::Sender<IncomingChannel>,
    session_channels: HashMap<ChannelId, Channel<Msg>>,
}

impl ServerHandler {
    fn method_enabled(&self, method: SshAuthMethod) -> bool {
        self.methods.contains(&method)
    }

    /// Burn one attempt; when the limit is hit the connection dies.
    fn note_attempt(&mut self) -> std::result::Result<(), russh::Error> {
        if self.attempts_left == 0 {
            info!("authentication attempt limit reached, disconnecting");
            return Err(russh::Error::Disconnect);
        }
        self.attempts_left -= 1;
        Ok(())
    }

    fn accept_user(&mut self, user: &str) -> Auth {
        info!("user \"{user}\" authenticated");
        let _ = self.user_tx.send(user.to_string());
        Auth::Accept
    }

    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
        }
    }

    fn check_password(&self, user: &str, password: &str) -> bool {
        match &self.verifier {
            Some(verifier) => verifier(user, password),
            None => {
                warn!("password authentication attempted without a verifier");
                false
            }
        }
    }
}

impl server::Handler for ServerHandler {
    type Error = russh::Error;

    async fn auth_password(
        &mut self,
        user: &str,
        password: &str,
    ) -> std::result::Result<Auth, Self::Error> {
        if !self.method_enabled(SshAuthMethod::Password) {
            return Ok(Self::reject());
        }
        self.note_attempt()?;
        if self.check_password(user, password) {
            Ok(self.accept_user(user))
        } else {
            debug!("password rejected for \"{user}\"");
            Ok(Self::reject())
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> std::result::Result<Auth, Self::Error> {
        if !self.method_enabled(SshAuthMethod::Publickey) {
            return Ok(Self::reject());
        }
        self.note_attempt()?;
        let authorized = self
            .authorized
            .iter()
            .any(|k| k.username == user && &k.key == public_key);
        if authorized {
            Ok(self.accept_user(user))
        } else {
            debug!("public key rejected for \"{user}\"");
            Ok(Self::reject())
        }
    }

    async fn auth_keyboard_interactive(
        &mut self,
        user: &str,
        _submethods: &str,
        response: Option<server::Response<'_>>,
    ) -> std::result::Result<Auth, Self::Error> {
        if !self.method_enabled(SshAuthMethod::Interactive) {
            return Ok(Self::reject());
        }
        match response {
            None => Ok(Auth::Partial {
                name: "".into(),
                instructions: "".into(),
                prompts: vec![("Password: ".into(), false)].into(),
            }),
            Some(mut response) => {
                self.note_attempt()?;
                let answer = response
                    .next()
                    .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                    .unwrap_or_default();
                if self.check_password(user, &answer) {
                    Ok(self.accept_user(user))
                } else {
                    debug!("keyboard-interactive rejected for \"{user}\"");
                    Ok(Self::reject())
                }
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut server::Session,
    ) -> std::result::Result<bool, Self::Error> {
        self.session_channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut server::Session,
    ) -> std::result::Result<(), Self::Error> {
        if name != "netconf" {
            debug!("rejecting subsystem \"{name}\"");
            let _ = session.channel_failure(channel_id);
            return Ok(());
        }
        let Some(channel) = self.session_channels.remove(&channel_id) else {
            let _ = session.channel_failure(channel_id);
            return Ok(());
        };
        let _ = session.channel_success(channel_id);
        let bridge = spawn_bridge(&tokio::runtime::Handle::current(), channel.into_stream());
        let _ = self.chan_tx.send(IncomingChannel { bridge });
        Ok(())
    }
}

fn build_russh_config(opts: &SshServerConfig) -> Result<server::Config> {
    let mut config = server::Config::default();
    if opts.hostkeys.is_empty() {
        return Err(Error::InvalidArg("no ssh hostkey configured".into()));
    }
    for path in &opts.hostkeys {
        let key = load_secret_key(path, None)
            .map_err(|e| Error::InvalidArg(format!("hostkey {}: {e}", path.display())))?;
        config.keys.push(key);
    }
    if let Some(banner) = &opts.banner {
        config.auth_banner = Some(Box::leak(banner.clone().into_boxed_str()));
    }
    let mut methods = MethodSet::empty();
    for m in &opts.auth_methods {
        methods |= match m {
            SshAuthMethod::Publickey => MethodSet::PUBLICKEY,
            SshAuthMethod::Password => MethodSet::PASSWORD,
            SshAuthMethod::Interactive => MethodSet::KEYBOARD_INTERACTIVE,
        };
    }
    config.methods = methods;
    Ok(config)
}

fn load_authorized_keys(opts: &SshServerConfig) -> Vec<LoadedKey> {
    let mut keys = Vec::new();
    for entry in &opts.authorized_keys {
        match load_public_key(&entry.pubkey) {
            Ok(key) => keys.push(LoadedKey {
                key,
                username: entry.username.clone(),
            }),
            Err(e) => warn!("skipping authorized key {}: {e}", entry.pubkey.display()),
        }
    }
    keys
}

/// Run the SSH handshake and user authentication on an accepted socket.
/// Succeeds once a user is authenticated; the netconf channels arrive on
/// the returned connection's queue.
pub(crate) fn ssh_accept(
    server: &Server,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<Arc<SshConnection>> {
    let opts = server.snapshot_ssh();
    let config = Arc::new(build_russh_config(&opts)?);
    let authorized = Arc::new(load_authorized_keys(&opts));
    let verifier = server.password_verifier.lock().unwrap().clone();
    let auth_timeout = Duration::from_secs(opts.auth_timeout as u64);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .map_err(|e| Error::Transport(format!("runtime setup: {e}")))?;

    let (user_tx, user_rx) = std_mpsc::channel();
    let (chan_tx, chan_rx) = std_mpsc::channel();
    let handler = ServerHandler {
        methods: opts.auth_methods.clone(),
        attempts_left: opts.auth_attempts,
        authorized,
        verifier,
        user_tx,
        chan_tx,
        session_channels: HashMap::new(),
    };

    stream
        .set_nonblocking(true)
        .map_err(|e| Error::Transport(format!("socket: {e}")))?;
    runtime.spawn(async move {
        let stream = match tokio::net::TcpStream::from_std(stream) {
            Ok(s) => s,
            Err(e) => {
                warn!("ssh accept from {peer}: {e}");
                return;
            }
        };
        match server::run_stream(config, stream, handler).await {
            Ok(session) => {
                if let Err(e) = session.await {
                    debug!("ssh connection from {peer} ended: {e}");
                }
            }
            Err(e) => info!("ssh handshake with {peer} failed: {e}"),
        }
    });

    let username = user_rx
        .recv_timeout(auth_timeout)
        .map_err(|_| Error::AuthFailed(format!("no user authenticated from {peer}")))?;
    Ok(Arc::new(SshConnection::new_server(
        runtime, chan_rx, username,
    )))
}
