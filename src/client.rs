//! Client-side session establishment
//!
//! Connectors for the three transports plus the call-home listener of
//! RFC 8071, where the management station listens and the device dials
//! out. All of them end in the same place: a transport attached to a
//! fresh session and the hello exchange run against the configured
//! timeout.

use std::net::{TcpListener, TcpStream};
use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;

use log::*;
use russh::client;
use russh::keys::{load_secret_key, PrivateKeyWithHashAlg};
use rustls::pki_types::ServerName;

use crate::config::{ClientConfig, ClientSshConfig, ClientTlsConfig, SshAuthMethod};
use crate::error::{Error, Result};
use crate::framing::Version;
use crate::session::{run_handshake, Role, SchemaContext, Session, SessionIo};
use crate::transport::ssh::{ClientHandler, SshConnection};
use crate::transport::tls::{load_certs, load_crls, load_private_key, TlsTransport};
use crate::transport::{fd::FdTransport, poll_fd_readable, PollOutcome, Transport, TransportKind};

/// Capabilities a client advertises: both base versions plus extras.
fn local_capabilities(config: &ClientConfig) -> Vec<String> {
    let mut caps = vec![
        Version::V10.capability().to_string(),
        Version::V11.capability().to_string(),
    ];
    caps.extend(config.capabilities.iter().cloned());
    caps
}

fn schema_context(config: &ClientConfig) -> Option<Arc<SchemaContext>> {
    config.schema_searchpath.as_ref().map(|p| {
        Arc::new(SchemaContext {
            searchpath: Some(p.clone()),
        })
    })
}

/// Run the hello exchange and freeze the session.
fn establish(
    config: &ClientConfig,
    transport: Transport,
    peer_host: Option<String>,
    peer_port: Option<u16>,
) -> Result<Session> {
    let mut io = SessionIo::new(transport);
    let caps = local_capabilities(config);
    let timeout_ms = (config.hello_timeout as i64 * 1000).min(i32::MAX as i64) as i32;
    let outcome = run_handshake(&mut io, Role::Client, &caps, None, timeout_ms)?;
    Ok(Session::new_running(
        Role::Client,
        io,
        outcome,
        schema_context(config),
        peer_host,
        peer_port,
        None,
    ))
}

/// Connect over a caller-provided descriptor pair (e.g. pipes to an
/// inetd-style server).
pub fn connect_fd(config: &ClientConfig, input: OwnedFd, output: OwnedFd) -> Result<Session> {
    let transport = Transport::Fd(FdTransport::new(input, output)?);
    establish(config, transport, None, None)
}

/// Connect over SSH, authenticate, and open the first `netconf` channel.
pub fn connect_ssh(config: &ClientConfig, host: &str, port: u16) -> Result<Session> {
    let conn = ssh_connect(config, host, port)?;
    let channel = conn.open_channel()?;
    establish(
        config,
        Transport::Ssh(channel),
        Some(host.to_string()),
        Some(port),
    )
}

/// Open one more session multiplexed over an established SSH connection.
pub fn connect_ssh_channel(config: &ClientConfig, conn: &Arc<SshConnection>) -> Result<Session> {
    let channel = conn.open_channel()?;
    establish(config, Transport::Ssh(channel), None, None)
}

/// Connect over TLS.
pub fn connect_tls(config: &ClientConfig, host: &str, port: u16) -> Result<Session> {
    let sock = TcpStream::connect((host, port))
        .map_err(|e| Error::Transport(format!("tcp connect {host}:{port}: {e}")))?;
    let tls = tls_handshake(&config.tls, sock, host)?;
    establish(
        config,
        Transport::Tls(tls),
        Some(host.to_string()),
        Some(port),
    )
}

fn tls_handshake(tls: &ClientTlsConfig, sock: TcpStream, host: &str) -> Result<TlsTransport> {
    let tls_config = client_tls_config(tls)?;
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| Error::InvalidArg(format!("server name {host}: {e}")))?;
    TlsTransport::connect(sock, tls_config, server_name)
}

fn client_tls_config(cfg: &ClientTlsConfig) -> Result<Arc<rustls::ClientConfig>> {
    let mut roots = rustls::RootCertStore::empty();
    for source in &cfg.trusted_cas {
        for cert in load_certs(source)? {
            roots
                .add(cert)
                .map_err(|e| Error::InvalidArg(format!("trusted certificate: {e}")))?;
        }
    }
    let builder = if cfg.crls.is_empty() {
        rustls::ClientConfig::builder().with_root_certificates(roots)
    } else {
        let mut crls = Vec::new();
        for source in &cfg.crls {
            crls.extend(load_crls(source)?);
        }
        let verifier = rustls::client::WebPkiServerVerifier::builder(Arc::new(roots))
            .with_crls(crls)
            .build()
            .map_err(|e| Error::InvalidArg(format!("server verifier: {e}")))?;
        rustls::ClientConfig::builder().with_webpki_verifier(verifier)
    };
    let config = match (&cfg.cert, &cfg.key) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_certs(cert)?, load_private_key(key)?)
            .map_err(|e| Error::InvalidArg(format!("client certificate: {e}")))?,
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(Error::InvalidArg(
                "client certificate and key must be configured together".into(),
            ))
        }
    };
    Ok(Arc::new(config))
}

fn ssh_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .map_err(|e| Error::Transport(format!("runtime setup: {e}")))
}

fn ssh_connect(config: &ClientConfig, host: &str, port: u16) -> Result<Arc<SshConnection>> {
    let runtime = ssh_runtime()?;
    let ssh_config = Arc::new(client::Config::default());
    let mut handle = runtime
        .block_on(client::connect(ssh_config, (host, port), ClientHandler))
        .map_err(|e| Error::Transport(format!("ssh connect {host}:{port}: {e}")))?;
    ssh_authenticate(&config.ssh, &runtime, &mut handle)?;
    Ok(Arc::new(SshConnection::new_client(runtime, handle)))
}

fn ssh_connect_stream(config: &ClientConfig, stream: TcpStream) -> Result<Arc<SshConnection>> {
    let runtime = ssh_runtime()?;
    stream
        .set_nonblocking(true)
        .map_err(|e| Error::Transport(format!("socket: {e}")))?;
    let ssh_config = Arc::new(client::Config::default());
    let mut handle = runtime
        .block_on(async {
            let stream = tokio::net::TcpStream::from_std(stream)?;
            client::connect_stream(ssh_config, stream, ClientHandler)
                .await
                .map_err(std::io::Error::other)
        })
        .map_err(|e| Error::Transport(format!("ssh handshake: {e}")))?;
    ssh_authenticate(&config.ssh, &runtime, &mut handle)?;
    Ok(Arc::new(SshConnection::new_client(runtime, handle)))
}

/// Try the enabled authentication methods in preference order; larger
/// preference wins, negative disables.
fn ssh_authenticate(
    ssh: &ClientSshConfig,
    runtime: &tokio::runtime::Runtime,
    handle: &mut client::Handle<ClientHandler>,
) -> Result<()> {
    if ssh.username.is_empty() {
        return Err(Error::InvalidArg("ssh username not configured".into()));
    }
    let mut methods: Vec<(SshAuthMethod, i16)> = ssh
        .auth_preference
        .iter()
        .copied()
        .filter(|(_, pref)| *pref >= 0)
        .collect();
    methods.sort_by_key(|(_, pref)| std::cmp::Reverse(*pref));

    for (method, _) in methods {
        match method {
            SshAuthMethod::Publickey => {
                for keypair in &ssh.keypairs {
                    let key = match load_secret_key(&keypair.private_key, keypair.passphrase.as_deref())
                    {
                        Ok(key) => key,
                        Err(e) => {
                            warn!("skipping key {:?}: {e}", keypair.private_key);
                            continue;
                        }
                    };
                    let key = PrivateKeyWithHashAlg::new(Arc::new(key), None);
                    let auth = runtime
                        .block_on(handle.authenticate_publickey(&ssh.username, key))
                        .map_err(|e| Error::Transport(format!("ssh auth: {e}")))?;
                    if auth.success() {
                        debug!("publickey authentication succeeded");
                        return Ok(());
                    }
                }
            }
            SshAuthMethod::Password => {
                if let Some(password) = &ssh.password {
                    let auth = runtime
                        .block_on(handle.authenticate_password(&ssh.username, password))
                        .map_err(|e| Error::Transport(format!("ssh auth: {e}")))?;
                    if auth.success() {
                        debug!("password authentication succeeded");
                        return Ok(());
                    }
                }
            }
            SshAuthMethod::Interactive => {
                if let Some(password) = &ssh.password {
                    if ssh_auth_interactive(runtime, handle, &ssh.username, password)? {
                        debug!("keyboard-interactive authentication succeeded");
                        return Ok(());
                    }
                }
            }
        }
    }
    Err(Error::AuthFailed(format!(
        "no authentication method accepted for \"{}\"",
        ssh.username
    )))
}

/// Keyboard-interactive, answering every prompt with the configured
/// password.
fn ssh_auth_interactive(
    runtime: &tokio::runtime::Runtime,
    handle: &mut client::Handle<ClientHandler>,
    username: &str,
    password: &str,
) -> Result<bool> {
    use russh::client::KeyboardInteractiveAuthResponse as Kb;

    let mut response = runtime
        .block_on(handle.authenticate_keyboard_interactive_start(username, None))
        .map_err(|e| Error::Transport(format!("ssh auth: {e}")))?;
    loop {
        match response {
            Kb::Success => return Ok(true),
            Kb::InfoRequest { prompts, .. } => {
                let answers = vec![password.to_string(); prompts.len()];
                response = runtime
                    .block_on(handle.authenticate_keyboard_interactive_respond(answers))
                    .map_err(|e| Error::Transport(format!("ssh auth: {e}")))?;
            }
            _ => return Ok(false),
        }
    }
}

/// Listening side of call home: the client binds, the server dials.
pub struct CallHomeListener {
    listener: TcpListener,
}

impl CallHomeListener {
    pub fn bind(address: &str, port: u16) -> Result<CallHomeListener> {
        let listener = TcpListener::bind((address, port))
            .map_err(|e| Error::Transport(format!("bind {address}:{port}: {e}")))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| Error::Transport(format!("socket: {e}")))?;
        info!("call home listening on {address}:{port}");
        Ok(CallHomeListener { listener })
    }

    /// Wait for a dial-in and run the client-side transport handshake
    /// plus hello over it. `Ok(None)` on timeout.
    pub fn accept(
        &self,
        config: &ClientConfig,
        kind: TransportKind,
        timeout_ms: i32,
    ) -> Result<Option<Session>> {
        match poll_fd_readable(self.listener.as_fd(), timeout_ms)? {
            PollOutcome::Ready => {}
            PollOutcome::Timeout => return Ok(None),
            PollOutcome::Disconnect => {
                return Err(Error::Transport("call home listener closed".into()))
            }
        }
        let (stream, peer) = self
            .listener
            .accept()
            .map_err(|e| Error::Transport(format!("accept: {e}")))?;
        stream
            .set_nonblocking(false)
            .map_err(|e| Error::Transport(format!("socket: {e}")))?;
        info!("call home connection from {peer}");
        let host = peer.ip().to_string();
        let session = match kind {
            TransportKind::Ssh => {
                let conn = ssh_connect_stream(config, stream)?;
                let channel = conn.open_channel()?;
                establish(
                    config,
                    Transport::Ssh(channel),
                    Some(host),
                    Some(peer.port()),
                )?
            }
            TransportKind::Tls => {
                let tls = tls_handshake(&config.tls, stream, &host)?;
                establish(config, Transport::Tls(tls), Some(host), Some(peer.port()))?
            }
            TransportKind::Fd => {
                return Err(Error::InvalidArg("call home requires ssh or tls".into()))
            }
        };
        Ok(Some(session))
    }
}
