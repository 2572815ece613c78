//! Listening endpoints and session acceptance
//!
//! Endpoints are named and keyed by (name, transport kind); all CRUD goes
//! through the bind-list mutex. `accept` polls every listening socket in
//! short slices (so reconfiguration can interleave), runs the transport
//! handshake for whichever kind fired, and finishes with the NETCONF
//! hello. Call home reverses only the TCP direction: the server dials and
//! then behaves exactly as if it had accepted.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsFd;
use std::sync::Arc;

use log::*;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use super::{ssh, tls, Server};
use crate::error::{Error, Result};
use crate::session::{deadline, remaining_ms, Session};
use crate::transport::ssh::SshConnection;
use crate::transport::{Transport, TransportKind};

/// Width of one listening-socket poll slice.
const ACCEPT_SLICE_MS: i32 = 200;

/// One named listening endpoint.
#[derive(Debug)]
pub struct Endpoint {
    name: String,
    kind: TransportKind,
    address: String,
    port: u16,
    listener: TcpListener,
}

impl Endpoint {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

fn bind(address: &str, port: u16) -> Result<TcpListener> {
    let listener = TcpListener::bind((address, port))
        .map_err(|e| Error::Transport(format!("bind {address}:{port}: {e}")))?;
    listener
        .set_nonblocking(true)
        .map_err(|e| Error::Transport(format!("socket: {e}")))?;
    Ok(listener)
}

impl Server {
    /// Create a listening endpoint. The (name, kind) pair must be unique.
    pub fn add_endpoint(
        &self,
        name: &str,
        kind: TransportKind,
        address: &str,
        port: u16,
    ) -> Result<()> {
        if kind == TransportKind::Fd {
            return Err(Error::InvalidArg(
                "fd transports have no listening endpoint".into(),
            ));
        }
        let mut endpoints = self.endpoints.lock().unwrap();
        if endpoints.iter().any(|e| e.name == name && e.kind == kind) {
            return Err(Error::InvalidArg(format!(
                "endpoint \"{name}\" ({kind:?}) already exists"
            )));
        }
        let listener = bind(address, port)?;
        info!("endpoint \"{name}\" ({kind:?}) listening on {address}:{port}");
        endpoints.push(Endpoint {
            name: name.to_string(),
            kind,
            address: address.to_string(),
            port,
            listener,
        });
        Ok(())
    }

    /// Rebind an endpoint to a new address.
    pub fn set_endpoint_address(
        &self,
        name: &str,
        kind: TransportKind,
        address: &str,
    ) -> Result<()> {
        let mut endpoints = self.endpoints.lock().unwrap();
        let ep = endpoints
            .iter_mut()
            .find(|e| e.name == name && e.kind == kind)
            .ok_or_else(|| Error::InvalidArg(format!("no endpoint \"{name}\" ({kind:?})")))?;
        ep.listener = bind(address, ep.port)?;
        ep.address = address.to_string();
        Ok(())
    }

    /// Rebind an endpoint to a new port.
    pub fn set_endpoint_port(&self, name: &str, kind: TransportKind, port: u16) -> Result<()> {
        let mut endpoints = self.endpoints.lock().unwrap();
        let ep = endpoints
            .iter_mut()
            .find(|e| e.name == name && e.kind == kind)
            .ok_or_else(|| Error::InvalidArg(format!("no endpoint \"{name}\" ({kind:?})")))?;
        ep.listener = bind(&ep.address, port)?;
        ep.port = port;
        Ok(())
    }

    /// Drop an endpoint. Returns whether it existed.
    pub fn del_endpoint(&self, name: &str, kind: TransportKind) -> bool {
        let mut endpoints = self.endpoints.lock().unwrap();
        let before = endpoints.len();
        endpoints.retain(|e| !(e.name == name && e.kind == kind));
        endpoints.len() != before
    }

    /// Visit the configured endpoints.
    pub fn with_endpoints<R>(&self, f: impl FnOnce(&[Endpoint]) -> R) -> R {
        f(&self.endpoints.lock().unwrap())
    }

    /// Wait for a connection on any endpoint and turn it into a running
    /// session. `Ok(None)` on timeout; authentication failures close the
    /// TCP connection and surface as `AuthFailed`.
    pub fn accept(&self, timeout_ms: i32) -> Result<Option<Arc<Session>>> {
        let deadline = deadline(timeout_ms);
        loop {
            let accepted = {
                let endpoints = self.endpoints.lock().unwrap();
                if endpoints.is_empty() {
                    return Err(Error::InvalidArg("no listening endpoints configured".into()));
                }
                let mut fds: Vec<PollFd> = endpoints
                    .iter()
                    .map(|e| PollFd::new(e.listener.as_fd(), PollFlags::POLLIN))
                    .collect();
                let left = remaining_ms(deadline);
                let slice = if left < 0 {
                    ACCEPT_SLICE_MS
                } else {
                    left.min(ACCEPT_SLICE_MS)
                };
                match poll(&mut fds, PollTimeout::try_from(slice).unwrap_or(PollTimeout::MAX)) {
                    Ok(0) | Err(Errno::EINTR) => None,
                    Ok(_) => {
                        let ready = fds.iter().position(|fd| {
                            fd.revents()
                                .map(|r| r.contains(PollFlags::POLLIN))
                                .unwrap_or(false)
                        });
                        match ready {
                            Some(i) => match endpoints[i].listener.accept() {
                                Ok((stream, peer)) => Some((endpoints[i].kind, stream, peer)),
                                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => None,
                                Err(e) => return Err(Error::Transport(format!("accept: {e}"))),
                            },
                            None => None,
                        }
                    }
                    Err(e) => return Err(Error::Transport(format!("poll: {e}"))),
                }
            };
            if let Some((kind, stream, peer)) = accepted {
                return self.accept_stream(kind, stream, peer).map(Some);
            }
            if remaining_ms(deadline) == 0 {
                return Ok(None);
            }
        }
    }

    /// Transport handshake + hello on a fresh TCP connection.
    fn accept_stream(
        &self,
        kind: TransportKind,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<Arc<Session>> {
        info!("incoming {kind:?} connection from {peer}");
        let host = peer.ip().to_string();
        match kind {
            TransportKind::Ssh => {
                let conn = ssh::ssh_accept(self, stream, peer)?;
                let channel = conn
                    .accept_channel(self.hello_timeout_ms())?
                    .ok_or(Error::Timeout)?;
                let username = conn.username().map(str::to_string);
                self.establish(
                    Transport::Ssh(channel),
                    username,
                    Some(host),
                    Some(peer.port()),
                )
            }
            TransportKind::Tls => {
                let (tls, username) = tls::tls_accept(self, stream)?;
                self.establish(Transport::Tls(tls), username, Some(host), Some(peer.port()))
            }
            TransportKind::Fd => Err(Error::InvalidArg("fd transports are not accepted".into())),
        }
    }

    /// Turn a further `netconf` channel on an accepted SSH connection
    /// into a sibling session. `Ok(None)` on timeout.
    pub fn accept_ssh_channel(
        &self,
        conn: &Arc<SshConnection>,
        timeout_ms: i32,
    ) -> Result<Option<Arc<Session>>> {
        match conn.accept_channel(timeout_ms)? {
            None => Ok(None),
            Some(channel) => {
                let username = conn.username().map(str::to_string);
                self.establish(Transport::Ssh(channel), username, None, None)
                    .map(Some)
            }
        }
    }

    /// Call home: dial the management station, then run the normal
    /// server-side handshake over the outbound connection.
    pub fn connect_callhome(
        &self,
        host: &str,
        port: u16,
        kind: TransportKind,
    ) -> Result<Arc<Session>> {
        let stream = TcpStream::connect((host, port))
            .map_err(|e| Error::Transport(format!("call home {host}:{port}: {e}")))?;
        let peer = stream
            .peer_addr()
            .map_err(|e| Error::Transport(format!("socket: {e}")))?;
        info!("call home connected to {peer}");
        self.accept_stream(kind, stream, peer)
    }
}
