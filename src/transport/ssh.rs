//! SSH transport
//!
//! NETCONF over SSH runs in a channel of the `netconf` subsystem, and one
//! SSH connection may carry several such channels, each its own session.
//! The connection is therefore an explicit shared owner: it holds the
//! tokio runtime that drives russh and hands out bridged channels; the
//! sessions keep `Arc` handles to it and the last one dropped tears the
//! connection down.
//!
//! The bridge keeps the rest of the crate synchronous: a pump task per
//! channel forwards inbound bytes into an mpsc the blocking side drains,
//! and writes travel the other way with a oneshot acknowledgement.

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::*;
use russh::client;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::runtime::Runtime;
use tokio::sync::{mpsc as tokio_mpsc, oneshot};

use super::{PollOutcome, ReadOutcome};
use crate::error::{Error, Result};

/// russh client event handler.
///
/// Host-key verification is delegated to the embedder's known-hosts
/// handling; the transport itself accepts the presented key.
pub struct ClientHandler;

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

pub(crate) enum ConnHandle {
    Client(client::Handle<ClientHandler>),
    Server,
}

/// A channel delivered by the server-side SSH handshake.
pub(crate) struct IncomingChannel {
    pub(crate) bridge: Bridge,
}

/// Shared owner of one SSH connection and the runtime driving it.
pub struct SshConnection {
    runtime: Runtime,
    handle: Mutex<ConnHandle>,
    incoming: Option<Mutex<std_mpsc::Receiver<IncomingChannel>>>,
    username: Option<String>,
}

impl std::fmt::Debug for SshConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnection")
            .field("username", &self.username)
            .finish()
    }
}

impl SshConnection {
    pub(crate) fn new_client(runtime: Runtime, handle: client::Handle<ClientHandler>) -> SshConnection {
        SshConnection {
            runtime,
            handle: Mutex::new(ConnHandle::Client(handle)),
            incoming: None,
            username: None,
        }
    }

    pub(crate) fn new_server(
        runtime: Runtime,
        incoming: std_mpsc::Receiver<IncomingChannel>,
        username: String,
    ) -> SshConnection {
        SshConnection {
            runtime,
            handle: Mutex::new(ConnHandle::Server),
            incoming: Some(Mutex::new(incoming)),
            username: Some(username),
        }
    }

    /// Username authenticated during the server-side handshake.
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Open one more `netconf` channel on a client connection; the new
    /// channel backs a sibling session sharing this connection.
    pub(crate) fn open_channel(self: &Arc<Self>) -> Result<SshChannel> {
        let mut guard = self.handle.lock().unwrap();
        match &mut *guard {
            ConnHandle::Client(handle) => {
                let stream = self
                    .runtime
                    .block_on(async {
                        let channel = handle.channel_open_session().await?;
                        channel.request_subsystem(true, "netconf").await?;
                        Ok::<_, russh::Error>(channel.into_stream())
                    })
                    .map_err(|e| Error::Transport(format!("ssh channel open: {e}")))?;
                let bridge = spawn_bridge(self.runtime.handle(), stream);
                debug!("opened netconf subsystem channel");
                Ok(SshChannel::new(Arc::clone(self), bridge))
            }
            ConnHandle::Server => Err(Error::InvalidArg(
                "cannot open channels on a server-side SSH connection".into(),
            )),
        }
    }

    /// Wait for the peer to open one more `netconf` channel on a
    /// server connection. `Ok(None)` on timeout.
    pub(crate) fn accept_channel(self: &Arc<Self>, timeout_ms: i32) -> Result<Option<SshChannel>> {
        let incoming = self.incoming.as_ref().ok_or_else(|| {
            Error::InvalidArg("cannot accept channels on a client-side SSH connection".into())
        })?;
        let guard = incoming.lock().unwrap();
        let chan = if timeout_ms < 0 {
            match guard.recv() {
                Ok(c) => c,
                Err(_) => return Err(Error::Transport("ssh connection closed".into())),
            }
        } else {
            match guard.recv_timeout(Duration::from_millis(timeout_ms as u64)) {
                Ok(c) => c,
                Err(std_mpsc::RecvTimeoutError::Timeout) => return Ok(None),
                Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(Error::Transport("ssh connection closed".into()))
                }
            }
        };
        Ok(Some(SshChannel::new(Arc::clone(self), chan.bridge)))
    }
}

impl Drop for SshConnection {
    fn drop(&mut self) {
        if let Ok(guard) = self.handle.lock() {
            if let ConnHandle::Client(handle) = &*guard {
                debug!("disconnecting ssh connection");
                let _ = self.runtime.block_on(handle.disconnect(
                    russh::Disconnect::ByApplication,
                    "session closed",
                    "en",
                ));
            }
        }
    }
}

pub(crate) struct WriteReq {
    data: Vec<u8>,
    ack: oneshot::Sender<std::io::Result<()>>,
}

/// Blocking-side endpoints of one bridged channel.
pub(crate) struct Bridge {
    data_rx: std_mpsc::Receiver<Vec<u8>>,
    write_tx: Option<tokio_mpsc::UnboundedSender<WriteReq>>,
}

/// Pump a channel stream into mpsc pairs usable from blocking threads.
pub(crate) fn spawn_bridge<S>(handle: &tokio::runtime::Handle, stream: S) -> Bridge
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
{
    let (mut read_half, mut write_half) = tokio::io::split(stream);

    let (data_tx, data_rx) = std_mpsc::channel::<Vec<u8>>();
    handle.spawn(async move {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if data_tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("ssh channel read ended: {e}");
                    break;
                }
            }
        }
    });

    let (write_tx, mut write_rx) = tokio_mpsc::unbounded_channel::<WriteReq>();
    handle.spawn(async move {
        while let Some(req) = write_rx.recv().await {
            let res = write_half.write_all(&req.data).await;
            let failed = res.is_err();
            let _ = req.ack.send(res);
            if failed {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    Bridge {
        data_rx,
        write_tx: Some(write_tx),
    }
}

/// One NETCONF-bearing SSH channel, bridged to blocking I/O.
pub struct SshChannel {
    conn: Arc<SshConnection>,
    bridge: Bridge,
    pending: Vec<u8>,
}

impl std::fmt::Debug for SshChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshChannel")
            .field("conn", &self.conn)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl SshChannel {
    pub(crate) fn new(conn: Arc<SshConnection>, bridge: Bridge) -> SshChannel {
        SshChannel {
            conn,
            bridge,
            pending: Vec::new(),
        }
    }

    /// The shared connection, for opening or accepting sibling channels.
    pub fn connection(&self) -> &Arc<SshConnection> {
        &self.conn
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome> {
        if self.pending.is_empty() {
            match self.bridge.data_rx.try_recv() {
                Ok(data) => self.pending = data,
                Err(std_mpsc::TryRecvError::Empty) => return Ok(ReadOutcome::WouldBlock),
                Err(std_mpsc::TryRecvError::Disconnected) => return Ok(ReadOutcome::Eof),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(ReadOutcome::Data(n))
    }

    pub fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let write_tx = self
            .bridge
            .write_tx
            .as_ref()
            .ok_or_else(|| Error::Transport("ssh channel already shut down".into()))?;
        let (ack_tx, ack_rx) = oneshot::channel();
        write_tx
            .send(WriteReq {
                data: data.to_vec(),
                ack: ack_tx,
            })
            .map_err(|_| Error::Transport("ssh channel closed".into()))?;
        match ack_rx.blocking_recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::Transport(format!("ssh write: {e}"))),
            Err(_) => Err(Error::Transport("ssh writer task gone".into())),
        }
    }

    pub fn poll_readable(&mut self, timeout_ms: i32) -> Result<PollOutcome> {
        if !self.pending.is_empty() {
            return Ok(PollOutcome::Ready);
        }
        if timeout_ms < 0 {
            return match self.bridge.data_rx.recv() {
                Ok(data) => {
                    self.pending = data;
                    Ok(PollOutcome::Ready)
                }
                Err(_) => Ok(PollOutcome::Disconnect),
            };
        }
        match self
            .bridge
            .data_rx
            .recv_timeout(Duration::from_millis(timeout_ms as u64))
        {
            Ok(data) => {
                self.pending = data;
                Ok(PollOutcome::Ready)
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => Ok(PollOutcome::Timeout),
            Err(std_mpsc::RecvTimeoutError::Disconnected) => Ok(PollOutcome::Disconnect),
        }
    }

    /// Close the channel's write side; the peer sees EOF.
    pub fn shutdown(&mut self) {
        self.bridge.write_tx = None;
    }
}
