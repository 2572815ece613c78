//! TLS transport
//!
//! rustls does no I/O of its own, so the transport pumps TLS records
//! between the socket and the connection object by hand: ciphertext in via
//! `read_tls`/`process_new_packets`, ciphertext out via `write_tls`. The
//! socket is non-blocking after the handshake; readability waits go
//! through poll(2) on the descriptor.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::fd::AsFd;
use std::sync::Arc;
use std::thread;

use log::*;
use rustls::pki_types::{
    CertificateDer, CertificateRevocationListDer, PrivateKeyDer, ServerName,
};
use rustls::{ClientConnection, Connection, ServerConnection};

use super::{poll_fd_readable, PollOutcome, ReadOutcome, IO_RETRY_SLEEP};
use crate::config::PemSource;
use crate::error::{Error, Result};

fn pem_bytes(source: &PemSource) -> Result<Vec<u8>> {
    match source {
        PemSource::Path(path) => std::fs::read(path)
            .map_err(|e| Error::InvalidArg(format!("reading {}: {e}", path.display()))),
        PemSource::Inline(pem) => Ok(pem.clone().into_bytes()),
    }
}

/// Load every certificate in a PEM source.
pub(crate) fn load_certs(source: &PemSource) -> Result<Vec<CertificateDer<'static>>> {
    let bytes = pem_bytes(source)?;
    rustls_pemfile::certs(&mut bytes.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::InvalidArg(format!("certificate pem: {e}")))
}

/// Load the first private key in a PEM source.
pub(crate) fn load_private_key(source: &PemSource) -> Result<PrivateKeyDer<'static>> {
    let bytes = pem_bytes(source)?;
    rustls_pemfile::private_key(&mut bytes.as_slice())
        .map_err(|e| Error::InvalidArg(format!("key pem: {e}")))?
        .ok_or_else(|| Error::InvalidArg("no private key in pem".into()))
}

/// Load every CRL in a PEM source.
pub(crate) fn load_crls(source: &PemSource) -> Result<Vec<CertificateRevocationListDer<'static>>> {
    let bytes = pem_bytes(source)?;
    rustls_pemfile::crls(&mut bytes.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::InvalidArg(format!("crl pem: {e}")))
}

#[derive(Debug)]
pub struct TlsTransport {
    sock: TcpStream,
    conn: Connection,
}

impl TlsTransport {
    /// Run a client-side handshake over a connected socket.
    pub fn connect(
        sock: TcpStream,
        config: Arc<rustls::ClientConfig>,
        server_name: ServerName<'static>,
    ) -> Result<TlsTransport> {
        let conn = ClientConnection::new(config, server_name)
            .map_err(|e| Error::Transport(format!("tls client setup: {e}")))?;
        Self::handshake(sock, Connection::Client(conn))
    }

    /// Run a server-side handshake over an accepted socket.
    pub fn accept(sock: TcpStream, config: Arc<rustls::ServerConfig>) -> Result<TlsTransport> {
        let conn = ServerConnection::new(config)
            .map_err(|e| Error::Transport(format!("tls server setup: {e}")))?;
        Self::handshake(sock, Connection::Server(conn))
    }

    fn handshake(sock: TcpStream, mut conn: Connection) -> Result<TlsTransport> {
        sock.set_nonblocking(false)
            .map_err(|e| Error::Transport(format!("tls socket: {e}")))?;
        let mut sock = sock;
        while conn.is_handshaking() {
            conn.complete_io(&mut sock)
                .map_err(|e| Error::AuthFailed(format!("tls handshake: {e}")))?;
        }
        sock.set_nonblocking(true)
            .map_err(|e| Error::Transport(format!("tls socket: {e}")))?;
        debug!("tls handshake complete");
        Ok(TlsTransport { sock, conn })
    }

    /// The peer's end-entity certificate, when one was presented.
    pub fn peer_certificate(&self) -> Option<CertificateDer<'static>> {
        self.conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|c| c.clone().into_owned())
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome> {
        loop {
            match self.conn.reader().read(buf) {
                Ok(0) => return Ok(ReadOutcome::Eof),
                Ok(n) => return Ok(ReadOutcome::Data(n)),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    // no buffered plaintext; try to pull more records
                    match self.conn.read_tls(&mut self.sock) {
                        Ok(0) => return Ok(ReadOutcome::Eof),
                        Ok(_) => {
                            self.conn.process_new_packets().map_err(|e| {
                                Error::MalformedMessage(format!("tls record: {e}"))
                            })?;
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            return Ok(ReadOutcome::WouldBlock)
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(Error::Transport(format!("tls read: {e}"))),
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(ReadOutcome::Eof)
                }
                Err(e) => return Err(Error::Transport(format!("tls read: {e}"))),
            }
        }
    }

    pub fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.conn
            .writer()
            .write_all(data)
            .map_err(|e| Error::Transport(format!("tls write: {e}")))?;
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut self.sock) {
                Ok(_) => {}
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::Interrupted =>
                {
                    thread::sleep(IO_RETRY_SLEEP);
                }
                Err(e) => return Err(Error::Transport(format!("tls write: {e}"))),
            }
        }
        Ok(())
    }

    pub fn poll_readable(&mut self, timeout_ms: i32) -> Result<PollOutcome> {
        // plaintext already decrypted counts as readable
        if let Ok(state) = self.conn.process_new_packets() {
            if state.plaintext_bytes_to_read() > 0 {
                return Ok(PollOutcome::Ready);
            }
        }
        poll_fd_readable(self.sock.as_fd(), timeout_ms)
    }

    pub fn shutdown(&mut self) {
        self.conn.send_close_notify();
        while self.conn.wants_write() {
            if self.conn.write_tls(&mut self.sock).is_err() {
                break;
            }
        }
        let _ = self.sock.shutdown(std::net::Shutdown::Both);
    }
}
