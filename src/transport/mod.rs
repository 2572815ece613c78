//! Transports for NETCONF
//!
//! A session does its I/O through one of three byte-stream backends: a raw
//! file-descriptor pair, an SSH channel, or a TLS connection. The backend
//! is a closed tagged union; every variant exposes the same three
//! operations: a non-blocking read, a blocking whole-buffer write, and a
//! readability wait, which is the only call allowed to block for long.

use std::os::fd::BorrowedFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::error::{Error, Result};

pub mod fd;
pub mod ssh;
pub mod tls;

/// Sleep between retries of EAGAIN-ish short reads and writes.
pub(crate) const IO_RETRY_SLEEP: Duration = Duration::from_micros(100);

/// Which backend a session runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Fd,
    Ssh,
    Tls,
}

/// Result of a non-blocking read.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were placed at the start of the buffer.
    Data(usize),
    /// Nothing to read right now.
    WouldBlock,
    /// Orderly end of stream.
    Eof,
}

/// Result of a readability wait.
#[derive(Debug, PartialEq, Eq)]
pub enum PollOutcome {
    Ready,
    Timeout,
    Disconnect,
}

/// A session's byte-stream backend.
#[derive(Debug)]
pub enum Transport {
    Fd(fd::FdTransport),
    Ssh(ssh::SshChannel),
    Tls(tls::TlsTransport),
}

impl Transport {
    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Fd(_) => TransportKind::Fd,
            Transport::Ssh(_) => TransportKind::Ssh,
            Transport::Tls(_) => TransportKind::Tls,
        }
    }

    /// Non-blocking read into `buf`.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome> {
        match self {
            Transport::Fd(t) => t.read(buf),
            Transport::Ssh(t) => t.read(buf),
            Transport::Tls(t) => t.read(buf),
        }
    }

    /// Blocking write of the whole buffer.
    pub fn write_all(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Transport::Fd(t) => t.write_all(data),
            Transport::Ssh(t) => t.write_all(data),
            Transport::Tls(t) => t.write_all(data),
        }
    }

    /// Wait up to `timeout_ms` for the stream to become readable.
    /// Negative timeout waits indefinitely.
    pub fn poll_readable(&mut self, timeout_ms: i32) -> Result<PollOutcome> {
        match self {
            Transport::Fd(t) => t.poll_readable(timeout_ms),
            Transport::Ssh(t) => t.poll_readable(timeout_ms),
            Transport::Tls(t) => t.poll_readable(timeout_ms),
        }
    }

    /// Best-effort orderly shutdown of the stream.
    pub fn shutdown(&mut self) {
        match self {
            Transport::Fd(t) => t.shutdown(),
            Transport::Ssh(t) => t.shutdown(),
            Transport::Tls(t) => t.shutdown(),
        }
    }
}

/// poll(2) a descriptor for readability.
pub(crate) fn poll_fd_readable(fd: BorrowedFd<'_>, timeout_ms: i32) -> Result<PollOutcome> {
    let timeout = if timeout_ms < 0 {
        PollTimeout::NONE
    } else {
        PollTimeout::try_from(timeout_ms).unwrap_or(PollTimeout::MAX)
    };
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    loop {
        match poll(&mut fds, timeout) {
            Ok(0) => return Ok(PollOutcome::Timeout),
            Ok(_) => {
                let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                if revents.contains(PollFlags::POLLIN) {
                    return Ok(PollOutcome::Ready);
                }
                if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
                    return Ok(PollOutcome::Disconnect);
                }
                if revents.contains(PollFlags::POLLNVAL) {
                    return Err(Error::Transport("poll on closed descriptor".into()));
                }
                return Ok(PollOutcome::Timeout);
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(Error::Transport(format!("poll: {e}"))),
        }
    }
}
