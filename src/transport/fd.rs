//! Raw file-descriptor transport
//!
//! Used for sessions the embedder wires up itself (pipes to a subprocess,
//! an inetd-style stdin/stdout pair) and by the test suite. The input
//! descriptor is switched to non-blocking mode on attach; writes stay
//! blocking with a short-sleep retry on EAGAIN.

use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::thread;

use log::*;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd;

use super::{poll_fd_readable, PollOutcome, ReadOutcome, IO_RETRY_SLEEP};
use crate::error::{Error, Result};

#[derive(Debug)]
pub struct FdTransport {
    input: OwnedFd,
    output: OwnedFd,
}

impl FdTransport {
    /// Take ownership of an input/output descriptor pair.
    pub fn new(input: OwnedFd, output: OwnedFd) -> Result<FdTransport> {
        let flags = fcntl(&input, FcntlArg::F_GETFL)
            .map_err(|e| Error::Transport(format!("fcntl(F_GETFL): {e}")))?;
        let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
        fcntl(&input, FcntlArg::F_SETFL(flags))
            .map_err(|e| Error::Transport(format!("fcntl(F_SETFL): {e}")))?;
        Ok(FdTransport { input, output })
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome> {
        loop {
            match unistd::read(&self.input, buf) {
                Ok(0) => return Ok(ReadOutcome::Eof),
                Ok(n) => return Ok(ReadOutcome::Data(n)),
                Err(Errno::EAGAIN) => return Ok(ReadOutcome::WouldBlock),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(Error::Transport(format!("read: {e}"))),
            }
        }
    }

    pub fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < data.len() {
            match unistd::write(&self.output, &data[written..]) {
                Ok(0) => return Err(Error::Transport("write returned zero".into())),
                Ok(n) => written += n,
                Err(Errno::EAGAIN) | Err(Errno::EINTR) => thread::sleep(IO_RETRY_SLEEP),
                Err(e) => return Err(Error::Transport(format!("write: {e}"))),
            }
        }
        Ok(())
    }

    pub fn poll_readable(&mut self, timeout_ms: i32) -> Result<PollOutcome> {
        poll_fd_readable(self.input.as_fd(), timeout_ms)
    }

    pub fn shutdown(&mut self) {
        debug!(
            "closing fd transport (in {}, out {})",
            self.input.as_raw_fd(),
            self.output.as_raw_fd()
        );
        // descriptors close on drop
    }
}
