//! Error kinds surfaced by the session layer

use std::io;

use thiserror::Error;

/// Errors returned by the NETCONF core API.
///
/// "No message ready" on polling reads is expressed as `Ok(None)`, not as
/// an error. Fatal kinds (`MalformedMessage`, `Transport`,
/// `ProtocolViolation`) also move the originating session to the invalid
/// state; `Timeout` and `InvalidArg` never touch session state.
#[derive(Debug, Error)]
pub enum Error {
    /// The deadline passed before the operation could complete.
    #[error("operation timed out")]
    Timeout,

    /// Framing or XML violation on the wire.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A message type arrived that this side of the session must not
    /// accept (e.g. an rpc-reply on a server, an rpc on a client).
    #[error("unexpected {0} on the {1} side")]
    WrongSide(&'static str, &'static str),

    /// Transport-level authentication failed; no session was produced.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// I/O failure on the underlying byte stream.
    #[error("transport failed: {0}")]
    Transport(String),

    /// NETCONF-level rule broken: capability mismatch, duplicate hello,
    /// traffic outside the running state, and similar.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The caller passed inconsistent or unusable parameters.
    #[error("invalid argument: {0}")]
    InvalidArg(String),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
