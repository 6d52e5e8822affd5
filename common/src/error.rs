use std::io;

use thiserror::Error;

/// Errors surfaced by the engine IPC layer.
///
/// `Io` and `ProtocolViolation` on a control channel are hard failures: the
/// transport moves to its failed state and pending operations complete with an
/// error. `Timeout` is recoverable; the caller may re-enter the wait with a
/// fresh deadline. `Unsupported` indicates a caller-contract error (wrong
/// backend for the requested capability) and is never retried.
#[derive(Debug, Error)]
pub enum Error {
    /// An underlying read, write, poll, or spawn failed. Carries the
    /// platform error code; short transfers are not errors.
    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),

    /// The backend does not provide the requested capability (e.g. seek on a
    /// callback set without a seek handler, or any operation after release).
    #[error("operation not supported by this data backend")]
    Unsupported,

    /// Malformed line, over-long line, or a line class that is invalid for
    /// the current transport state.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A one-shot channel already completed its single command cycle.
    #[error("channel exhausted: one-shot transport already completed a cycle")]
    ChannelExhausted,

    /// The wait deadline elapsed without any descriptor becoming ready.
    #[error("wait deadline elapsed")]
    Timeout,

    /// The peer closed its end of the channel (EOF or disconnect).
    #[error("peer closed the connection")]
    PeerClosed,

    /// The operation was torn down by the caller before completion, or the
    /// passphrase provider declined an inquiry.
    #[error("operation cancelled")]
    Cancelled,

    /// The peer terminated a command cycle with an `ERR` line. The code and
    /// description are relayed verbatim.
    #[error("engine error {code}: {message}")]
    Engine { code: u32, message: String },
}

impl Error {
    /// Shorthand for a protocol violation with a formatted reason.
    pub fn protocol(reason: impl Into<String>) -> Self {
        Error::ProtocolViolation(reason.into())
    }

    /// True for failures that poison the transport they occurred on.
    pub fn is_fatal_to_transport(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::ProtocolViolation(_) | Error::PeerClosed
        )
    }
}

#[cfg(unix)]
impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Self {
        Error::Io(io::Error::from_raw_os_error(errno as i32))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
