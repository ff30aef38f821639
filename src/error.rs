//! The crate-wide error type.
//!
//! Like the rest of the codebase, errors are hand-rolled rather than built on
//! an error-handling crate: each variant maps to a concrete recovery action
//! (retry, drop-with-log, or actor exit) decided by the caller, not by a
//! generic "something went wrong" wrapper.

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// Wraps any OS-level IO failure (file, socket, directory).
    Io(std::io::Error),
    /// A `--ip` argument did not parse as a dotted IPv4 address.
    InvalidPeerAddress(String),
    /// `--encryption` was given something other than `yes` or `no`.
    InvalidEncryptionFlag(String),
    /// Failed to (de)serialize a wire frame or a persisted snapshot.
    Codec(bincode::Error),
    /// A frame's declared payload size is larger than the protocol allows.
    FrameTooLarge(u64),
    /// A frame carried a message type byte we don't recognize.
    UnknownMessageType(u32),
    /// AES-CBC decryption failed (bad padding, truncated ciphertext).
    Decryption,
    /// Gzip (de)compression failed.
    Compression(std::io::Error),
    /// The block/unblock counter for a path went negative, which would mean
    /// an `unblock` without a matching `block` -- a bug, not a runtime
    /// condition, but checked rather than asserted so a misbehaving peer
    /// can't take the process down.
    CounterUnderflow,
    /// A control channel to an actor has been closed; the actor has already
    /// exited.
    ActorGone,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::InvalidPeerAddress(s) => {
                write!(f, "invalid peer address: {}", s)
            }
            Error::InvalidEncryptionFlag(s) => {
                write!(f, "invalid --encryption value: {} (expected yes|no)", s)
            }
            Error::Codec(e) => write!(f, "codec error: {}", e),
            Error::FrameTooLarge(n) => write!(f, "frame too large: {} bytes", n),
            Error::UnknownMessageType(n) => {
                write!(f, "unknown message type: {}", n)
            }
            Error::Decryption => write!(f, "decryption failed"),
            Error::Compression(e) => write!(f, "compression error: {}", e),
            Error::CounterUnderflow => {
                write!(f, "block/unblock counter underflow")
            }
            Error::ActorGone => write!(f, "actor channel closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Codec(e) => Some(e),
            Error::Compression(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Codec(e)
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ActorGone
    }
}
