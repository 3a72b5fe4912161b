//! Error types for transfers and discovery.
//!
//! Transfer failures are a closed set so that callers can tell retryable
//! connection problems apart from fatal ones.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// A specialized `Result` type for transfer operations.
pub type Result<T> = std::result::Result<T, TransferError>;

#[derive(Error, Debug)]
pub enum TransferError {
    /// Refused, reset, broken pipe and friends
    #[error("connection error: {0}")]
    Connection(#[source] io::Error),

    /// The peer closed the stream before the expected bytes arrived
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Malformed or truncated header
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unknown protocol magic 0x{0:08X}")]
    UnknownMagic(u32),

    /// Receiver's whole-file digest did not match the sender's
    #[error("checksum mismatch for '{file}'")]
    ChecksumMismatch { file: String },

    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("filesystem error on '{}': {source}", .path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Stream ended before the declared size was reached
    #[error("transfer of '{file}' stopped after {received} of {expected} bytes")]
    PartialTransfer {
        file: String,
        received: u64,
        expected: u64,
    },

    /// Receiver answered with a status other than `OK`
    #[error("receiver rejected the transfer (status {status:?})")]
    Rejected { status: String },
}

impl TransferError {
    /// Wrap a local file error, keeping missing files distinct.
    pub fn fs(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            Self::FileNotFound(path.to_path_buf())
        } else {
            Self::Filesystem {
                path: path.to_path_buf(),
                source,
            }
        }
    }

    /// Whether another connection attempt could change the outcome.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionClosed => true,
            Self::Connection(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::HostUnreachable
                    | io::ErrorKind::NetworkUnreachable
            ),
            _ => false,
        }
    }
}

impl From<io::Error> for TransferError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Self::ConnectionClosed
        } else {
            Self::Connection(e)
        }
    }
}

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("discovery socket error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid beacon: {0}")]
    Json(#[from] serde_json::Error),
}
