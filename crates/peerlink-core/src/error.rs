//! Error types for PeerLink.
//!
//! This module provides a unified error type for all PeerLink operations.
//! Every variant belongs to exactly one [`ErrorCategory`], which mirrors how
//! the host is expected to react: transport and timeout failures are retried
//! by policy, protocol violations fail the operation outright, storage errors
//! fail the operation with no partial output left behind, and validation
//! errors are raised before any I/O happens.

use std::io;

use thiserror::Error;

use crate::connection::TransportFailure;

/// A specialized `Result` type for PeerLink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Link-layer failure reported by the transport collaborator
    Transport,
    /// A connect or read/write deadline expired
    ConnectionTimeout,
    /// Malformed or unexpected data on the wire
    Protocol,
    /// Storage or socket I/O failure
    Io,
    /// Input rejected before any I/O was attempted
    Validation,
    /// The operation was cancelled by cleanup or disconnect
    Cancelled,
    /// Configuration could not be loaded or is invalid
    Config,
    /// Internal invariant violated
    Internal,
}

/// The main error type for PeerLink.
#[derive(Error, Debug)]
pub enum Error {
    /// The link transport reported a failure (P001)
    #[error("link transport error: {0}")]
    Transport(TransportFailure),

    /// The supervisor gave up on the peer link
    #[error("peer link failed: {0}")]
    LinkFailed(String),

    /// No state transition happened before the deadline (P002)
    #[error("connection timed out after {0} seconds")]
    ConnectionTimeout(u64),

    /// A socket operation exceeded its deadline
    #[error("operation timed out after {0} seconds")]
    Timeout(u64),

    /// Connecting to the peer's transfer server failed after all attempts (P003)
    #[error("could not reach {addr} after {attempts} attempts: {reason}")]
    ConnectFailed {
        /// Target address
        addr: std::net::SocketAddr,
        /// Number of attempts made
        attempts: u32,
        /// Last failure
        reason: String,
    },

    /// Invalid protocol message (P004)
    #[error("invalid protocol message: {0}")]
    ProtocolError(String),

    /// Unexpected reply line
    #[error("unexpected reply: expected {expected}, got {actual}")]
    UnexpectedReply {
        /// Expected reply token
        expected: String,
        /// Actual line received
        actual: String,
    },

    /// The peer closed the connection before a full line or header arrived
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Fewer bytes arrived than were declared (P005)
    #[error("incomplete transfer of '{file}': received {received} of {expected} bytes")]
    IncompleteTransfer {
        /// File being transferred
        file: String,
        /// Declared size
        expected: u64,
        /// Bytes actually received
        received: u64,
    },

    /// The server answered with an `ERROR:` line
    #[error("remote error: {0}")]
    RemoteError(String),

    /// The server reported that an upload did not complete
    #[error("upload of '{0}' was rejected by the peer")]
    UploadRejected(String),

    /// File not found (P006)
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// File name cannot be stored in a catalog
    #[error("invalid file name: {0}")]
    InvalidFileName(String),

    /// Storage handle escapes the shared root
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Peer address could not be parsed (P007)
    #[error("invalid peer address: {0}")]
    InvalidAddress(String),

    /// Operation cancelled by cleanup or disconnect
    #[error("operation cancelled")]
    Cancelled,

    /// The transfer server is not running
    #[error("transfer server is not running")]
    ServerNotRunning,

    /// Configuration file error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Invalid configuration value
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidConfig {
        /// Configuration key
        key: String,
        /// Reason for invalidity
        reason: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not happen)
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the error code associated with this error, if any.
    #[must_use]
    pub const fn code(&self) -> Option<&'static str> {
        match self {
            Self::Transport(_) => Some("P001"),
            Self::ConnectionTimeout(_) => Some("P002"),
            Self::ConnectFailed { .. } => Some("P003"),
            Self::ProtocolError(_) | Self::UnexpectedReply { .. } => Some("P004"),
            Self::IncompleteTransfer { .. } => Some("P005"),
            Self::FileNotFound(_) => Some("P006"),
            Self::InvalidAddress(_) => Some("P007"),
            _ => None,
        }
    }

    /// Returns the taxonomy category of this error.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::Transport(_) | Self::LinkFailed(_) => ErrorCategory::Transport,
            Self::ConnectionTimeout(_) | Self::Timeout(_) | Self::ConnectFailed { .. } => {
                ErrorCategory::ConnectionTimeout
            }
            Self::ProtocolError(_)
            | Self::UnexpectedReply { .. }
            | Self::ConnectionClosed
            | Self::IncompleteTransfer { .. }
            | Self::RemoteError(_)
            | Self::UploadRejected(_)
            | Self::Serialization(_) => ErrorCategory::Protocol,
            Self::FileNotFound(_) | Self::Io(_) => ErrorCategory::Io,
            Self::InvalidFileName(_) | Self::InvalidPath(_) | Self::InvalidAddress(_) => {
                ErrorCategory::Validation
            }
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::ConfigError(_) | Self::InvalidConfig { .. } => ErrorCategory::Config,
            Self::ServerNotRunning | Self::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Returns whether this error is recoverable (can be retried).
    ///
    /// Incomplete transfers are recoverable in the sense that the caller may
    /// retry the whole operation; nothing retries them automatically.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Transport(failure) => failure.is_transient(),
            Self::ConnectionTimeout(_)
            | Self::Timeout(_)
            | Self::ConnectFailed { .. }
            | Self::ConnectionClosed
            | Self::IncompleteTransfer { .. } => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

impl From<TransportFailure> for Error {
    fn from(failure: TransportFailure) -> Self {
        Self::Transport(failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(
            Error::Transport(TransportFailure::Busy).category(),
            ErrorCategory::Transport
        );
        assert_eq!(
            Error::ConnectionTimeout(15).category(),
            ErrorCategory::ConnectionTimeout
        );
        assert_eq!(
            Error::ProtocolError("bad".into()).category(),
            ErrorCategory::Protocol
        );
        assert_eq!(
            Error::Io(io::Error::other("disk")).category(),
            ErrorCategory::Io
        );
        assert_eq!(
            Error::InvalidAddress("x".into()).category(),
            ErrorCategory::Validation
        );
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(Error::Transport(TransportFailure::Busy).is_recoverable());
        assert!(!Error::Transport(TransportFailure::Unsupported).is_recoverable());
        assert!(Error::IncompleteTransfer {
            file: "a".into(),
            expected: 10,
            received: 3,
        }
        .is_recoverable());
        assert!(Error::Io(io::Error::from(io::ErrorKind::ConnectionRefused)).is_recoverable());
        assert!(!Error::ProtocolError("bad".into()).is_recoverable());
        assert!(!Error::Cancelled.is_recoverable());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::FileNotFound("a".into()).code(), Some("P006"));
        assert_eq!(Error::Cancelled.code(), None);
    }
}
