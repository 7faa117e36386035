//! Error types for sparse sync.
//!
//! Every I/O boundary in the library returns [`SyncError`]; callers decide
//! what is fatal. The wire representation of an error is [`ErrorCode`].

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::streaming::protocol::ErrorCode;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("Layout query failed: {0}")]
    Layout(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Remote error ({code:?}): {message}")]
    Remote { code: ErrorCode, message: String },

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Integrity check failed: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    #[error("Destination is locked by another session: {}", .0.display())]
    Busy(PathBuf),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Session cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        // A reset or EOF from the peer is a closed session, not a local I/O failure
        match source.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted => Self::ConnectionClosed,
            _ => Self::Io {
                context: context.into(),
                source,
            },
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Whether the session ended because the idle bound was exceeded.
    /// Callers use this to decide on a retry with a longer timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Remote { code, .. } => *code == ErrorCode::Timeout,
            _ => false,
        }
    }

    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::Integrity { .. })
    }

    /// Wire code used when this error is reported to the peer.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Io { source, .. } => match source.kind() {
                io::ErrorKind::NotFound => ErrorCode::NotFound,
                io::ErrorKind::PermissionDenied => ErrorCode::PermissionDenied,
                _ => ErrorCode::Io,
            },
            Self::Layout(_) | Self::Unsupported(_) => ErrorCode::Unsupported,
            Self::Protocol(_) | Self::Integrity { .. } => ErrorCode::Protocol,
            Self::Remote { code, .. } => *code,
            Self::ConnectionClosed => ErrorCode::Io,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::Busy(_) => ErrorCode::Busy,
            Self::InvalidPath(_) | Self::Config(_) => ErrorCode::PermissionDenied,
            Self::Cancelled => ErrorCode::Cancelled,
        }
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            Self::Cancelled
        } else {
            Self::Io {
                context: "Background task panicked".to_string(),
                source: io::Error::new(io::ErrorKind::Other, e.to_string()),
            }
        }
    }
}
