//! Error types for HFetch
//!
//! This module defines the common error type used throughout the system.
//! Callers that only care about success or failure branch on `is_ok()`;
//! callers that care about the cause match on [`Error::kind`].

use crate::types::{FileNameError, InvalidDiscriminant};
use thiserror::Error;

/// Common result type for HFetch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for HFetch
#[derive(Debug, Error)]
pub enum Error {
    // Capacity errors
    #[error("capacity exceeded on layer {layer}: required {required} bytes, available {available} bytes")]
    CapacityExceeded {
        required: u64,
        available: u64,
        layer: u8,
    },

    // Storage errors
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("layer not found: {0}")]
    LayerNotFound(u8),

    #[error("file is not tracked: {0}")]
    FileNotTracked(String),

    // Value errors
    #[error("invalid segment [{start},{end}]")]
    InvalidSegment { start: i64, end: i64 },

    #[error("invalid filename: {0}")]
    InvalidFilename(#[from] FileNameError),

    #[error("invalid wire value: {0}")]
    InvalidDiscriminant(#[from] InvalidDiscriminant),

    // Network/RPC errors
    #[error("server {server} unavailable: {reason}")]
    RemoteUnavailable { server: u16, reason: String },

    #[error("request timeout")]
    Timeout,

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Capacity,
    Io,
    Remote,
    Invalid,
    Internal,
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a remote-unavailable error for `server`
    pub fn remote(server: u16, reason: impl Into<String>) -> Self {
        Self::RemoteUnavailable {
            server,
            reason: reason.into(),
        }
    }

    /// Coarse kind of this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CapacityExceeded { .. } => ErrorKind::Capacity,
            Self::DiskIo(_) | Self::Storage(_) => ErrorKind::Io,
            Self::RemoteUnavailable { .. } | Self::Timeout => ErrorKind::Remote,
            Self::LayerNotFound(_)
            | Self::FileNotTracked(_)
            | Self::InvalidSegment { .. }
            | Self::InvalidFilename(_)
            | Self::InvalidDiscriminant(_)
            | Self::Configuration(_) => ErrorKind::Invalid,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Check if this is a retryable error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::RemoteUnavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::Timeout.is_retryable());
        assert!(Error::remote(1, "connection refused").is_retryable());
        assert!(!Error::LayerNotFound(3).is_retryable());
    }

    #[test]
    fn test_error_kind() {
        let err = Error::CapacityExceeded {
            required: 10,
            available: 5,
            layer: 0,
        };
        assert_eq!(err.kind(), ErrorKind::Capacity);
        assert_eq!(Error::storage("short read").kind(), ErrorKind::Io);
        assert_eq!(Error::remote(2, "down").kind(), ErrorKind::Remote);
        assert_eq!(
            Error::InvalidSegment { start: 5, end: 1 }.kind(),
            ErrorKind::Invalid
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io.into();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.to_string().contains("missing"));
    }
}
