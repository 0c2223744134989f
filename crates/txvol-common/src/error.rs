//! Error types for txvol
//!
//! Every fallible operation in the volume layer reports one of these kinds.
//! The block boundary only ever sees the device-level subset; store-specific
//! kinds are folded into [`Error::Io`] by [`Error::into_device_error`].

use crate::types::NameError;
use thiserror::Error;

/// Common result type for txvol operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for txvol
#[derive(Debug, Error)]
pub enum Error {
    // Lookup errors
    #[error("volume not found: {0}")]
    NotFound(String),

    #[error("volume already exists: {0}")]
    Exists(String),

    #[error("no such device: {0}")]
    NoDevice(String),

    #[error("invalid volume name: {0}")]
    InvalidName(#[from] NameError),

    // Access errors
    #[error("volume busy: {0}")]
    Busy(String),

    #[error("volume is read-only: {0}")]
    ReadOnly(String),

    #[error("interrupted, retry: {0}")]
    Interrupted(String),

    #[error("deferral queue full: {0}")]
    QueueFull(String),

    // Argument errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("value too large for this platform: {0}")]
    Overflow(String),

    #[error("block size {size} exceeds maximum record size {max}")]
    Domain { size: u64, max: u64 },

    #[error("not supported: {0}")]
    NotSupported(String),

    // Device errors
    #[error("I/O error: {0}")]
    Io(String),

    #[error("checksum mismatch at offset {offset}")]
    Checksum { offset: u64 },

    #[error("host I/O error: {0}")]
    HostIo(#[from] std::io::Error),

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a not found error
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound(name.into())
    }

    /// Create a busy error
    pub fn busy(msg: impl Into<String>) -> Self {
        Self::Busy(msg.into())
    }

    /// Create a read-only violation error
    pub fn read_only(name: impl Into<String>) -> Self {
        Self::ReadOnly(name.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a device I/O error
    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if the whole call should be retried
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Interrupted(_) | Self::QueueFull(_))
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::NoDevice(_))
    }

    /// Fold store-specific failures into a generic device error.
    ///
    /// A checksum failure below a block device is a device error, not a
    /// content error, so it never reaches the caller as [`Error::Checksum`].
    #[must_use]
    pub fn into_device_error(self) -> Self {
        match self {
            Self::Checksum { offset } => Self::Io(format!("checksum failure at offset {offset}")),
            Self::HostIo(e) => Self::Io(e.to_string()),
            other => other,
        }
    }

    /// Errno reported by the block and character device layers
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound(_) => libc::ENOENT,
            Self::Exists(_) => libc::EEXIST,
            Self::NoDevice(_) => libc::ENXIO,
            Self::InvalidName(_) | Self::InvalidArgument(_) => libc::EINVAL,
            Self::Busy(_) => libc::EBUSY,
            Self::ReadOnly(_) => libc::EROFS,
            Self::Interrupted(_) => libc::EINTR,
            Self::QueueFull(_) => libc::EAGAIN,
            Self::Overflow(_) => libc::EOVERFLOW,
            Self::Domain { .. } => libc::EDOM,
            Self::NotSupported(_) => libc::ENOTSUP,
            Self::Io(_) | Self::Checksum { .. } | Self::HostIo(_) | Self::Internal(_) => libc::EIO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::Interrupted("open".into()).is_retryable());
        assert!(Error::QueueFull("p/vol".into()).is_retryable());
        assert!(!Error::busy("p/vol").is_retryable());
    }

    #[test]
    fn test_error_not_found() {
        assert!(Error::not_found("p/vol").is_not_found());
        assert!(Error::NoDevice("p/vol".into()).is_not_found());
        assert!(!Error::read_only("p/vol").is_not_found());
    }

    #[test]
    fn test_checksum_becomes_device_error() {
        let err = Error::Checksum { offset: 4096 }.into_device_error();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.errno(), libc::EIO);

        let err = Error::busy("p/vol").into_device_error();
        assert!(matches!(err, Error::Busy(_)));
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Error::read_only("p/v").errno(), libc::EROFS);
        assert_eq!(Error::busy("p/v").errno(), libc::EBUSY);
        assert_eq!(Error::Overflow("size".into()).errno(), libc::EOVERFLOW);
        assert_eq!(Error::Domain { size: 1, max: 0 }.errno(), libc::EDOM);
        assert_eq!(Error::invalid_argument("x").errno(), libc::EINVAL);
    }
}
