//! Driver error types

use crate::transport::TransferStatus;
use nix::errno::Errno;
use thiserror::Error;

/// Synchronous refusal reported by a transport's submit entry point
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The device has been disconnected
    #[error("device is no longer present")]
    NoDevice,

    /// The transport has no room for another request
    #[error("transport out of resources")]
    NoResources,

    /// The endpoint is stalled or otherwise unusable
    #[error("endpoint unavailable")]
    EndpointUnavailable,

    /// Any other transport-specific failure
    #[error("transport error: {0}")]
    Other(String),
}

/// Errors surfaced by channel and transfer operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// Identifier pool full, node facility exhausted, or buffer allocation failed
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A transfer is already in flight on this channel
    #[error("a transfer is already in flight on this channel")]
    Busy,

    /// The transport refused the submission synchronously
    #[error("transport rejected submission: {0}")]
    TransportRejected(#[from] TransportError),

    /// The transport completed the transfer with a failure status
    #[error("transfer failed: {0}")]
    TransferFailed(TransferStatus),

    /// No completion was observed within the write timeout
    #[error("transfer timed out")]
    TimedOut,

    /// The waiting caller was interrupted before completion
    #[error("transfer cancelled by signal")]
    SignalCancelled,

    /// The channel or its device no longer exists
    #[error("channel not found")]
    NotFound,

    /// A live channel already uses this name
    #[error("channel name already in use: {0}")]
    NameCollision(String),

    /// The operation has no implementation on this channel
    #[error("operation not supported")]
    NotSupported,
}

impl DriverError {
    /// Map to the errno a device-file write would report
    pub fn errno(&self) -> Errno {
        match self {
            DriverError::ResourceExhausted(_) => Errno::ENOMEM,
            DriverError::Busy => Errno::EBUSY,
            DriverError::TransportRejected(TransportError::NoDevice) => Errno::ENODEV,
            DriverError::TransportRejected(TransportError::NoResources) => Errno::ENOMEM,
            DriverError::TransportRejected(TransportError::EndpointUnavailable) => Errno::EPIPE,
            DriverError::TransportRejected(TransportError::Other(_)) => Errno::EIO,
            DriverError::TransferFailed(status) => status.errno(),
            DriverError::TimedOut => Errno::ETIMEDOUT,
            DriverError::SignalCancelled => Errno::EINTR,
            DriverError::NotFound => Errno::ENODEV,
            DriverError::NameCollision(_) => Errno::EEXIST,
            DriverError::NotSupported => Errno::ENOTTY,
        }
    }

    /// True when the caller gave up waiting rather than the hardware refusing
    pub fn is_wait_abandoned(&self) -> bool {
        matches!(self, DriverError::TimedOut | DriverError::SignalCancelled)
    }
}

/// Type alias for driver results
pub type Result<T> = std::result::Result<T, DriverError>;
