//! Transport collaborator interface
//!
//! The transport accepts transfer descriptors asynchronously and reports
//! each one back exactly once through its [`Completion`]. The completion is a
//! move-only token: `complete` consumes it, and dropping it without
//! completing reports `Cancelled`, so a descriptor can never be lost or
//! reported twice.

use crate::device::Pipe;
use crate::error::TransportError;
use crate::transfer::CompletionSignal;
use nix::errno::Errno;
use std::fmt;
use std::sync::Arc;

/// Identifier of a submitted transfer, unique per channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(pub u64);

/// Outbound transfer descriptor
///
/// The buffer is owned by the request for as long as the transport holds it
/// and is handed back through [`TransferOutcome::buffer`].
#[derive(Debug)]
pub struct TransferRequest {
    pub id: TransferId,
    pub pipe: Pipe,
    pub buffer: Vec<u8>,
}

/// Final status reported by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Stall,
    NoDevice,
    Overflow,
    Io,
    Cancelled,
    /// Hardware-level timeout inside the transport
    TimedOut,
    Other(String),
}

impl TransferStatus {
    pub fn errno(&self) -> Errno {
        match self {
            TransferStatus::Completed => Errno::UnknownErrno,
            TransferStatus::Stall => Errno::EPIPE,
            TransferStatus::NoDevice => Errno::ENODEV,
            TransferStatus::Overflow => Errno::EOVERFLOW,
            TransferStatus::Io => Errno::EIO,
            TransferStatus::Cancelled => Errno::ENOENT,
            TransferStatus::TimedOut => Errno::ETIMEDOUT,
            TransferStatus::Other(_) => Errno::EIO,
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStatus::Completed => write!(f, "completed"),
            TransferStatus::Stall => write!(f, "endpoint stalled"),
            TransferStatus::NoDevice => write!(f, "no device"),
            TransferStatus::Overflow => write!(f, "overflow"),
            TransferStatus::Io => write!(f, "I/O error"),
            TransferStatus::Cancelled => write!(f, "cancelled"),
            TransferStatus::TimedOut => write!(f, "transport timeout"),
            TransferStatus::Other(message) => write!(f, "{}", message),
        }
    }
}

/// What the completion handler reports for one transfer
#[derive(Debug)]
pub struct TransferOutcome {
    pub status: TransferStatus,
    pub actual_length: usize,
    /// The request buffer, returned for reuse when the transport still has it
    pub buffer: Option<Vec<u8>>,
}

impl TransferOutcome {
    pub fn completed(buffer: Vec<u8>, actual_length: usize) -> Self {
        Self {
            status: TransferStatus::Completed,
            actual_length,
            buffer: Some(buffer),
        }
    }

    pub fn failed(status: TransferStatus, buffer: Option<Vec<u8>>) -> Self {
        Self {
            status,
            actual_length: 0,
            buffer,
        }
    }
}

/// Single-use completion handle travelling with a submitted transfer
pub struct Completion {
    id: TransferId,
    signal: Option<Arc<CompletionSignal>>,
}

impl Completion {
    pub(crate) fn new(id: TransferId, signal: Arc<CompletionSignal>) -> Self {
        Self {
            id,
            signal: Some(signal),
        }
    }

    /// Transfer this completion belongs to
    pub fn id(&self) -> TransferId {
        self.id
    }

    /// Deliver the final outcome and wake the waiting caller
    pub fn complete(mut self, outcome: TransferOutcome) {
        if let Some(signal) = self.signal.take() {
            signal.complete(outcome);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(signal) = self.signal.take() {
            signal.complete(TransferOutcome::failed(TransferStatus::Cancelled, None));
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("id", &self.id)
            .field("armed", &self.signal.is_some())
            .finish()
    }
}

/// Asynchronous bulk transport for one device
pub trait Transport: Send + Sync {
    /// Hand a transfer to the transport
    ///
    /// On `Ok` the transport owns the request and must eventually call
    /// [`Completion::complete`] (or drop the completion). On `Err` no transfer
    /// was started.
    fn submit(
        &self,
        request: TransferRequest,
        completion: Completion,
    ) -> std::result::Result<(), TransportError>;

    /// Best-effort cancellation of an outstanding transfer
    ///
    /// The completion still fires exactly once afterwards.
    fn cancel(&self, id: TransferId);
}
