//! Test utilities for the driver core
//!
//! Provides a scriptable [`MockTransport`] and device builders usable from
//! unit tests, integration tests and the daemon's tests.
//!
//! # Example
//!
//! ```
//! use driver::test_utils::{MockBehavior, MockTransport};
//!
//! let transport = MockTransport::with_behavior(MockBehavior::Hold);
//! assert_eq!(transport.pending_count(), 0);
//! ```

use crate::device::{DeviceIdentity, DeviceInstance, Endpoints, TransportId};
use crate::error::TransportError;
use crate::transport::{
    Completion, TransferId, TransferOutcome, TransferRequest, TransferStatus, Transport,
};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// How [`MockTransport`] reacts to a submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockBehavior {
    /// Complete inline with the full buffer length
    CompleteImmediately,
    /// Complete inline, reporting at most this many bytes
    CompleteShort(usize),
    /// Complete inline with a failure status
    Fail(TransferStatus),
    /// Keep the transfer pending until completed or cancelled
    Hold,
    /// Refuse the submission synchronously
    Reject(TransportError),
}

struct Pending {
    request: TransferRequest,
    completion: Completion,
}

#[derive(Default)]
struct MockState {
    submissions: Vec<Vec<u8>>,
    pending: Vec<Pending>,
    cancels: Vec<TransferId>,
}

/// Transport double recording every submission and cancel
pub struct MockTransport {
    behavior: Mutex<MockBehavior>,
    /// Whether `cancel` completes a held transfer as `Cancelled`
    complete_on_cancel: bool,
    state: Mutex<MockState>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Transport completing every transfer immediately
    pub fn new() -> Self {
        Self::with_behavior(MockBehavior::CompleteImmediately)
    }

    pub fn with_behavior(behavior: MockBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            complete_on_cancel: true,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Transport holding transfers and ignoring cancellation
    pub fn unresponsive() -> Self {
        Self {
            complete_on_cancel: false,
            ..Self::with_behavior(MockBehavior::Hold)
        }
    }

    /// Transport refusing every submission with `NoDevice`
    pub fn rejecting() -> Self {
        Self::with_behavior(MockBehavior::Reject(TransportError::NoDevice))
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        *crate::lock(&self.behavior) = behavior;
    }

    /// Payloads of all accepted submissions, in order
    pub fn submissions(&self) -> Vec<Vec<u8>> {
        crate::lock(&self.state).submissions.clone()
    }

    /// Ids passed to `cancel`, in order
    pub fn cancels(&self) -> Vec<TransferId> {
        crate::lock(&self.state).cancels.clone()
    }

    pub fn cancel_count(&self) -> usize {
        crate::lock(&self.state).cancels.len()
    }

    pub fn pending_count(&self) -> usize {
        crate::lock(&self.state).pending.len()
    }

    /// Complete the oldest held transfer with `status` and up to
    /// `actual_length` bytes; false if none was pending
    pub fn complete_pending(&self, status: TransferStatus, actual_length: usize) -> bool {
        let pending = {
            let mut state = crate::lock(&self.state);
            if state.pending.is_empty() {
                return false;
            }
            state.pending.remove(0)
        };

        let len = actual_length.min(pending.request.buffer.len());
        pending.completion.complete(TransferOutcome {
            status,
            actual_length: len,
            buffer: Some(pending.request.buffer),
        });
        true
    }

    /// Drop every held completion without completing it
    pub fn drop_pending(&self) -> usize {
        let pending = std::mem::take(&mut crate::lock(&self.state).pending);
        pending.len()
    }
}

impl Transport for MockTransport {
    fn submit(
        &self,
        request: TransferRequest,
        completion: Completion,
    ) -> std::result::Result<(), TransportError> {
        let len = request.buffer.len();
        let behavior = crate::lock(&self.behavior).clone();
        let immediate = match behavior {
            MockBehavior::Reject(e) => return Err(e),
            MockBehavior::CompleteImmediately => Some((TransferStatus::Completed, len)),
            MockBehavior::CompleteShort(max) => Some((TransferStatus::Completed, len.min(max))),
            MockBehavior::Fail(status) => Some((status, 0)),
            MockBehavior::Hold => None,
        };

        let mut state = crate::lock(&self.state);
        state.submissions.push(request.buffer.clone());
        match immediate {
            Some((status, actual_length)) => {
                // complete outside our lock, the waiter may call back into us
                drop(state);
                completion.complete(TransferOutcome {
                    status,
                    actual_length,
                    buffer: Some(request.buffer),
                });
            }
            None => state.pending.push(Pending {
                request,
                completion,
            }),
        }
        Ok(())
    }

    fn cancel(&self, id: TransferId) {
        let cancelled = {
            let mut state = crate::lock(&self.state);
            state.cancels.push(id);
            if !self.complete_on_cancel {
                return;
            }
            state
                .pending
                .iter()
                .position(|p| p.completion.id() == id)
                .map(|index| state.pending.remove(index))
        };

        if let Some(pending) = cancelled {
            pending.completion.complete(TransferOutcome::failed(
                TransferStatus::Cancelled,
                Some(pending.request.buffer),
            ));
        }
    }
}

/// Identity of the default supported device
pub fn mock_identity() -> DeviceIdentity {
    DeviceIdentity {
        vendor_id: 0x0499,
        product_id: 0x3002,
        class: 0xff,
        subclass: 0x00,
        protocol: 0x00,
    }
}

/// Bulk IN on endpoint 1, bulk OUT on endpoint 2
pub fn mock_endpoints() -> Endpoints {
    Endpoints::new(0x81, 0x02)
}

pub fn mock_device(bus: u8, address: u8, transport: Arc<dyn Transport>) -> DeviceInstance {
    DeviceInstance::new(
        TransportId::new(bus, address),
        mock_identity(),
        mock_endpoints(),
        transport,
    )
}

/// Poll `condition` until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(2));
    }
}

/// Create test data of `size` bytes with a recognisable pattern
pub fn create_mock_bulk_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 256) as u8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::{CompletionSignal, Wake};

    fn request(id: u64, data: &[u8]) -> (TransferRequest, Arc<CompletionSignal>, Completion) {
        let signal = CompletionSignal::new();
        let completion = Completion::new(TransferId(id), signal.clone());
        let request = TransferRequest {
            id: TransferId(id),
            pipe: mock_endpoints().bulk_out,
            buffer: data.to_vec(),
        };
        (request, signal, completion)
    }

    #[test]
    fn test_hold_then_cancel_completes_cancelled() {
        let transport = MockTransport::with_behavior(MockBehavior::Hold);
        let (req, signal, completion) = request(3, b"abc");
        transport.submit(req, completion).unwrap();
        assert_eq!(transport.pending_count(), 1);

        transport.cancel(TransferId(3));
        assert_eq!(transport.pending_count(), 0);
        match signal.wait(Some(DEFAULT_TEST_TIMEOUT)) {
            Wake::Completed(outcome) => assert_eq!(outcome.status, TransferStatus::Cancelled),
            other => panic!("unexpected wake: {:?}", other),
        }
    }

    #[test]
    fn test_short_completion() {
        let transport = MockTransport::with_behavior(MockBehavior::CompleteShort(2));
        let (req, signal, completion) = request(1, b"abcdef");
        transport.submit(req, completion).unwrap();
        match signal.wait(Some(DEFAULT_TEST_TIMEOUT)) {
            Wake::Completed(outcome) => assert_eq!(outcome.actual_length, 2),
            other => panic!("unexpected wake: {:?}", other),
        }
    }

    #[test]
    fn test_reject_records_nothing() {
        let transport = MockTransport::rejecting();
        let (req, _signal, completion) = request(1, b"abc");
        assert_eq!(
            transport.submit(req, completion),
            Err(TransportError::NoDevice)
        );
        assert!(transport.submissions().is_empty());
    }

    #[test]
    fn test_wait_until() {
        assert!(wait_until(Duration::from_millis(10), || true));
        assert!(!wait_until(Duration::from_millis(10), || false));
    }

    #[test]
    fn test_create_mock_bulk_data() {
        let data = create_mock_bulk_data(300);
        assert_eq!(data.len(), 300);
        assert_eq!(data[255], 255);
        assert_eq!(data[256], 0);
    }
}
