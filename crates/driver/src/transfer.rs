//! Transfer bridge
//!
//! Converts the transport's asynchronous submit/complete pair into a blocking
//! write. Each channel owns one [`TransferSlot`]; a write copies the caller's
//! bytes into the slot buffer, submits it, and parks on a per-call
//! [`CompletionSignal`] until one of:
//!
//! - the transport completes the transfer
//! - the write timeout elapses
//! - the session's [`InterruptToken`] fires
//! - the device is detached
//!
//! Every path that gives up waiting asks the transport to cancel and then
//! waits for the guaranteed completion before the slot returns to `Idle`, so
//! the buffer is never reused while the transport still holds it.
//!
//! ```text
//! Idle ──submit──> Submitted ──┬─ completed ──────────────┐
//!                              ├─ failed ─────────────────┤
//!                              ├─ timeout ─ cancel ─ wait ┼──> Idle
//!                              └─ signal  ─ cancel ─ wait ┘
//! ```

use crate::channel::Channel;
use crate::error::{DriverError, Result};
use crate::transport::{Completion, TransferId, TransferOutcome, TransferRequest, TransferStatus};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Default slot buffer capacity (64 KiB)
pub const DEFAULT_MAX_TRANSFER_SIZE: usize = 64 * 1024;

/// Default time to wait for the completion of a cancelled transfer
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Per-channel transfer tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSettings {
    /// Slot buffer capacity; longer writes are short writes
    pub max_transfer_size: usize,
    /// How long a write waits for completion (`None` or zero = forever)
    pub write_timeout: Option<Duration>,
    /// How long to wait for the completion after requesting cancellation
    pub cancel_grace: Duration,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            max_transfer_size: DEFAULT_MAX_TRANSFER_SIZE,
            write_timeout: None,
            cancel_grace: DEFAULT_CANCEL_GRACE,
        }
    }
}

/// Slot state as seen from outside the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Submitted,
}

/// Why a wait on a [`CompletionSignal`] ended
#[derive(Debug)]
pub(crate) enum Wake {
    Completed(TransferOutcome),
    TimedOut,
    Interrupted,
    Detached,
}

#[derive(Debug, Default)]
struct SignalState {
    outcome: Option<TransferOutcome>,
    interrupted: bool,
    detached: bool,
}

/// One-shot rendezvous between the completion handler and the blocked writer
#[derive(Debug, Default)]
pub struct CompletionSignal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

impl CompletionSignal {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record the outcome; only the first one counts
    pub(crate) fn complete(&self, outcome: TransferOutcome) {
        let mut state = crate::lock(&self.state);
        if state.outcome.is_none() {
            state.outcome = Some(outcome);
        }
        self.cond.notify_all();
    }

    pub(crate) fn interrupt(&self) {
        crate::lock(&self.state).interrupted = true;
        self.cond.notify_all();
    }

    pub(crate) fn detach(&self) {
        crate::lock(&self.state).detached = true;
        self.cond.notify_all();
    }

    /// Block until completion, interrupt, detach, or timeout
    ///
    /// A completion that is already recorded wins over any other wake reason.
    /// A zero timeout waits forever, like no timeout.
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> Wake {
        let deadline = timeout
            .filter(|t| !t.is_zero())
            .map(|t| Instant::now() + t);
        let mut state = crate::lock(&self.state);

        loop {
            if let Some(outcome) = state.outcome.take() {
                return Wake::Completed(outcome);
            }
            if state.detached {
                return Wake::Detached;
            }
            if state.interrupted {
                return Wake::Interrupted;
            }

            state = match deadline {
                None => self.cond.wait(state).unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Wake::TimedOut;
                    }
                    self.cond
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Block until the completion fires, ignoring interrupts and detach
    pub(crate) fn wait_completion(&self, grace: Duration) -> Option<TransferOutcome> {
        let state = crate::lock(&self.state);
        let (mut state, _) = self
            .cond
            .wait_timeout_while(state, grace, |s| s.outcome.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        state.outcome.take()
    }
}

#[derive(Debug, Default)]
struct TokenState {
    pending: bool,
    waiting: Option<Arc<CompletionSignal>>,
}

/// Interrupt source for a session, the analogue of a signal to a blocked writer
///
/// An interrupt delivered while a write is blocked wakes it with
/// [`DriverError::SignalCancelled`]. An interrupt delivered while no write is
/// blocked stays pending and interrupts the next wait.
#[derive(Debug, Default)]
pub struct InterruptToken {
    state: Mutex<TokenState>,
}

impl InterruptToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        let mut state = crate::lock(&self.state);
        match &state.waiting {
            Some(signal) => signal.interrupt(),
            None => state.pending = true,
        }
    }

    pub fn is_pending(&self) -> bool {
        crate::lock(&self.state).pending
    }

    fn arm(&self, signal: &Arc<CompletionSignal>) {
        let mut state = crate::lock(&self.state);
        if std::mem::take(&mut state.pending) {
            signal.interrupt();
        }
        state.waiting = Some(signal.clone());
    }

    fn disarm(&self) {
        crate::lock(&self.state).waiting = None;
    }
}

#[derive(Debug)]
struct InFlight {
    id: TransferId,
    signal: Arc<CompletionSignal>,
}

/// The single transfer slot of a channel
#[derive(Debug)]
pub(crate) struct TransferSlot {
    state: SlotState,
    capacity: usize,
    buffer: Option<Vec<u8>>,
    inflight: Option<InFlight>,
}

impl TransferSlot {
    /// Allocate the slot and its buffer up front
    pub(crate) fn allocate(capacity: usize) -> Result<Self> {
        Ok(Self {
            state: SlotState::Idle,
            capacity,
            buffer: Some(alloc_buffer(capacity)?),
            inflight: None,
        })
    }

    pub(crate) fn state(&self) -> SlotState {
        self.state
    }

    /// Wake the in-flight writer as if the device went away
    pub(crate) fn detach_inflight(&self) {
        if let Some(inflight) = &self.inflight {
            inflight.signal.detach();
        }
    }

    /// Wake the in-flight writer as if it received a signal
    pub(crate) fn interrupt_inflight(&self) {
        if let Some(inflight) = &self.inflight {
            inflight.signal.interrupt();
        }
    }

    fn take_buffer(&mut self) -> Result<Vec<u8>> {
        match self.buffer.take() {
            Some(buffer) => Ok(buffer),
            None => alloc_buffer(self.capacity),
        }
    }

    fn reset(&mut self, buffer: Option<Vec<u8>>) {
        self.state = SlotState::Idle;
        self.inflight = None;
        if let Some(buffer) = buffer.filter(|b| b.capacity() >= self.capacity) {
            self.buffer = Some(buffer);
        }
    }
}

fn alloc_buffer(capacity: usize) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    buffer.try_reserve_exact(capacity).map_err(|e| {
        DriverError::ResourceExhausted(format!("transfer buffer of {} bytes: {}", capacity, e))
    })?;
    Ok(buffer)
}

/// Send `payload` on the channel's bulk-out pipe and wait for the result
///
/// Returns the number of bytes the transport reports as transferred. At most
/// `max_transfer_size` bytes are sent per call.
pub(crate) fn submit_and_wait(
    channel: &Channel,
    payload: &[u8],
    interrupt: &InterruptToken,
) -> Result<usize> {
    let settings = channel.settings();
    let transport = channel.device().transport().clone();

    let (request, signal) = {
        let mut state = channel.state();
        if state.detached {
            return Err(DriverError::NotFound);
        }
        let slot = state.slot.as_mut().ok_or(DriverError::NotFound)?;
        if slot.state == SlotState::Submitted {
            debug!("Write on {} rejected: transfer already in flight", channel.name());
            return Err(DriverError::Busy);
        }

        // Copy in: the caller's buffer is not ours once we block
        let mut buffer = slot.take_buffer()?;
        let len = payload.len().min(slot.capacity);
        buffer.clear();
        buffer.extend_from_slice(&payload[..len]);

        let id = channel.next_transfer_id();
        let signal = CompletionSignal::new();
        slot.state = SlotState::Submitted;
        slot.inflight = Some(InFlight {
            id,
            signal: signal.clone(),
        });

        let request = TransferRequest {
            id,
            pipe: channel.device().endpoints().bulk_out,
            buffer,
        };
        (request, signal)
    };

    let id = request.id;
    let len = request.buffer.len();
    debug!(
        "Submitting transfer {:?} on {}: {} bytes to endpoint {:#04x}",
        id,
        channel.name(),
        len,
        request.pipe.address()
    );

    if let Err(e) = transport.submit(request, Completion::new(id, signal.clone())) {
        warn!("Transport rejected transfer {:?} on {}: {}", id, channel.name(), e);
        finish_transfer(channel, None);
        return Err(DriverError::TransportRejected(e));
    }

    interrupt.arm(&signal);
    let wake = signal.wait(settings.write_timeout);
    interrupt.disarm();

    let (result, buffer) = match wake {
        Wake::Completed(outcome) => {
            let result = match outcome.status {
                TransferStatus::Completed => {
                    debug!(
                        "Transfer {:?} on {} completed: {}/{} bytes",
                        id,
                        channel.name(),
                        outcome.actual_length,
                        len
                    );
                    Ok(outcome.actual_length)
                }
                status => {
                    warn!("Transfer {:?} on {} failed: {}", id, channel.name(), status);
                    Err(DriverError::TransferFailed(status))
                }
            };
            (result, outcome.buffer)
        }
        abandoned => {
            let (reason, err) = match abandoned {
                Wake::TimedOut => ("Timeout", DriverError::TimedOut),
                Wake::Detached => ("Detach", DriverError::SignalCancelled),
                _ => ("Signal", DriverError::SignalCancelled),
            };
            warn!("{} on {} -- cancelling transfer {:?}", reason, channel.name(), id);
            transport.cancel(id);

            let buffer = match signal.wait_completion(settings.cancel_grace) {
                Some(outcome) => {
                    debug!(
                        "Cancelled transfer {:?} on {} resolved: {}",
                        id,
                        channel.name(),
                        outcome.status
                    );
                    outcome.buffer
                }
                None => {
                    error!(
                        "Transfer {:?} on {} not completed {:?} after cancel; abandoning its buffer",
                        id,
                        channel.name(),
                        settings.cancel_grace
                    );
                    None
                }
            };
            (Err(err), buffer)
        }
    };

    finish_transfer(channel, buffer);
    result
}

/// Return the slot to `Idle`, freeing it if nobody holds the channel open
fn finish_transfer(channel: &Channel, buffer: Option<Vec<u8>>) {
    let mut state = channel.state();
    let release = state.detached || state.open_sessions == 0;
    if let Some(slot) = state.slot.as_mut() {
        slot.reset(buffer);
    }
    if release {
        state.slot = None;
    }
    drop(state);
    channel.notify_idle();
}
