//! User-facing channel bound to one device instance

use crate::device::{DeviceIdentity, DeviceInstance, TransportId};
use crate::error::{DriverError, Result};
use crate::minor::Minor;
use crate::transfer::{SlotState, TransferSettings, TransferSlot};
use crate::transport::TransferId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Shared handle to a live channel
pub type ChannelHandle = Arc<Channel>;

/// Snapshot of a channel for listings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub minor: Minor,
    pub name: String,
    pub transport: TransportId,
    pub identity: DeviceIdentity,
    pub open_sessions: usize,
    pub suspended: bool,
    pub transfer_in_flight: bool,
}

#[derive(Debug, Default)]
pub(crate) struct ChannelState {
    pub(crate) detached: bool,
    pub(crate) suspended: bool,
    pub(crate) open_sessions: usize,
    pub(crate) slot: Option<TransferSlot>,
}

/// Channel state: identifier, name, device and its transfer slot
#[derive(Debug)]
pub struct Channel {
    minor: Minor,
    name: String,
    device: DeviceInstance,
    settings: TransferSettings,
    state: Mutex<ChannelState>,
    /// Notified whenever the slot returns to `Idle`
    idle: Condvar,
    next_transfer: AtomicU64,
}

impl Channel {
    pub(crate) fn new(
        minor: Minor,
        name: String,
        device: DeviceInstance,
        settings: TransferSettings,
    ) -> Self {
        Self {
            minor,
            name,
            device,
            settings,
            state: Mutex::new(ChannelState::default()),
            idle: Condvar::new(),
            next_transfer: AtomicU64::new(1),
        }
    }

    pub fn minor(&self) -> Minor {
        self.minor
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> &DeviceInstance {
        &self.device
    }

    pub fn transport_id(&self) -> TransportId {
        self.device.id()
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    pub fn info(&self) -> ChannelInfo {
        let state = self.state();
        ChannelInfo {
            minor: self.minor,
            name: self.name.clone(),
            transport: self.device.id(),
            identity: *self.device.identity(),
            open_sessions: state.open_sessions,
            suspended: state.suspended,
            transfer_in_flight: state
                .slot
                .as_ref()
                .is_some_and(|s| s.state() == SlotState::Submitted),
        }
    }

    pub fn is_detached(&self) -> bool {
        self.state().detached
    }

    pub fn is_suspended(&self) -> bool {
        self.state().suspended
    }

    pub fn open_sessions(&self) -> usize {
        self.state().open_sessions
    }

    /// Current slot state, `None` when no slot is allocated
    pub fn slot_state(&self) -> Option<SlotState> {
        self.state().slot.as_ref().map(|s| s.state())
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, ChannelState> {
        crate::lock(&self.state)
    }

    pub(crate) fn next_transfer_id(&self) -> TransferId {
        TransferId(self.next_transfer.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn notify_idle(&self) {
        self.idle.notify_all();
    }

    /// Register a new session; the first one allocates the transfer slot
    pub(crate) fn attach_session(&self) -> Result<()> {
        let mut state = self.state();
        if state.detached {
            return Err(DriverError::NotFound);
        }
        if state.slot.is_none() {
            state.slot = Some(TransferSlot::allocate(self.settings.max_transfer_size)?);
            debug!(
                "Allocated transfer slot for {} ({} bytes)",
                self.name, self.settings.max_transfer_size
            );
        }
        state.open_sessions += 1;
        Ok(())
    }

    /// Drop a session; the last one frees an idle slot
    pub(crate) fn detach_session(&self) {
        let mut state = self.state();
        state.open_sessions = state.open_sessions.saturating_sub(1);
        if state.open_sessions == 0
            && state
                .slot
                .as_ref()
                .is_some_and(|s| s.state() == SlotState::Idle)
        {
            state.slot = None;
            debug!("Freed transfer slot for {}", self.name);
        }
    }

    /// Refuse further opens and writes and wake any in-flight writer
    pub(crate) fn mark_detached(&self) {
        let mut state = self.state();
        if state.detached {
            return;
        }
        state.detached = true;

        let in_flight = state
            .slot
            .as_ref()
            .is_some_and(|s| s.state() == SlotState::Submitted);
        if in_flight {
            if let Some(slot) = state.slot.as_ref() {
                slot.detach_inflight();
            }
        } else {
            state.slot = None;
        }
    }

    pub(crate) fn set_suspended(&self, suspended: bool) {
        self.state().suspended = suspended;
    }

    /// Interrupt the in-flight writer, if any
    pub fn interrupt_inflight(&self) {
        if let Some(slot) = self.state().slot.as_ref() {
            slot.interrupt_inflight();
        }
    }

    /// Wait until no transfer is in flight; false if `timeout` elapsed first
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let state = self.state();
        let (_state, result) = self
            .idle
            .wait_timeout_while(state, timeout, |s| {
                s.slot
                    .as_ref()
                    .is_some_and(|slot| slot.state() == SlotState::Submitted)
            })
            .unwrap_or_else(PoisonError::into_inner);
        !result.timed_out()
    }
}
