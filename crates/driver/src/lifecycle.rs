//! Device lifecycle controller
//!
//! Consumes attach/detach/suspend/resume events from the transport layer and
//! drives the registry accordingly.

use crate::channel::ChannelHandle;
use crate::device::{DeviceIdentity, DeviceInstance, Endpoints, TransportId};
use crate::error::Result;
use crate::registry::ChannelRegistry;
use crate::transport::Transport;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Event reported by the transport layer
pub enum LifecycleEvent {
    Attach {
        id: TransportId,
        identity: DeviceIdentity,
        endpoints: Endpoints,
        transport: Arc<dyn Transport>,
    },
    Detach(TransportId),
    Suspend(TransportId),
    Resume(TransportId),
}

impl fmt::Debug for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleEvent::Attach { id, identity, .. } => f
                .debug_struct("Attach")
                .field("id", id)
                .field("identity", identity)
                .finish_non_exhaustive(),
            LifecycleEvent::Detach(id) => f.debug_tuple("Detach").field(id).finish(),
            LifecycleEvent::Suspend(id) => f.debug_tuple("Suspend").field(id).finish(),
            LifecycleEvent::Resume(id) => f.debug_tuple("Resume").field(id).finish(),
        }
    }
}

#[derive(Clone)]
pub struct DeviceLifecycle {
    registry: Arc<ChannelRegistry>,
}

impl DeviceLifecycle {
    pub fn new(registry: Arc<ChannelRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// A matching device appeared: create its channel
    ///
    /// On failure nothing is left registered; the device stays attached at
    /// transport level without a channel.
    pub fn on_attach(
        &self,
        id: TransportId,
        identity: DeviceIdentity,
        endpoints: Endpoints,
        transport: Arc<dyn Transport>,
    ) -> Result<ChannelHandle> {
        info!(
            "Device {} attached ({:04x}:{:04x}, bulk out {:#04x}, bulk in {:#04x})",
            id,
            identity.vendor_id,
            identity.product_id,
            endpoints.bulk_out.address(),
            endpoints.bulk_in.address()
        );

        let device = DeviceInstance::new(id, identity, endpoints, transport);
        self.registry.create_channel(device).inspect_err(|e| {
            warn!("No channel for device {}: {}", id, e);
        })
    }

    /// The device went away: wake any blocked writer, let the slot drain,
    /// then tear the channel down
    ///
    /// Returns false if no channel existed for `id`.
    pub fn on_detach(&self, id: TransportId) -> bool {
        let Some(channel) = self.registry.get(id) else {
            info!("Device {} detached (no channel)", id);
            return false;
        };

        channel.mark_detached();
        let grace = channel.settings().cancel_grace;
        if !channel.wait_idle(grace) {
            error!(
                "Transfer on {} still outstanding {:?} after detach",
                channel.name(),
                grace
            );
        }

        self.registry.destroy_channel(&channel);
        info!("Device {} detached, channel {} removed", id, channel.name());
        true
    }

    pub fn on_suspend(&self, id: TransportId) {
        if let Some(channel) = self.registry.get(id) {
            channel.set_suspended(true);
            info!("Channel {} suspended", channel.name());
        }
    }

    pub fn on_resume(&self, id: TransportId) {
        if let Some(channel) = self.registry.get(id) {
            channel.set_suspended(false);
            info!("Channel {} resumed", channel.name());
        }
    }

    /// Feed one event through the matching handler
    pub fn dispatch(&self, event: LifecycleEvent) -> Result<()> {
        match event {
            LifecycleEvent::Attach {
                id,
                identity,
                endpoints,
                transport,
            } => self.on_attach(id, identity, endpoints, transport).map(|_| ()),
            LifecycleEvent::Detach(id) => {
                self.on_detach(id);
                Ok(())
            }
            LifecycleEvent::Suspend(id) => {
                self.on_suspend(id);
                Ok(())
            }
            LifecycleEvent::Resume(id) => {
                self.on_resume(id);
                Ok(())
            }
        }
    }

    /// Detach every channel, as on process exit
    pub fn shutdown(&self) {
        for info in self.registry.channels() {
            self.on_detach(info.transport);
        }
    }
}
