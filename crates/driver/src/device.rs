//! Physical device instance
//!
//! A [`DeviceInstance`] is created when the transport reports an attach. It
//! carries the transport identity, the endpoint set discovered at attach
//! time (immutable afterwards), and the transport used to submit transfers.

use crate::transport::Transport;
use std::fmt;
use std::sync::Arc;

/// Transport-level identity of an attached device (bus number and address)
///
/// Unique among attached devices; a new device may reuse it after the
/// previous holder detached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportId {
    pub bus: u8,
    pub address: u8,
}

impl TransportId {
    pub fn new(bus: u8, address: u8) -> Self {
        Self { bus, address }
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}-{:03}", self.bus, self.address)
    }
}

/// Identity used for id-table matching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// Interface class of the bound interface
    pub class: u8,
    /// Interface subclass
    pub subclass: u8,
    /// Interface protocol
    pub protocol: u8,
}

/// Kind of pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipeKind {
    Control,
    Bulk,
}

/// Opaque pipe descriptor (endpoint number, direction, kind)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pipe {
    endpoint: u8,
    is_in: bool,
    kind: PipeKind,
}

impl Pipe {
    pub fn bulk_in(endpoint: u8) -> Self {
        Self {
            endpoint: endpoint & 0x0f,
            is_in: true,
            kind: PipeKind::Bulk,
        }
    }

    pub fn bulk_out(endpoint: u8) -> Self {
        Self {
            endpoint: endpoint & 0x0f,
            is_in: false,
            kind: PipeKind::Bulk,
        }
    }

    /// Default control pipe, device-to-host
    pub fn control_in() -> Self {
        Self {
            endpoint: 0,
            is_in: true,
            kind: PipeKind::Control,
        }
    }

    /// Default control pipe, host-to-device
    pub fn control_out() -> Self {
        Self {
            endpoint: 0,
            is_in: false,
            kind: PipeKind::Control,
        }
    }

    /// Endpoint number without the direction bit
    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    /// Endpoint address as it appears on the wire (bit 7 = IN)
    pub fn address(&self) -> u8 {
        if self.is_in {
            self.endpoint | 0x80
        } else {
            self.endpoint
        }
    }

    pub fn is_in(&self) -> bool {
        self.is_in
    }

    pub fn kind(&self) -> PipeKind {
        self.kind
    }
}

/// Cached pipes of an attached device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoints {
    pub bulk_in: Pipe,
    pub bulk_out: Pipe,
    pub control_in: Pipe,
    pub control_out: Pipe,
}

impl Endpoints {
    /// Build the pipe set from bulk endpoint addresses; control pipes are
    /// always endpoint 0
    pub fn new(bulk_in: u8, bulk_out: u8) -> Self {
        Self {
            bulk_in: Pipe::bulk_in(bulk_in),
            bulk_out: Pipe::bulk_out(bulk_out),
            control_in: Pipe::control_in(),
            control_out: Pipe::control_out(),
        }
    }
}

/// One attached physical device
#[derive(Clone)]
pub struct DeviceInstance {
    id: TransportId,
    identity: DeviceIdentity,
    endpoints: Endpoints,
    transport: Arc<dyn Transport>,
}

impl DeviceInstance {
    pub fn new(
        id: TransportId,
        identity: DeviceIdentity,
        endpoints: Endpoints,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            id,
            identity,
            endpoints,
            transport,
        }
    }

    pub fn id(&self) -> TransportId {
        self.id
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }
}

impl fmt::Debug for DeviceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceInstance")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("endpoints", &self.endpoints)
            .finish_non_exhaustive()
    }
}
