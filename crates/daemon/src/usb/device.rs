//! USB device abstraction
//!
//! Wraps a `rusb::Device` with its cached descriptor, matches its interfaces
//! against the id table and discovers the bulk pipes of the matching one.

use driver::{DeviceIdentity, Endpoints, IdTable, TransportId};
use rusb::{Context, Device, DeviceDescriptor, DeviceHandle, Direction, TransferType};
use tracing::{debug, warn};

/// Interface accepted by the id table, with its pipes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeMatch {
    pub interface: u8,
    pub identity: DeviceIdentity,
    pub endpoints: Endpoints,
}

/// USB device wrapper with cached information
pub struct UsbDevice {
    device: Device<Context>,
    descriptor: DeviceDescriptor,
}

impl UsbDevice {
    /// Create a new USB device wrapper
    ///
    /// Reads and caches the device descriptor.
    pub fn new(device: Device<Context>) -> Result<Self, rusb::Error> {
        let descriptor = device.device_descriptor()?;
        Ok(Self { device, descriptor })
    }

    pub fn transport_id(&self) -> TransportId {
        TransportId::new(self.device.bus_number(), self.device.address())
    }

    pub fn vendor_id(&self) -> u16 {
        self.descriptor.vendor_id()
    }

    pub fn product_id(&self) -> u16 {
        self.descriptor.product_id()
    }

    /// Device-level identity, for devices no interface of which matched
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            vendor_id: self.descriptor.vendor_id(),
            product_id: self.descriptor.product_id(),
            class: self.descriptor.class_code(),
            subclass: self.descriptor.sub_class_code(),
            protocol: self.descriptor.protocol_code(),
        }
    }

    /// Find the first interface the id table accepts that has both bulk pipes
    ///
    /// Only the default alternate setting of each interface is considered.
    pub fn probe(&self, table: &IdTable) -> Option<ProbeMatch> {
        let config = match self.device.active_config_descriptor() {
            Ok(config) => config,
            Err(e) => {
                debug!(
                    "No active configuration on {}: {}",
                    self.transport_id(),
                    e
                );
                return None;
            }
        };

        for interface in config.interfaces() {
            let Some(setting) = interface.descriptors().next() else {
                continue;
            };

            let identity = DeviceIdentity {
                vendor_id: self.descriptor.vendor_id(),
                product_id: self.descriptor.product_id(),
                class: setting.class_code(),
                subclass: setting.sub_class_code(),
                protocol: setting.protocol_code(),
            };
            if !table.matches(&identity) {
                continue;
            }

            let endpoints: Vec<(u8, TransferType)> = setting
                .endpoint_descriptors()
                .map(|ep| (ep.address(), ep.transfer_type()))
                .collect();

            match find_bulk_pipes(&endpoints) {
                Some(endpoints) => {
                    return Some(ProbeMatch {
                        interface: setting.interface_number(),
                        identity,
                        endpoints,
                    });
                }
                None => debug!(
                    "Interface {} of {} matches but lacks bulk endpoints",
                    setting.interface_number(),
                    self.transport_id()
                ),
            }
        }
        None
    }

    /// Open the device and claim `interface`, detaching any kernel driver
    pub fn open(&self, interface: u8) -> Result<DeviceHandle<Context>, rusb::Error> {
        let handle = self.device.open()?;

        match handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!(
                    "Detaching kernel driver from interface {} on {}",
                    interface,
                    self.transport_id()
                );
                if let Err(e) = handle.detach_kernel_driver(interface) {
                    warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        interface, e
                    );
                }
            }
            Ok(false) => {}
            Err(e) => debug!(
                "Could not check kernel driver status for interface {}: {}",
                interface, e
            ),
        }

        handle.claim_interface(interface)?;
        debug!("Claimed interface {} on {}", interface, self.transport_id());
        Ok(handle)
    }
}

/// Release `interface` and give it back to the kernel
pub fn release(handle: &DeviceHandle<Context>, interface: u8) {
    if let Err(e) = handle.release_interface(interface) {
        debug!("Could not release interface {}: {}", interface, e);
    }
    if let Err(e) = handle.attach_kernel_driver(interface) {
        debug!(
            "Could not reattach kernel driver to interface {}: {}",
            interface, e
        );
    }
}

/// Pick the first bulk IN and first bulk OUT endpoint from
/// `(address, transfer type)` pairs; other endpoint types are ignored
pub fn find_bulk_pipes(endpoints: &[(u8, TransferType)]) -> Option<Endpoints> {
    let first_bulk = |direction: Direction| {
        endpoints
            .iter()
            .filter(|(_, kind)| *kind == TransferType::Bulk)
            .map(|(address, _)| *address)
            .find(|address| endpoint_direction(*address) == direction)
    };

    let bulk_in = first_bulk(Direction::In)?;
    let bulk_out = first_bulk(Direction::Out)?;
    Some(Endpoints::new(bulk_in, bulk_out))
}

fn endpoint_direction(address: u8) -> Direction {
    if address & 0x80 != 0 {
        Direction::In
    } else {
        Direction::Out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_bulk_pipes_picks_first_of_each_direction() {
        let endpoints = [
            (0x83, TransferType::Interrupt),
            (0x81, TransferType::Bulk),
            (0x02, TransferType::Bulk),
            (0x84, TransferType::Bulk),
            (0x05, TransferType::Bulk),
        ];
        let pipes = find_bulk_pipes(&endpoints).unwrap();
        assert_eq!(pipes.bulk_in.address(), 0x81);
        assert_eq!(pipes.bulk_out.address(), 0x02);
        assert_eq!(pipes.control_out.endpoint(), 0);
    }

    #[test]
    fn test_find_bulk_pipes_requires_both_directions() {
        assert!(find_bulk_pipes(&[(0x81, TransferType::Bulk)]).is_none());
        assert!(find_bulk_pipes(&[(0x02, TransferType::Bulk)]).is_none());
        assert!(
            find_bulk_pipes(&[
                (0x81, TransferType::Interrupt),
                (0x02, TransferType::Isochronous),
            ])
            .is_none()
        );
        assert!(find_bulk_pipes(&[]).is_none());
    }

    #[test]
    fn test_endpoint_direction() {
        assert_eq!(endpoint_direction(0x81), Direction::In);
        assert_eq!(endpoint_direction(0x01), Direction::Out);
    }
}
