//! USB device manager
//!
//! Handles device enumeration and hot-plug events, claims matching devices
//! and feeds their arrival and departure to the lifecycle controller. This
//! module runs in the USB thread.

use crate::usb::device::{self, UsbDevice};
use crate::usb::transport::RusbTransport;
use common::{DeviceSummary, UsbEvent};
use driver::{DeviceLifecycle, IdTable, TransportId};
use rusb::{Context, Device, DeviceHandle, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// A claimed device with a live channel
struct AttachedDevice {
    handle: Arc<DeviceHandle<Context>>,
    interface: u8,
    transport: Arc<RusbTransport>,
    executor: Option<JoinHandle<()>>,
    channel: String,
}

impl AttachedDevice {
    /// Stop the executor and hand the interface back to the kernel
    fn release(mut self) {
        self.transport.close();
        if let Some(executor) = self.executor.take()
            && executor.join().is_err()
        {
            error!("Transfer executor for {} panicked", self.channel);
        }
        device::release(&self.handle, self.interface);
    }
}

enum HotplugEvent {
    Arrived(Device<Context>),
    Left(TransportId),
}

/// USB device manager
pub struct DeviceManager {
    context: Context,
    lifecycle: DeviceLifecycle,
    table: IdTable,
    transfer_timeout: Duration,
    attached: HashMap<TransportId, AttachedDevice>,
    hotplug_tx: Sender<HotplugEvent>,
    hotplug_rx: Receiver<HotplugEvent>,
    _hotplug_registration: Option<Registration<Context>>,
    event_sender: async_channel::Sender<UsbEvent>,
}

impl DeviceManager {
    pub fn new(
        event_sender: async_channel::Sender<UsbEvent>,
        lifecycle: DeviceLifecycle,
        table: IdTable,
        transfer_timeout: Duration,
    ) -> Result<Self, rusb::Error> {
        let context = Context::new()?;
        let (hotplug_tx, hotplug_rx) = mpsc::channel();

        Ok(Self {
            context,
            lifecycle,
            table,
            transfer_timeout,
            attached: HashMap::new(),
            hotplug_tx,
            hotplug_rx,
            _hotplug_registration: None,
            event_sender,
        })
    }

    /// Attach every matching device present now and watch for hot-plug
    pub fn initialize(&mut self) -> Result<(), rusb::Error> {
        let created = self.enumerate_devices()?;
        self.register_hotplug()?;

        info!("Device manager initialized with {} channel(s)", created);
        Ok(())
    }

    /// Attach matching devices not yet attached; returns channels created
    pub fn enumerate_devices(&mut self) -> Result<usize, rusb::Error> {
        let devices = self.context.devices()?;
        let mut created = 0;
        for device in devices.iter() {
            if self.handle_device_arrived(device) {
                created += 1;
            }
        }
        Ok(created)
    }

    fn register_hotplug(&mut self) -> Result<(), rusb::Error> {
        if !rusb::has_hotplug() {
            warn!("libusb has no hot-plug support; only devices present at startup are served");
            return Ok(());
        }

        let callback = HotplugCallback {
            events: self.hotplug_tx.clone(),
        };
        let registration = HotplugBuilder::new()
            .enumerate(false) // We already enumerated
            .register(&self.context, Box::new(callback))?;

        self._hotplug_registration = Some(registration);
        debug!("Hot-plug callbacks registered");
        Ok(())
    }

    /// Drain events queued by the hot-plug callback
    pub fn process_hotplug_events(&mut self) {
        while let Ok(event) = self.hotplug_rx.try_recv() {
            match event {
                HotplugEvent::Arrived(device) => {
                    self.handle_device_arrived(device);
                }
                HotplugEvent::Left(id) => self.handle_device_left(id),
            }
        }
    }

    /// Probe, claim and attach a device; true if a channel was created
    pub fn handle_device_arrived(&mut self, device: Device<Context>) -> bool {
        let usb_device = match UsbDevice::new(device) {
            Ok(d) => d,
            Err(e) => {
                debug!("Skipping device without descriptor: {}", e);
                return false;
            }
        };
        let id = usb_device.transport_id();
        if self.attached.contains_key(&id) {
            return false;
        }

        let Some(probe) = usb_device.probe(&self.table) else {
            debug!(
                "Device {} ({:04x}:{:04x}) not handled",
                id,
                usb_device.vendor_id(),
                usb_device.product_id()
            );
            return false;
        };

        let handle = match usb_device.open(probe.interface) {
            Ok(handle) => Arc::new(handle),
            Err(e) => {
                warn!("Failed to claim device {}: {}", id, e);
                self.send_event(UsbEvent::AttachFailed {
                    transport: id,
                    reason: e.to_string(),
                });
                return false;
            }
        };

        let (transport, executor) =
            match RusbTransport::spawn(id, handle.clone(), self.transfer_timeout) {
                Ok(spawned) => spawned,
                Err(e) => {
                    error!("Failed to spawn transfer executor for {}: {}", id, e);
                    device::release(&handle, probe.interface);
                    self.send_event(UsbEvent::AttachFailed {
                        transport: id,
                        reason: e.to_string(),
                    });
                    return false;
                }
            };

        let attached = AttachedDevice {
            handle,
            interface: probe.interface,
            transport: transport.clone(),
            executor: Some(executor),
            channel: String::new(),
        };

        match self
            .lifecycle
            .on_attach(id, probe.identity, probe.endpoints, transport)
        {
            Ok(channel) => {
                self.send_event(UsbEvent::ChannelCreated {
                    name: channel.name().to_string(),
                    minor: channel.minor(),
                    transport: id,
                    identity: probe.identity,
                });
                self.attached.insert(
                    id,
                    AttachedDevice {
                        channel: channel.name().to_string(),
                        ..attached
                    },
                );
                true
            }
            Err(e) => {
                attached.release();
                self.send_event(UsbEvent::AttachFailed {
                    transport: id,
                    reason: e.to_string(),
                });
                false
            }
        }
    }

    /// Tear down the channel of a departed device
    pub fn handle_device_left(&mut self, id: TransportId) {
        let Some(attached) = self.attached.remove(&id) else {
            debug!("Untracked device {} left", id);
            return;
        };

        // Fail queued transfers fast, then let the lifecycle drain the slot
        attached.transport.close();
        self.lifecycle.on_detach(id);
        let name = attached.channel.clone();
        attached.release();

        self.send_event(UsbEvent::ChannelRemoved {
            name,
            transport: id,
        });
    }

    /// Every device on the bus, whether handled or not
    pub fn list_devices(&self) -> Vec<DeviceSummary> {
        let devices = match self.context.devices() {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Failed to enumerate devices: {}", e);
                return Vec::new();
            }
        };

        let registry = self.lifecycle.registry();
        let mut summaries: Vec<DeviceSummary> = devices
            .iter()
            .filter_map(|device| UsbDevice::new(device).ok())
            .map(|usb_device| {
                let transport = usb_device.transport_id();
                let probe = usb_device.probe(&self.table);
                DeviceSummary {
                    transport,
                    identity: probe.map_or_else(|| usb_device.identity(), |p| p.identity),
                    matched: probe.is_some(),
                    channel: registry.get(transport).map(|c| c.name().to_string()),
                }
            })
            .collect();
        summaries.sort_by_key(|s| s.transport);
        summaries
    }

    /// Detach every attached device
    pub fn shutdown(&mut self) {
        let ids: Vec<TransportId> = self.attached.keys().copied().collect();
        for id in ids {
            self.handle_device_left(id);
        }
    }

    /// Get USB context
    pub fn context(&self) -> &Context {
        &self.context
    }

    fn send_event(&self, event: UsbEvent) {
        if let Err(e) = self.event_sender.try_send(event) {
            debug!("Dropped USB event: {}", e);
        }
    }
}

/// Hot-plug callback handler
///
/// Runs inside `handle_events`, so it only queues the event for
/// [`DeviceManager::process_hotplug_events`].
struct HotplugCallback {
    events: Sender<HotplugEvent>,
}

impl Hotplug<Context> for HotplugCallback {
    fn device_arrived(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug callback: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        let _ = self.events.send(HotplugEvent::Arrived(device));
    }

    fn device_left(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug callback: device left (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        let id = TransportId::new(device.bus_number(), device.address());
        let _ = self.events.send(HotplugEvent::Left(id));
    }
}
