//! USB worker thread
//!
//! Dedicated thread owning the libusb context. It runs the
//! `handle_events()` loop, turns hot-plug notifications into lifecycle
//! events and answers commands from the Tokio runtime.

use crate::usb::manager::DeviceManager;
use common::{UsbCommand, UsbWorker};
use driver::{DeviceLifecycle, IdTable};
use rusb::UsbContext;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What the worker needs besides its channel bridge
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub table: IdTable,
    /// Hardware-level bound on one bulk transfer
    pub transfer_timeout: Duration,
    /// Claim matching devices; false only answers listings
    pub attach: bool,
}

/// USB worker thread
pub struct UsbWorkerThread {
    manager: DeviceManager,
    worker: UsbWorker,
}

impl UsbWorkerThread {
    /// Create a new USB worker thread
    pub fn new(
        worker: UsbWorker,
        lifecycle: DeviceLifecycle,
        options: WorkerOptions,
    ) -> Result<Self, rusb::Error> {
        let mut manager = DeviceManager::new(
            worker.event_tx.clone(),
            lifecycle,
            options.table,
            options.transfer_timeout,
        )?;

        if options.attach {
            manager.initialize()?;
        }

        Ok(Self { manager, worker })
    }

    /// Run the USB worker thread event loop
    ///
    /// Each iteration:
    /// 1. Checks for incoming commands from Tokio (non-blocking)
    /// 2. Processes USB events (with timeout)
    /// 3. Attaches or detaches devices reported by hot-plug
    ///
    /// The loop ends on `Shutdown` or when the bridge is dropped; every
    /// attached device is detached on the way out.
    pub fn run(mut self) -> Result<(), rusb::Error> {
        info!("USB worker thread started");

        loop {
            match self.worker.try_recv_command() {
                Some(UsbCommand::Shutdown) => {
                    info!("USB worker shutting down");
                    break;
                }
                Some(cmd) => self.handle_command(cmd),
                None if self.worker.is_closed() => {
                    info!("USB bridge closed, worker shutting down");
                    break;
                }
                None => {}
            }

            // Bounded wait so commands are checked regularly
            let timeout = Duration::from_millis(100);

            match self.manager.context().handle_events(Some(timeout)) {
                Ok(()) => {}
                Err(rusb::Error::Interrupted) => {
                    debug!("USB event handling interrupted");
                }
                Err(e) => {
                    warn!("Error handling USB events: {}", e);
                    std::thread::sleep(Duration::from_millis(100));
                }
            }

            self.manager.process_hotplug_events();
        }

        self.manager.shutdown();
        info!("USB worker thread stopped");
        Ok(())
    }

    /// Handle a command from the Tokio runtime
    fn handle_command(&mut self, cmd: UsbCommand) {
        // Keep the thread alive if a handler panics
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.handle_command_inner(cmd)
        }));

        if let Err(e) = result {
            error!("Panic in USB command handler: {:?}", e);
        }
    }

    fn handle_command_inner(&mut self, cmd: UsbCommand) {
        match cmd {
            UsbCommand::ListDevices { response } => {
                let devices = self.manager.list_devices();
                debug!("Listing {} devices", devices.len());
                let _ = response.send(devices);
            }

            UsbCommand::Rescan { response } => {
                let created = match self.manager.enumerate_devices() {
                    Ok(created) => created,
                    Err(e) => {
                        warn!("Rescan failed: {}", e);
                        0
                    }
                };
                debug!("Rescan created {} channel(s)", created);
                let _ = response.send(created);
            }

            UsbCommand::Shutdown => {
                // Intercepted by the run loop
            }
        }
    }
}

/// Spawn the USB worker thread
///
/// The thread runs until a Shutdown command is received, the bridge is
/// dropped, or the libusb context cannot be created.
pub fn spawn_usb_worker(
    worker: UsbWorker,
    lifecycle: DeviceLifecycle,
    options: WorkerOptions,
) -> std::io::Result<std::thread::JoinHandle<Result<(), rusb::Error>>> {
    std::thread::Builder::new()
        .name("usb-worker".to_string())
        .spawn(move || {
            let worker_thread = UsbWorkerThread::new(worker, lifecycle, options)?;
            worker_thread.run()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::create_usb_bridge;
    use driver::{ChannelRegistry, MemoryNodes, RegistryConfig};
    use std::sync::Arc;

    #[test]
    fn test_usb_worker_creation() {
        let (_bridge, worker) = create_usb_bridge();
        let registry = Arc::new(ChannelRegistry::new(
            RegistryConfig::default(),
            Arc::new(MemoryNodes::new()),
        ));
        let options = WorkerOptions {
            table: IdTable::with_defaults(),
            transfer_timeout: Duration::from_secs(1),
            attach: false,
        };

        // USB context creation may fail without permissions or hardware
        match UsbWorkerThread::new(worker, DeviceLifecycle::new(registry), options) {
            Ok(_) => {}
            Err(e) => eprintln!(
                "USB worker creation failed (expected without USB access): {}",
                e
            ),
        }
    }
}
