//! Async channel bridge between Tokio runtime and USB thread

use async_channel::{Receiver, Sender, bounded};
use driver::{DeviceIdentity, Minor, TransportId};

/// A device seen on the bus, for listings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSummary {
    pub transport: TransportId,
    pub identity: DeviceIdentity,
    /// Whether the id table accepts the device
    pub matched: bool,
    /// Channel name, if the device has one
    pub channel: Option<String>,
}

/// Commands from Tokio runtime to USB thread
#[derive(Debug)]
pub enum UsbCommand {
    /// List all connected USB devices
    ListDevices {
        /// Channel to send response back
        response: tokio::sync::oneshot::Sender<Vec<DeviceSummary>>,
    },

    /// Re-enumerate the bus and attach matching devices not yet seen
    Rescan {
        /// Number of channels created by the scan
        response: tokio::sync::oneshot::Sender<usize>,
    },

    /// Shutdown the USB thread gracefully
    Shutdown,
}

/// Lifecycle events from the device manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsbEvent {
    /// A matching device got a channel
    ChannelCreated {
        name: String,
        minor: Minor,
        transport: TransportId,
        identity: DeviceIdentity,
    },

    /// A channel was torn down after its device left
    ChannelRemoved {
        name: String,
        transport: TransportId,
    },

    /// A matching device could not be given a channel
    AttachFailed {
        transport: TransportId,
        reason: String,
    },
}

/// Handle for Tokio runtime (async)
#[derive(Clone)]
pub struct UsbBridge {
    cmd_tx: Sender<UsbCommand>,
    event_rx: Receiver<UsbEvent>,
}

impl UsbBridge {
    /// Send a command to the USB thread
    pub async fn send_command(&self, cmd: UsbCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive an event from the USB thread
    pub async fn recv_event(&self) -> crate::Result<UsbEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// List devices via the USB thread
    pub async fn list_devices(&self) -> crate::Result<Vec<DeviceSummary>> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send_command(UsbCommand::ListDevices { response: tx })
            .await?;
        rx.await.map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Ask the USB thread to attach devices it missed; returns channels created
    pub async fn rescan(&self) -> crate::Result<usize> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send_command(UsbCommand::Rescan { response: tx }).await?;
        rx.await.map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Handle for USB thread (blocking)
pub struct UsbWorker {
    pub(crate) cmd_rx: Receiver<UsbCommand>,
    /// Event sender (public for USB worker thread to access)
    pub event_tx: Sender<UsbEvent>,
}

impl UsbWorker {
    /// Receive a command from Tokio runtime (blocking)
    pub fn recv_command(&self) -> crate::Result<UsbCommand> {
        self.cmd_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive a command without blocking
    pub fn try_recv_command(&self) -> Option<UsbCommand> {
        self.cmd_rx.try_recv().ok()
    }

    /// True once every [`UsbBridge`] has been dropped
    pub fn is_closed(&self) -> bool {
        self.cmd_rx.is_closed()
    }
}

/// Create the channel bridge between Tokio and USB thread
///
/// Returns (UsbBridge for Tokio, UsbWorker for USB thread)
pub fn create_usb_bridge() -> (UsbBridge, UsbWorker) {
    let (cmd_tx, cmd_rx) = bounded(256);
    let (event_tx, event_rx) = bounded(256);

    (
        UsbBridge { cmd_tx, event_rx },
        UsbWorker { cmd_rx, event_tx },
    )
}
