//! USB subsystem
//!
//! Device enumeration, hot-plug detection and bulk transfer execution on
//! top of rusb. Everything here runs on the dedicated USB worker thread or
//! on the per-device transfer executors, never on the Tokio runtime.

pub mod device;
pub mod manager;
pub mod transport;
pub mod worker;

pub use device::{ProbeMatch, UsbDevice, find_bulk_pipes};
pub use manager::DeviceManager;
pub use transport::{RusbTransport, map_rusb_error};
pub use worker::{UsbWorkerThread, WorkerOptions, spawn_usb_worker};
