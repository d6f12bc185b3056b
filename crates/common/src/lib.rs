//! Common utilities for usb-zebu
//!
//! This crate provides shared functionality for the daemon: error handling,
//! logging setup, and the async channel bridge between the Tokio runtime and
//! the USB thread.

pub mod channel;
pub mod error;
pub mod logging;

pub use channel::{DeviceSummary, UsbBridge, UsbCommand, UsbEvent, UsbWorker, create_usb_bridge};
pub use error::{Error, Result};
pub use logging::setup_logging;
