//! usb-zebu daemon library
//!
//! Hosts the driver core in user space: configuration, the rusb backed
//! device manager and the socket nodes the channels are exposed through.

pub mod config;
pub mod node;
pub mod usb;
