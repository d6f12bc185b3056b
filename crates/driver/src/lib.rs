//! Core of the usb-zebu driver shim
//!
//! This crate turns a fire-and-forget bulk transport into a blocking,
//! byte-stream device channel. It owns everything that is independent of the
//! concrete USB stack:
//!
//! - [`MinorAllocator`]: bounded pool of channel identifiers
//! - [`ChannelRegistry`]: process-wide table of live channels and their nodes
//! - the transfer bridge ([`Session::write`]): blocking submit/wait/cancel over
//!   an asynchronous [`Transport`]
//! - [`DeviceLifecycle`]: reacts to attach/detach/suspend/resume events
//!
//! The host process supplies a [`Transport`] per device and a [`NodeFacility`]
//! that makes channels visible to clients.
//!
//! # Example
//!
//! ```
//! use driver::test_utils::{MockTransport, mock_endpoints, mock_identity};
//! use driver::{ChannelRegistry, DeviceLifecycle, MemoryNodes, RegistryConfig, TransportId};
//! use std::sync::Arc;
//!
//! let registry = Arc::new(ChannelRegistry::new(
//!     RegistryConfig::default(),
//!     Arc::new(MemoryNodes::new()),
//! ));
//! let lifecycle = DeviceLifecycle::new(registry.clone());
//!
//! let transport = Arc::new(MockTransport::new());
//! let channel = lifecycle
//!     .on_attach(TransportId::new(1, 4), mock_identity(), mock_endpoints(), transport.clone())
//!     .unwrap();
//! assert_eq!(channel.name(), "zebu-001-004");
//!
//! let session = registry.open("zebu-001-004").unwrap();
//! assert_eq!(session.write(b"hello").unwrap(), 5);
//! assert_eq!(transport.submissions(), vec![b"hello".to_vec()]);
//! ```

pub mod channel;
pub mod device;
pub mod error;
pub mod id_table;
pub mod lifecycle;
pub mod minor;
pub mod node;
pub mod registry;
pub mod session;
pub mod test_utils;
pub mod transfer;
pub mod transport;

pub use channel::{Channel, ChannelHandle, ChannelInfo};
pub use device::{DeviceIdentity, DeviceInstance, Endpoints, Pipe, PipeKind, TransportId};
pub use error::{DriverError, Result, TransportError};
pub use id_table::{DeviceMatch, IdTable};
pub use lifecycle::{DeviceLifecycle, LifecycleEvent};
pub use minor::{MAX_MINORS, Minor, MinorAllocator};
pub use node::{MemoryNodes, NodeFacility, NodeHandle, NodeSpec};
pub use registry::{ChannelRegistry, RegistryConfig};
pub use session::Session;
pub use transfer::{InterruptToken, SlotState, TransferSettings};
pub use transport::{Completion, TransferId, TransferOutcome, TransferRequest, TransferStatus, Transport};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the guard if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
