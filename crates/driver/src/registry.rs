//! Channel registry
//!
//! Process-wide table of live channels keyed by transport identity. Channel
//! creation and destruction (identifier, node, table entry) happen under one
//! lock, so an `open` racing with either observes a complete channel or
//! `NotFound`, never a half-built one.

use crate::channel::{Channel, ChannelHandle, ChannelInfo};
use crate::device::{DeviceInstance, TransportId};
use crate::error::{DriverError, Result};
use crate::minor::{MAX_MINORS, Minor, MinorAllocator};
use crate::node::{NodeFacility, NodeHandle, NodeSpec};
use crate::session::Session;
use crate::transfer::TransferSettings;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};

/// Default channel name prefix
pub const DEFAULT_NAME_PREFIX: &str = "zebu";

/// Registry tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Identifier pool size (at most [`MAX_MINORS`])
    pub max_devices: usize,
    /// Prefix of every channel name
    pub name_prefix: String,
    /// Settings handed to each new channel
    pub transfer: TransferSettings,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_devices: MAX_MINORS,
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            transfer: TransferSettings::default(),
        }
    }
}

struct Entry {
    channel: ChannelHandle,
    node: NodeHandle,
}

#[derive(Default)]
struct Table {
    by_transport: HashMap<TransportId, Entry>,
    by_name: HashMap<String, TransportId>,
}

impl Table {
    fn lookup(&self, name: &str) -> Option<&Entry> {
        self.by_name
            .get(name)
            .and_then(|id| self.by_transport.get(id))
    }
}

/// Table of live channels and owner of their nodes
pub struct ChannelRegistry {
    config: RegistryConfig,
    minors: MinorAllocator,
    nodes: Arc<dyn NodeFacility>,
    table: Mutex<Table>,
}

impl ChannelRegistry {
    pub fn new(config: RegistryConfig, nodes: Arc<dyn NodeFacility>) -> Self {
        let minors = MinorAllocator::new(config.max_devices);
        Self {
            config,
            minors,
            nodes,
            table: Mutex::new(Table::default()),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn minors(&self) -> &MinorAllocator {
        &self.minors
    }

    /// Name of the channel a device with this identity gets
    pub fn channel_name(&self, id: TransportId) -> String {
        format!("{}-{}", self.config.name_prefix, id)
    }

    /// Create and expose a channel for `device`
    ///
    /// On any failure nothing remains registered and the identifier is
    /// returned to the pool.
    pub fn create_channel(&self, device: DeviceInstance) -> Result<ChannelHandle> {
        let id = device.id();
        let name = self.channel_name(id);
        let mut table = crate::lock(&self.table);

        if table.by_transport.contains_key(&id) || table.by_name.contains_key(&name) {
            error!("Channel name {} is already live for {}", name, id);
            return Err(DriverError::NameCollision(name));
        }

        let minor = self.minors.allocate()?;
        let spec = NodeSpec {
            name: name.clone(),
            minor,
        };
        let node = match self.nodes.create(&spec) {
            Ok(node) => node,
            Err(e) => {
                self.minors.release(minor);
                error!("Failed to create node {}: {}", name, e);
                return Err(match e.kind() {
                    io::ErrorKind::AlreadyExists => DriverError::NameCollision(name),
                    _ => DriverError::ResourceExhausted(format!("node {}: {}", name, e)),
                });
            }
        };

        let channel = Arc::new(Channel::new(
            minor,
            name.clone(),
            device,
            self.config.transfer.clone(),
        ));
        table.by_name.insert(name.clone(), id);
        table.by_transport.insert(
            id,
            Entry {
                channel: channel.clone(),
                node,
            },
        );

        info!("Created channel {} (minor {}) for device {}", name, minor, id);
        Ok(channel)
    }

    /// Remove the channel's node and release its identifier
    ///
    /// Calling this for a channel that is already gone is a no-op.
    pub fn destroy_channel(&self, channel: &ChannelHandle) {
        let mut table = crate::lock(&self.table);
        let id = channel.transport_id();

        let live = table
            .by_transport
            .get(&id)
            .is_some_and(|entry| Arc::ptr_eq(&entry.channel, channel));
        if !live {
            debug!("Channel {} already destroyed", channel.name());
            return;
        }

        if let Some(entry) = table.by_transport.remove(&id) {
            table.by_name.remove(entry.channel.name());
            entry.channel.mark_detached();
            self.nodes.remove(&entry.node);
            self.minors.release(entry.channel.minor());
            info!(
                "Destroyed channel {} (minor {})",
                entry.channel.name(),
                entry.channel.minor()
            );
        }
    }

    /// Open a session on the channel called `name`
    pub fn open(&self, name: &str) -> Result<Session> {
        let table = crate::lock(&self.table);
        let entry = table.lookup(name).ok_or(DriverError::NotFound)?;
        Session::open(entry.channel.clone())
    }

    /// Open a session on the channel holding `minor`
    pub fn open_minor(&self, minor: Minor) -> Result<Session> {
        let table = crate::lock(&self.table);
        let entry = table
            .by_transport
            .values()
            .find(|entry| entry.channel.minor() == minor)
            .ok_or(DriverError::NotFound)?;
        Session::open(entry.channel.clone())
    }

    pub fn get(&self, id: TransportId) -> Option<ChannelHandle> {
        crate::lock(&self.table)
            .by_transport
            .get(&id)
            .map(|entry| entry.channel.clone())
    }

    pub fn get_by_name(&self, name: &str) -> Option<ChannelHandle> {
        crate::lock(&self.table)
            .lookup(name)
            .map(|entry| entry.channel.clone())
    }

    /// Snapshot of live channels ordered by minor
    pub fn channels(&self) -> Vec<ChannelInfo> {
        let handles: Vec<ChannelHandle> = crate::lock(&self.table)
            .by_transport
            .values()
            .map(|entry| entry.channel.clone())
            .collect();

        let mut infos: Vec<ChannelInfo> = handles.iter().map(|c| c.info()).collect();
        infos.sort_by_key(|info| info.minor);
        infos
    }

    pub fn len(&self) -> usize {
        crate::lock(&self.table).by_transport.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Interrupt every blocked writer
    pub fn interrupt_all(&self) {
        let handles: Vec<ChannelHandle> = crate::lock(&self.table)
            .by_transport
            .values()
            .map(|entry| entry.channel.clone())
            .collect();

        for channel in handles {
            channel.interrupt_inflight();
        }
    }
}
