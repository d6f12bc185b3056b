//! Node facility
//!
//! A node is what makes a channel reachable by name. The registry asks the
//! facility to create one when a channel is created and to remove it when the
//! channel is destroyed; creation failure aborts channel creation.

use crate::minor::Minor;
use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::debug;

/// What the registry asks the facility to expose
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    pub name: String,
    pub minor: Minor,
}

/// An exposed node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeHandle {
    pub name: String,
    pub minor: Minor,
    /// Filesystem location, for facilities that have one
    pub path: Option<PathBuf>,
}

/// Mechanism that makes channels visible to clients
pub trait NodeFacility: Send + Sync {
    /// Expose a node; `AlreadyExists` signals a name collision, any other
    /// error means the facility could not allocate the entry
    fn create(&self, spec: &NodeSpec) -> io::Result<NodeHandle>;

    /// Remove a node created by this facility
    fn remove(&self, node: &NodeHandle);
}

/// In-process node table, used when nothing outside the process needs to see
/// the nodes
#[derive(Debug, Default)]
pub struct MemoryNodes {
    names: Mutex<HashSet<String>>,
    limit: Option<usize>,
}

impl MemoryNodes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Facility that refuses to hold more than `limit` nodes
    pub fn with_limit(limit: usize) -> Self {
        Self {
            names: Mutex::new(HashSet::new()),
            limit: Some(limit),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        crate::lock(&self.names).contains(name)
    }

    pub fn len(&self) -> usize {
        crate::lock(&self.names).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NodeFacility for MemoryNodes {
    fn create(&self, spec: &NodeSpec) -> io::Result<NodeHandle> {
        let mut names = crate::lock(&self.names);
        if self.limit.is_some_and(|limit| names.len() >= limit) {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "node table full",
            ));
        }
        if !names.insert(spec.name.clone()) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("node {} exists", spec.name),
            ));
        }
        debug!("Created in-memory node {} (minor {})", spec.name, spec.minor);
        Ok(NodeHandle {
            name: spec.name.clone(),
            minor: spec.minor,
            path: None,
        })
    }

    fn remove(&self, node: &NodeHandle) {
        if crate::lock(&self.names).remove(&node.name) {
            debug!("Removed in-memory node {}", node.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, minor: u8) -> NodeSpec {
        NodeSpec {
            name: name.to_string(),
            minor: Minor(minor),
        }
    }

    #[test]
    fn test_create_and_remove() {
        let nodes = MemoryNodes::new();
        let node = nodes.create(&spec("zebu-001-002", 0)).unwrap();
        assert!(nodes.contains("zebu-001-002"));
        assert_eq!(node.minor, Minor(0));

        nodes.remove(&node);
        assert!(nodes.is_empty());
        // second removal is harmless
        nodes.remove(&node);
    }

    #[test]
    fn test_duplicate_name_is_already_exists() {
        let nodes = MemoryNodes::new();
        nodes.create(&spec("a", 0)).unwrap();
        let err = nodes.create(&spec("a", 1)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_limit() {
        let nodes = MemoryNodes::with_limit(1);
        nodes.create(&spec("a", 0)).unwrap();
        let err = nodes.create(&spec("b", 1)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::OutOfMemory);
    }
}
