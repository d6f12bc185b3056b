//! Unix socket node facility
//!
//! Each channel node is a listening Unix domain socket at
//! `<node_dir>/<name>`. The socket is bound synchronously while the registry
//! creates the channel, then handed to the [`NodeServer`](super::NodeServer)
//! through an event queue so connections are served on the Tokio runtime.

use async_channel::{Receiver, Sender, unbounded};
use driver::{NodeFacility, NodeHandle, NodeSpec};
use std::fs;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Node changes for the node server
#[derive(Debug)]
pub enum NodeEvent {
    Created { name: String, listener: UnixListener },
    Removed { name: String },
}

/// Node facility creating one listening socket per channel
pub struct SocketNodes {
    dir: PathBuf,
    events: Sender<NodeEvent>,
}

impl SocketNodes {
    /// Create the facility, making `dir` if needed
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<(Self, Receiver<NodeEvent>)> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let (events, rx) = unbounded();
        Ok((Self { dir, events }, rx))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

impl NodeFacility for SocketNodes {
    fn create(&self, spec: &NodeSpec) -> io::Result<NodeHandle> {
        let path = self.path_for(&spec.name);

        // The registry rejects live duplicates, so a socket here is a
        // leftover from an earlier run; anything else is not ours
        match fs::symlink_metadata(&path) {
            Ok(meta) if meta.file_type().is_socket() => {
                fs::remove_file(&path)?;
                debug!("Removed stale node {}", path.display());
            }
            Ok(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} exists and is not a socket", path.display()),
                ));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let listener = UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;

        if self
            .events
            .try_send(NodeEvent::Created {
                name: spec.name.clone(),
                listener,
            })
            .is_err()
        {
            let _ = fs::remove_file(&path);
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "node server is not running",
            ));
        }

        debug!("Created node {} (minor {})", path.display(), spec.minor);
        Ok(NodeHandle {
            name: spec.name.clone(),
            minor: spec.minor,
            path: Some(path),
        })
    }

    fn remove(&self, node: &NodeHandle) {
        let _ = self.events.try_send(NodeEvent::Removed {
            name: node.name.clone(),
        });

        if let Some(path) = &node.path {
            match fs::remove_file(path) {
                Ok(()) => debug!("Removed node {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove node {}: {}", path.display(), e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driver::Minor;
    use tempfile::tempdir;

    fn spec(name: &str) -> NodeSpec {
        NodeSpec {
            name: name.to_string(),
            minor: Minor(0),
        }
    }

    #[test]
    fn test_create_binds_socket_and_announces_it() {
        let dir = tempdir().unwrap();
        let (nodes, events) = SocketNodes::new(dir.path()).unwrap();

        let node = nodes.create(&spec("zebu-001-002")).unwrap();
        let path = dir.path().join("zebu-001-002");
        assert_eq!(node.path.as_deref(), Some(path.as_path()));
        assert!(path.exists());

        match events.try_recv().unwrap() {
            NodeEvent::Created { name, .. } => assert_eq!(name, "zebu-001-002"),
            other => panic!("unexpected event: {:?}", other),
        }

        nodes.remove(&node);
        assert!(!path.exists());
        assert!(matches!(
            events.try_recv().unwrap(),
            NodeEvent::Removed { .. }
        ));
    }

    #[test]
    fn test_stale_socket_is_replaced() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("zebu-001-002");
        drop(UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let (nodes, _events) = SocketNodes::new(dir.path()).unwrap();
        assert!(nodes.create(&spec("zebu-001-002")).is_ok());
    }

    #[test]
    fn test_regular_file_is_left_alone() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("zebu-001-002");
        fs::write(&path, b"not a node").unwrap();

        let (nodes, events) = SocketNodes::new(dir.path()).unwrap();
        let err = nodes.create(&spec("zebu-001-002")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(fs::read(&path).unwrap(), b"not a node");
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_create_fails_without_server() {
        let dir = tempdir().unwrap();
        let (nodes, events) = SocketNodes::new(dir.path()).unwrap();
        drop(events);

        let err = nodes.create(&spec("zebu-001-002")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(!dir.path().join("zebu-001-002").exists());
    }

    #[test]
    fn test_new_creates_directory() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("run").join("usb-zebu");
        let (nodes, _events) = SocketNodes::new(&nested).unwrap();
        assert!(nested.is_dir());
        assert_eq!(nodes.dir(), nested.as_path());
    }
}
