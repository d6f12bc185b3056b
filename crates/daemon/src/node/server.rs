//! Node server
//!
//! Serves connections on the channel sockets. A connection is one session:
//!
//! - connect opens a session on the channel
//! - every chunk the client sends is written to the device, blocking on a
//!   worker thread so the runtime stays responsive
//! - the socket's write direction is shut down immediately, so client reads
//!   see end-of-stream
//! - disconnect closes the session; a failed write closes the connection

use crate::node::socket::NodeEvent;
use async_channel::Receiver;
use driver::{ChannelRegistry, Session};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct NodeServer {
    registry: Arc<ChannelRegistry>,
    events: Receiver<NodeEvent>,
    listeners: HashMap<String, JoinHandle<()>>,
}

impl NodeServer {
    pub fn new(registry: Arc<ChannelRegistry>, events: Receiver<NodeEvent>) -> Self {
        Self {
            registry,
            events,
            listeners: HashMap::new(),
        }
    }

    /// Serve nodes until the facility is dropped
    pub async fn run(mut self) {
        info!("Node server running");

        while let Ok(event) = self.events.recv().await {
            match event {
                NodeEvent::Created { name, listener } => {
                    let listener = match UnixListener::from_std(listener) {
                        Ok(listener) => listener,
                        Err(e) => {
                            error!("Cannot serve node {}: {}", name, e);
                            continue;
                        }
                    };
                    let task =
                        tokio::spawn(accept_loop(self.registry.clone(), name.clone(), listener));
                    if let Some(old) = self.listeners.insert(name, task) {
                        old.abort();
                    }
                }
                NodeEvent::Removed { name } => {
                    if let Some(task) = self.listeners.remove(&name) {
                        task.abort();
                        debug!("Stopped serving node {}", name);
                    }
                }
            }
        }

        for (_, task) in self.listeners.drain() {
            task.abort();
        }
        info!("Node server stopped");
    }
}

async fn accept_loop(registry: Arc<ChannelRegistry>, name: String, listener: UnixListener) {
    debug!("Serving node {}", name);

    loop {
        let stream = match listener.accept().await {
            Ok((stream, _addr)) => stream,
            Err(e) => {
                warn!("Accept failed on node {}: {}", name, e);
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                continue;
            }
        };

        match registry.open(&name) {
            Ok(session) => {
                tokio::spawn(serve_session(session, stream));
            }
            Err(e) => {
                // Dropping the stream closes the connection
                warn!("Open on {} refused: {}", name, e);
            }
        }
    }
}

/// Pump one connection into its session until either side gives up
pub async fn serve_session(session: Session, stream: UnixStream) {
    let name = session.channel().name().to_string();
    let chunk_size = session.channel().settings().max_transfer_size;
    debug!("Client connected to {}", name);

    let (mut reader, mut writer) = stream.into_split();
    if let Err(e) = writer.shutdown().await {
        debug!("Could not shut down write half of {}: {}", name, e);
    }

    let session = Arc::new(session);
    let mut buf = vec![0u8; chunk_size];

    'connection: loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("Read from client of {} failed: {}", name, e);
                break;
            }
        };

        let mut pending = buf[..n].to_vec();
        while !pending.is_empty() {
            let writer_session = session.clone();
            let chunk = std::mem::take(&mut pending);
            let result =
                tokio::task::spawn_blocking(move || (writer_session.write(&chunk), chunk)).await;

            match result {
                Ok((Ok(written), chunk)) if written > 0 => {
                    pending = chunk[written.min(chunk.len())..].to_vec();
                }
                Ok((Ok(_), _)) => {
                    warn!("Device behind {} accepted no data, closing connection", name);
                    break 'connection;
                }
                Ok((Err(e), _)) => {
                    warn!(
                        "Write on {} failed: {} (errno {}), closing connection",
                        name,
                        e,
                        e.errno()
                    );
                    break 'connection;
                }
                Err(e) => {
                    error!("Write task for {} failed: {}", name, e);
                    break 'connection;
                }
            }
        }
    }

    debug!("Client disconnected from {}", name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use driver::test_utils::{MockTransport, mock_device};
    use driver::{MemoryNodes, RegistryConfig};
    use tokio::time::{Duration, timeout};

    #[tokio::test]
    async fn test_serve_session_writes_and_reports_eof() {
        let transport = Arc::new(MockTransport::new());
        let registry = Arc::new(ChannelRegistry::new(
            RegistryConfig::default(),
            Arc::new(MemoryNodes::new()),
        ));
        let channel = registry
            .create_channel(mock_device(1, 2, transport.clone()))
            .unwrap();

        let (client, server_side) = UnixStream::pair().unwrap();
        let session = registry.open(channel.name()).unwrap();
        let task = tokio::spawn(serve_session(session, server_side));

        let (mut rd, mut wr) = client.into_split();
        let mut buf = [0u8; 8];
        // read side is end-of-stream from the start
        assert_eq!(rd.read(&mut buf).await.unwrap(), 0);

        wr.write_all(b"payload").await.unwrap();
        wr.shutdown().await.unwrap();
        drop(wr);

        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(transport.submissions().concat(), b"payload".to_vec());
        assert_eq!(channel.open_sessions(), 0);
    }
}
