//! TCP client transport

use dashmap::DashMap;
use std::sync::Arc;
use tether_core::{ConnectionId, EventBridge};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::link::{self, Peers};
use crate::{TransportConfig, TransportError};

/// A single outbound connection.
///
/// Dropping the client aborts its socket task.
pub struct TcpClient {
    remote: ConnectionId,
    bridge: Arc<EventBridge>,
    peers: Peers,
    task: JoinHandle<()>,
}

impl TcpClient {
    /// Connect, blocking the calling thread until the socket is established.
    pub fn connect(handle: &Handle, config: &TransportConfig) -> Result<Self, TransportError> {
        let addr = config.socket_addr()?;
        let stream = handle
            .block_on(TcpStream::connect(addr))
            .map_err(|source| TransportError::Connect {
                endpoint: addr,
                source,
            })?;

        let remote = ConnectionId::from(addr);
        let bridge = Arc::new(EventBridge::new(config.max_frame_len));
        let peers: Peers = Arc::new(DashMap::new());

        let pump = link::open(
            stream,
            remote.clone(),
            &bridge,
            &peers,
            config.buffer_size,
            config.no_delay,
        );
        let task = handle.spawn(pump);
        tracing::info!(endpoint = %remote, "tcp client connected");

        Ok(Self {
            remote,
            bridge,
            peers,
            task,
        })
    }

    pub fn remote(&self) -> &ConnectionId {
        &self.remote
    }

    pub fn bridge(&self) -> &Arc<EventBridge> {
        &self.bridge
    }

    pub fn is_connected(&self) -> bool {
        self.peers.contains_key(&self.remote)
    }

    /// Send one frame. `Ok(false)` if the connection has closed.
    pub fn send(&self, tag: u8, payload: &[u8]) -> Result<bool, TransportError> {
        link::send(&self.peers, &self.remote, tag, payload)
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.task.abort();
        self.peers.clear();
        tracing::debug!(endpoint = %self.remote, "tcp client disposed");
    }
}
