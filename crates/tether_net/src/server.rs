//! TCP server transport

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tether_core::{ConnectionId, EventBridge};
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::task::{JoinHandle, JoinSet};

use crate::link::{self, Peers};
use crate::{TransportConfig, TransportError};

/// A listening socket and every connection it accepted.
///
/// Dropping the server stops accepting and aborts all connection tasks.
pub struct TcpServer {
    local_addr: SocketAddr,
    bridge: Arc<EventBridge>,
    peers: Peers,
    accept_task: JoinHandle<()>,
}

impl TcpServer {
    /// Bind and start accepting. Binding blocks the calling thread.
    pub fn bind(handle: &Handle, config: &TransportConfig) -> Result<Self, TransportError> {
        let addr = config.socket_addr()?;
        let listener = handle
            .block_on(TcpListener::bind(addr))
            .map_err(|source| TransportError::Bind {
                endpoint: addr,
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| TransportError::Bind {
            endpoint: addr,
            source,
        })?;

        let bridge = Arc::new(EventBridge::new(config.max_frame_len));
        let peers: Peers = Arc::new(DashMap::new());
        let accept_task = handle.spawn(accept_loop(
            listener,
            Arc::clone(&bridge),
            Arc::clone(&peers),
            config.buffer_size,
            config.no_delay,
        ));
        tracing::info!(endpoint = %local_addr, "tcp server listening");

        Ok(Self {
            local_addr,
            bridge,
            peers,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn bridge(&self) -> &Arc<EventBridge> {
        &self.bridge
    }

    /// Endpoints of every currently connected client.
    pub fn clients(&self) -> Vec<ConnectionId> {
        self.peers.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Send one frame to the client at `endpoint`. `Ok(false)` if it is not
    /// connected.
    pub fn send(&self, endpoint: &ConnectionId, tag: u8, payload: &[u8]) -> Result<bool, TransportError> {
        link::send(&self.peers, endpoint, tag, payload)
    }
}

async fn accept_loop(
    listener: TcpListener,
    bridge: Arc<EventBridge>,
    peers: Peers,
    buffer_size: usize,
    no_delay: bool,
) {
    // Dropping the set on abort tears down every connection task.
    let mut links = JoinSet::new();
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::error!(%err, "accept failed");
                continue;
            }
        };
        tracing::debug!(connection = %remote, "client accepted");
        links.spawn(link::open(
            stream,
            ConnectionId::from(remote),
            &bridge,
            &peers,
            buffer_size,
            no_delay,
        ));
        while links.try_join_next().is_some() {}
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.peers.clear();
        tracing::debug!(endpoint = %self.local_addr, "tcp server disposed");
    }
}
