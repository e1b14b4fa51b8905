//! Tether Network Layer
//!
//! TCP client and server transports. Socket I/O runs on tokio; everything a
//! transport observes is reported to its [`EventBridge`](tether_core::EventBridge)
//! for delivery on the interpreter's thread.

pub mod client;
mod link;
pub mod server;

pub use client::TcpClient;
pub use server::TcpServer;

use std::net::SocketAddr;
use tether_core::FrameError;
use thiserror::Error;

/// Transport start-up options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// `ip:port` to connect to or listen on.
    pub endpoint: String,
    /// Read buffer size per connection.
    pub buffer_size: usize,
    pub no_delay: bool,
    pub max_frame_len: usize,
}

impl TransportConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            buffer_size: 64 * 1024,
            no_delay: false,
            max_frame_len: tether_core::frame::DEFAULT_MAX_FRAME_LEN,
        }
    }

    fn socket_addr(&self) -> Result<SocketAddr, TransportError> {
        self.endpoint
            .parse()
            .map_err(|_| TransportError::InvalidEndpoint(self.endpoint.clone()))
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid endpoint '{0}', expected ip:port")]
    InvalidEndpoint(String),

    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to listen on {endpoint}: {source}")]
    Bind {
        endpoint: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Frame(#[from] FrameError),
}
