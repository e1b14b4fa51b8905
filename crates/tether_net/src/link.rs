//! One established TCP connection
//!
//! A link registers its writer and reports `Connected` synchronously, so a
//! send issued right after start-up already finds it. The returned future
//! then pumps reads into the bridge and queued frames onto the socket until
//! either side closes.

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tether_core::frame::encode_frame;
use tether_core::{ConnectionId, EventBridge};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::TransportError;

/// Writers for every live connection of one transport.
pub(crate) type Peers = Arc<DashMap<ConnectionId, UnboundedSender<Vec<u8>>>>;

pub(crate) fn open(
    stream: TcpStream,
    id: ConnectionId,
    bridge: &Arc<EventBridge>,
    peers: &Peers,
    buffer_size: usize,
    no_delay: bool,
) -> impl Future<Output = ()> + Send + 'static {
    if let Err(err) = stream.set_nodelay(no_delay) {
        tracing::warn!(connection = %id, %err, "failed to set TCP_NODELAY");
    }

    let (tx, rx) = mpsc::unbounded_channel();
    peers.insert(id.clone(), tx);
    bridge.on_connected(&id);

    run(
        stream,
        id,
        Arc::clone(bridge),
        Arc::clone(peers),
        rx,
        buffer_size.max(1),
    )
}

async fn run(
    stream: TcpStream,
    id: ConnectionId,
    bridge: Arc<EventBridge>,
    peers: Peers,
    mut outgoing: UnboundedReceiver<Vec<u8>>,
    buffer_size: usize,
) {
    let (mut reader, mut writer) = stream.into_split();

    let read = async {
        let mut buf = vec![0u8; buffer_size];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => bridge.on_bytes_received(&id, &buf[..n]),
                Err(err) => {
                    tracing::debug!(connection = %id, %err, "read failed");
                    break;
                }
            }
        }
    };

    let write = async {
        while let Some(frame) = outgoing.recv().await {
            if let Err(err) = writer.write_all(&frame).await {
                tracing::error!(connection = %id, %err, "write failed");
                break;
            }
        }
    };

    tokio::select! {
        _ = read => {}
        _ = write => {}
    }

    peers.remove(&id);
    bridge.on_disconnected(&id);
}

/// Frame `payload` and queue it on the connection's writer.
///
/// Returns `Ok(false)` when the connection is not established.
pub(crate) fn send(peers: &Peers, id: &ConnectionId, tag: u8, payload: &[u8]) -> Result<bool, TransportError> {
    let Some(writer) = peers.get(id).map(|entry| entry.value().clone()) else {
        tracing::debug!(connection = %id, "send on closed connection ignored");
        return Ok(false);
    };
    let frame = encode_frame(tag, payload)?;
    let len = frame.len();
    if writer.send(frame).is_err() {
        return Ok(false);
    }
    tracing::debug!(connection = %id, tag, len, "frame queued");
    Ok(true)
}
