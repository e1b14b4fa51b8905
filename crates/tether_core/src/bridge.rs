//! Connection event bridge
//!
//! Transport threads report connection activity here; the interpreter's
//! owning thread later drains the queued events with [`EventBridge::dispatch`].
//! Each connection has its own lock, so busy connections never contend on a
//! shared one.

use crate::frame::{FrameDecoder, Payload, DEFAULT_MAX_FRAME_LEN};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Identifies a logical connection by its `ip:port` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self(endpoint.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<std::net::SocketAddr> for ConnectionId {
    fn from(addr: std::net::SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

impl From<&str> for ConnectionId {
    fn from(endpoint: &str) -> Self {
        Self(endpoint.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    Received(Payload),
}

#[derive(Debug)]
struct ConnectionState {
    decoder: FrameDecoder,
    queue: VecDeque<ConnectionEvent>,
    connected: bool,
}

type SharedState = Arc<Mutex<ConnectionState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, ConnectionState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Counters from one [`EventBridge::dispatch`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failures: usize,
}

#[derive(Debug)]
pub struct EventBridge {
    connections: DashMap<ConnectionId, SharedState>,
    max_frame_len: usize,
    dispatching: AtomicBool,
}

/// Clears the dispatching flag when a pass ends, even by unwinding.
struct DispatchPass<'a>(&'a AtomicBool);

impl Drop for DispatchPass<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl EventBridge {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            connections: DashMap::new(),
            max_frame_len,
            dispatching: AtomicBool::new(false),
        }
    }

    /// Record a new or re-established connection.
    ///
    /// A connect for an id that is already connected is ignored. A tracked id
    /// that was disconnected keeps its queue, so undelivered events survive
    /// the reconnect.
    pub fn on_connected(&self, id: &ConnectionId) {
        // The entry guard is held while the state is updated, so a dispatch
        // pass cannot retire this entry between lookup and connect.
        let entry = self.connections.entry(id.clone()).or_insert_with(|| {
            Arc::new(Mutex::new(ConnectionState {
                decoder: FrameDecoder::new(self.max_frame_len),
                queue: VecDeque::new(),
                connected: false,
            }))
        });

        let mut state = lock(entry.value());
        if state.connected {
            tracing::warn!(connection = %id, "duplicate connect ignored");
            return;
        }
        state.connected = true;
        state.queue.push_back(ConnectionEvent::Connected);
        tracing::debug!(connection = %id, "connected");
    }

    /// Record a disconnect. Any partial frame is discarded.
    pub fn on_disconnected(&self, id: &ConnectionId) {
        let Some(state) = self.state(id) else {
            tracing::warn!(connection = %id, "disconnect for unknown connection dropped");
            return;
        };

        let mut state = lock(&state);
        let discarded = state.decoder.buffered();
        state.decoder.clear();
        if !state.connected {
            tracing::debug!(connection = %id, "already disconnected");
            return;
        }
        state.connected = false;
        state.queue.push_back(ConnectionEvent::Disconnected);
        tracing::debug!(connection = %id, discarded, "disconnected");
    }

    /// Feed raw bytes from the transport. Safe from any thread.
    pub fn on_bytes_received(&self, id: &ConnectionId, bytes: &[u8]) {
        let Some(state) = self.state(id) else {
            tracing::warn!(connection = %id, len = bytes.len(), "bytes for unknown connection dropped");
            return;
        };

        let mut state = lock(&state);
        if !state.connected {
            tracing::warn!(connection = %id, len = bytes.len(), "bytes for disconnected connection dropped");
            return;
        }
        for payload in state.decoder.push(bytes) {
            tracing::debug!(connection = %id, tag = payload.kind().tag(), len = payload.as_bytes().len(), "frame received");
            state.queue.push_back(ConnectionEvent::Received(payload));
        }
    }

    pub fn is_connected(&self, id: &ConnectionId) -> bool {
        self.state(id).is_some_and(|state| lock(&state).connected)
    }

    /// Connections currently marked connected.
    pub fn connected_ids(&self) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|entry| lock(entry.value()).connected)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Total number of queued, undelivered events.
    pub fn pending_events(&self) -> usize {
        self.connections
            .iter()
            .map(|entry| lock(entry.value()).queue.len())
            .sum()
    }

    /// Number of endpoints with live state, connected or not.
    pub fn tracked_connections(&self) -> usize {
        self.connections.len()
    }

    /// Forget every connection and its queued events.
    pub fn clear(&self) {
        self.connections.clear();
    }

    /// Deliver queued events to `sink`, FIFO per connection.
    ///
    /// Must be called on the interpreter's owning thread. No lock is held
    /// while `sink` runs, so callbacks may send or trigger new events; those
    /// are picked up by the next pass. A failing callback is logged and
    /// delivery moves on to the next event.
    ///
    /// A `dispatch` started from inside `sink` delivers nothing, so callbacks
    /// of one bridge never nest. Endpoints that are disconnected with nothing
    /// left to deliver are forgotten at the end of their turn.
    pub fn dispatch<E, F>(&self, mut sink: F) -> DispatchReport
    where
        F: FnMut(&ConnectionId, ConnectionEvent) -> Result<(), E>,
        E: fmt::Display,
    {
        if self.dispatching.swap(true, Ordering::Acquire) {
            tracing::debug!("nested dispatch ignored");
            return DispatchReport::default();
        }
        let _pass = DispatchPass(&self.dispatching);

        let snapshot: Vec<(ConnectionId, SharedState)> = self
            .connections
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut report = DispatchReport::default();
        for (id, state) in snapshot {
            let budget = lock(&state).queue.len();
            for _ in 0..budget {
                let Some(event) = lock(&state).queue.pop_front() else {
                    break;
                };
                report.delivered += 1;
                if let Err(err) = sink(&id, event) {
                    report.failures += 1;
                    tracing::warn!(connection = %id, error = %err, "connection callback failed");
                }
            }
            self.retire_if_idle(&id);
        }
        report
    }

    fn retire_if_idle(&self, id: &ConnectionId) {
        let retired = self.connections.remove_if(id, |_, state| {
            let state = lock(state);
            !state.connected && state.queue.is_empty()
        });
        if retired.is_some() {
            tracing::debug!(connection = %id, "connection state retired");
        }
    }

    fn state(&self, id: &ConnectionId) -> Option<SharedState> {
        self.connections.get(id).map(|entry| Arc::clone(entry.value()))
    }
}

impl Default for EventBridge {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}
