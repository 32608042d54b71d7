//! Routing table mapping channel ids to live virtual streams

use crate::stream::{StateCell, StreamEvent, StreamState};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};
use wstun_proto::{ChannelId, CONTROL_CHANNEL_ID};

/// Handle to a live virtual stream, owned by its routing table entry.
///
/// Frames routed to the stream become [`StreamEvent`]s on an unbounded
/// queue, so a slow local socket never stalls the dispatch loop for other
/// channels.
#[derive(Clone)]
pub struct StreamHandle {
    event_tx: mpsc::UnboundedSender<StreamEvent>,
    state: Arc<StateCell>,
    last_activity: Arc<Mutex<Instant>>,
}

impl StreamHandle {
    /// Create a handle plus the event receiver for the stream side.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let handle = Self {
            event_tx,
            state: Arc::new(StateCell::new()),
            last_activity: Arc::new(Mutex::new(Instant::now())),
        };
        (handle, event_rx)
    }

    /// Queue an event for the stream; false if the stream side is gone.
    pub fn deliver(&self, event: StreamEvent) -> bool {
        *self.last_activity.lock().unwrap() = Instant::now();
        self.event_tx.send(event).is_ok()
    }

    pub fn state(&self) -> StreamState {
        self.state.get()
    }

    pub fn state_cell(&self) -> Arc<StateCell> {
        self.state.clone()
    }

    /// Time since the last routed frame, for diagnostics.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }
}

/// Concurrent registry of the active virtual streams on one connection.
///
/// Scoped to a single `Wan` lifetime; replaced together with it on
/// reconnect.
pub struct RoutingTable {
    next_id: AtomicU32,
    streams: RwLock<HashMap<ChannelId, StreamHandle>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(CONTROL_CHANNEL_ID + 1),
            streams: RwLock::new(HashMap::new()),
        }
    }

    /// Allocate a channel id for a locally-initiated stream. The counter is
    /// monotonic for the connection lifetime and skips the reserved id 0.
    pub fn allocate(&self) -> ChannelId {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != CONTROL_CHANNEL_ID {
                return id;
            }
        }
    }

    /// Register a stream under `id`. Returns false and leaves the existing
    /// entry untouched if the id is already in use; registration is the
    /// collision check, so callers must register before any other work on
    /// the channel.
    pub async fn register(&self, id: ChannelId, handle: StreamHandle) -> bool {
        match self.streams.write().await.entry(id) {
            Entry::Occupied(_) => {
                warn!(channel_id = id, "channel id already in use");
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(handle);
                true
            }
        }
    }

    pub async fn lookup(&self, id: ChannelId) -> Option<StreamHandle> {
        self.streams.read().await.get(&id).cloned()
    }

    pub async fn remove(&self, id: ChannelId) {
        self.streams.write().await.remove(&id);
    }

    /// Force-close every stream and clear the table.
    pub async fn close_all(&self) {
        let mut streams = self.streams.write().await;
        for (id, handle) in streams.drain() {
            debug!(
                channel_id = id,
                state = ?handle.state(),
                idle = ?handle.idle_for(),
                "force-closing stream"
            );
            handle.deliver(StreamEvent::Close);
        }
    }

    pub async fn len(&self) -> usize {
        self.streams.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.streams.read().await.is_empty()
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}
