//! Virtual stream lifecycle and byte bridging
//!
//! One virtual stream is one forwarded TCP conversation bound to a channel
//! id. Two tasks bridge it once established: one reads the local socket and
//! emits Data frames, the other applies routed events to the socket. They
//! coordinate only through the shared state cell and the serialized writer;
//! closing either side closes the local socket, which unblocks the other.

use crate::error::TunnelError;
use crate::routing::{RoutingTable, StreamHandle};
use crate::wan::WanHandle;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;
use tracing::{debug, warn};
use wstun_proto::{ChannelId, ConnectPayload, Frame, TargetAddr};

/// How long a closing stream keeps draining inbound data while waiting for
/// the peer's close.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const READ_BUFFER_SIZE: usize = 8192;

/// Lifecycle of a virtual stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Channel id allocated, local or remote dial in flight
    Pending,
    /// Bytes flow both directions
    Established,
    /// We signaled end-of-stream; inbound data still drains
    Closing,
    /// Terminal; the routing entry is removed
    Closed,
}

/// Frame routed to a stream by the dispatch loop.
#[derive(Debug)]
pub enum StreamEvent {
    Connected,
    Data(Bytes),
    Close,
}

/// Lifecycle state shared between the routing entry and the bridging tasks.
pub struct StateCell(Mutex<StreamState>);

impl StateCell {
    pub fn new() -> Self {
        Self(Mutex::new(StreamState::Pending))
    }

    pub fn get(&self) -> StreamState {
        *self.0.lock().unwrap()
    }

    pub fn set(&self, state: StreamState) {
        *self.0.lock().unwrap() = state;
    }

    /// `Established` -> `Closing`; false in any other state.
    pub fn begin_closing(&self) -> bool {
        let mut state = self.0.lock().unwrap();
        if *state == StreamState::Established {
            *state = StreamState::Closing;
            true
        } else {
            false
        }
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// One logical forwarded TCP conversation bound to a channel id.
pub struct VirtualStream {
    channel_id: ChannelId,
    state: Arc<StateCell>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    wan: WanHandle,
    routing: Arc<RoutingTable>,
}

impl VirtualStream {
    /// Open a locally-initiated stream: allocate an id, register the
    /// pending entry, send the Connect frame.
    pub async fn open(
        routing: &Arc<RoutingTable>,
        wan: &WanHandle,
        target: TargetAddr,
    ) -> Result<Self, TunnelError> {
        let channel_id = routing.allocate();
        let (handle, events) = StreamHandle::channel();
        let state = handle.state_cell();
        if !routing.register(channel_id, handle).await {
            return Err(TunnelError::Protocol(format!(
                "channel {} already in use",
                channel_id
            )));
        }

        let payload = ConnectPayload::Target(target).encode()?;
        if let Err(err) = wan.send(Frame::connect(channel_id, payload)).await {
            routing.remove(channel_id).await;
            return Err(err);
        }

        debug!(channel_id, "stream pending");
        Ok(Self {
            channel_id,
            state,
            events,
            wan: wan.clone(),
            routing: routing.clone(),
        })
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    /// Wait for the peer's verdict on a pending stream. Returns true once
    /// established; on refusal the routing entry is already removed.
    pub async fn establish(&mut self) -> bool {
        match self.events.recv().await {
            Some(StreamEvent::Connected) => {
                self.state.set(StreamState::Established);
                debug!(channel_id = self.channel_id, "stream established");
                true
            }
            Some(StreamEvent::Close) => {
                debug!(channel_id = self.channel_id, "peer refused stream");
                self.abandon().await;
                false
            }
            Some(StreamEvent::Data(_)) => {
                warn!(
                    channel_id = self.channel_id,
                    "data before connected; closing stream"
                );
                let _ = self.wan.send(Frame::close(self.channel_id)).await;
                self.abandon().await;
                false
            }
            None => {
                self.abandon().await;
                false
            }
        }
    }

    /// Tell the peer the stream is dead and drop the routing entry.
    pub async fn close(mut self) {
        let _ = self.wan.send(Frame::close(self.channel_id)).await;
        self.abandon().await;
    }

    async fn abandon(&mut self) {
        self.state.set(StreamState::Closed);
        self.routing.remove(self.channel_id).await;
    }

    /// Bridge an established stream with its local socket until either side
    /// closes.
    pub async fn bridge(mut self, socket: TcpStream) {
        let (mut read_half, mut write_half) = socket.into_split();
        let closed = Arc::new(Notify::new());
        let local_eof = Arc::new(Notify::new());

        // Local socket -> Data frames, in read order.
        let outbound = {
            let wan = self.wan.clone();
            let state = self.state.clone();
            let closed = closed.clone();
            let local_eof = local_eof.clone();
            let channel_id = self.channel_id;
            tokio::spawn(async move {
                let mut buf = vec![0u8; READ_BUFFER_SIZE];
                loop {
                    tokio::select! {
                        _ = closed.notified() => break,
                        read = read_half.read(&mut buf) => match read {
                            Ok(0) => {
                                debug!(channel_id, "local socket eof; draining peer");
                                if state.begin_closing() {
                                    let _ = wan.send(Frame::close(channel_id)).await;
                                }
                                local_eof.notify_one();
                                break;
                            }
                            Ok(n) => {
                                let data = Bytes::copy_from_slice(&buf[..n]);
                                if wan.send(Frame::data(channel_id, data)).await.is_err() {
                                    // Connection-level failure; teardown is under way
                                    break;
                                }
                            }
                            Err(err) => {
                                debug!(channel_id, "local read error: {}", err);
                                if state.begin_closing() {
                                    let _ = wan.send(Frame::close(channel_id)).await;
                                }
                                local_eof.notify_one();
                                break;
                            }
                        }
                    }
                }
            })
        };

        // Routed events -> local socket, in arrival order. Once the local
        // side has closed, only drain until the peer's close or the
        // timeout.
        loop {
            let event = if self.state.get() == StreamState::Closing {
                match timeout(DRAIN_TIMEOUT, self.events.recv()).await {
                    Ok(event) => event,
                    Err(_) => {
                        debug!(channel_id = self.channel_id, "drain timeout elapsed");
                        break;
                    }
                }
            } else {
                tokio::select! {
                    event = self.events.recv() => event,
                    // Re-evaluate the state: the local side just closed
                    _ = local_eof.notified() => continue,
                }
            };

            match event {
                Some(StreamEvent::Data(data)) => {
                    if let Err(err) = write_half.write_all(&data).await {
                        debug!(channel_id = self.channel_id, "local write error: {}", err);
                        if self.state.begin_closing() {
                            let _ = self.wan.send(Frame::close(self.channel_id)).await;
                        }
                        break;
                    }
                }
                Some(StreamEvent::Close) => {
                    debug!(channel_id = self.channel_id, "peer closed stream");
                    break;
                }
                // A duplicate Connected carries no meaning once established
                Some(StreamEvent::Connected) => {}
                None => break,
            }
        }

        self.state.set(StreamState::Closed);
        closed.notify_one();
        drop(write_half);
        let _ = outbound.await;
        self.routing.remove(self.channel_id).await;
        debug!(channel_id = self.channel_id, "stream closed");
    }
}

/// Handle a peer-initiated Connect: dial the local target, answer
/// Connected or Close, then bridge. The dispatch loop registered the
/// pending entry before spawning this, so a duplicate channel id is
/// refused atomically; a failed dial removes the entry and leaves no
/// stream behind.
pub(crate) async fn accept_peer_stream(
    channel_id: ChannelId,
    target: TargetAddr,
    wan: WanHandle,
    routing: Arc<RoutingTable>,
    state: Arc<StateCell>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
) {
    debug!(channel_id, %target, "peer-initiated stream; dialing local target");
    let socket = match TcpStream::connect((target.host.as_str(), target.port)).await {
        Ok(socket) => socket,
        Err(err) => {
            warn!(channel_id, %target, "local dial failed: {}", err);
            state.set(StreamState::Closed);
            routing.remove(channel_id).await;
            let _ = wan
                .send(Frame::close_with_reason(channel_id, &err.to_string()))
                .await;
            return;
        }
    };

    if wan.send(Frame::connected(channel_id)).await.is_err() {
        state.set(StreamState::Closed);
        routing.remove(channel_id).await;
        return;
    }
    state.set(StreamState::Established);
    debug!(channel_id, %target, "stream established");

    let stream = VirtualStream {
        channel_id,
        state,
        events,
        wan,
        routing,
    };
    stream.bridge(socket).await;
}
