//! Connection owner: write serialization, inbound dispatch, heartbeat
//!
//! A `Wan` owns one live transport. Every outbound frame funnels through a
//! single writer task fed by a bounded queue, one dispatch loop routes
//! inbound frames to virtual streams, and a heartbeat task signals
//! liveness independent of data traffic. Any read or write failure tears
//! the whole connection down exactly once.

use crate::error::TunnelError;
use crate::routing::{RoutingTable, StreamHandle};
use crate::stream::{self, StreamEvent};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, trace, warn};
use wstun_proto::{ConnectPayload, Frame, FrameKind};
use wstun_transport::{BoxSink, BoxSource};

/// Heartbeat cadence on an established connection.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Outbound frame queue depth shared by all producers.
const FRAME_QUEUE_DEPTH: usize = 256;

/// Sending side of the serialized writer. Clone freely; every holder's
/// frames pass through the same writer task, so frame boundaries are never
/// interleaved.
#[derive(Clone)]
pub struct WanHandle {
    frame_tx: mpsc::Sender<Frame>,
}

impl WanHandle {
    pub async fn send(&self, frame: Frame) -> Result<(), TunnelError> {
        self.frame_tx
            .send(frame)
            .await
            .map_err(|_| TunnelError::Connection("connection writer is gone".to_string()))
    }
}

struct WanInner {
    routing: Arc<RoutingTable>,
    failed: AtomicBool,
    failure_tx: watch::Sender<bool>,
}

impl WanInner {
    /// Idempotent failure path: the first caller force-closes every stream
    /// and signals the supervisor; later callers are no-ops.
    async fn fail(&self, reason: &str) {
        if self.failed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("tearing down connection: {}", reason);
        self.routing.close_all().await;
        let _ = self.failure_tx.send(true);
    }
}

/// Owner of one live transport connection. Replaced wholesale on
/// reconnect, never reused.
pub struct Wan {
    frame_tx: mpsc::Sender<Frame>,
    inner: Arc<WanInner>,
}

impl Wan {
    /// Take ownership of a freshly connected transport and start the
    /// writer, dispatch and heartbeat tasks.
    pub fn spawn(
        sink: BoxSink,
        source: BoxSource,
        routing: Arc<RoutingTable>,
        heartbeat_interval: Duration,
    ) -> Self {
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
        let (failure_tx, _) = watch::channel(false);
        let inner = Arc::new(WanInner {
            routing,
            failed: AtomicBool::new(false),
            failure_tx,
        });

        tokio::spawn(writer_task(
            sink,
            frame_rx,
            inner.clone(),
            inner.failure_tx.subscribe(),
        ));
        tokio::spawn(dispatch_task(
            source,
            frame_tx.clone(),
            inner.clone(),
            inner.failure_tx.subscribe(),
        ));
        tokio::spawn(heartbeat_task(
            frame_tx.clone(),
            heartbeat_interval,
            inner.failure_tx.subscribe(),
        ));

        Self { frame_tx, inner }
    }

    pub fn handle(&self) -> WanHandle {
        WanHandle {
            frame_tx: self.frame_tx.clone(),
        }
    }

    /// Watch that flips to true exactly once when the connection dies.
    pub fn failure_watch(&self) -> watch::Receiver<bool> {
        self.inner.failure_tx.subscribe()
    }

    pub fn is_failed(&self) -> bool {
        self.inner.failed.load(Ordering::SeqCst)
    }

    /// Explicit teardown, same path as a transport failure.
    pub async fn shutdown(&self) {
        self.inner.fail("shutdown requested").await;
    }
}

/// The only place transport writes happen, heartbeats included.
async fn writer_task(
    mut sink: BoxSink,
    mut frame_rx: mpsc::Receiver<Frame>,
    inner: Arc<WanInner>,
    mut failure_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = failure_rx.changed() => break,
            frame = frame_rx.recv() => match frame {
                Some(frame) => {
                    let encoded = match frame.encode() {
                        Ok(encoded) => encoded,
                        Err(err) => {
                            warn!("dropping unencodable frame: {}", err);
                            continue;
                        }
                    };
                    if let Err(err) = sink.send(encoded).await {
                        error!("transport write error: {}", err);
                        inner.fail("write error").await;
                        break;
                    }
                }
                None => break,
            }
        }
    }
    let _ = sink.close().await;
    trace!("writer task ended");
}

async fn dispatch_task(
    mut source: BoxSource,
    frame_tx: mpsc::Sender<Frame>,
    inner: Arc<WanInner>,
    mut failure_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = failure_rx.changed() => break,
            next = source.recv() => match next {
                Ok(Some(data)) => dispatch_frame(&inner, &frame_tx, data).await,
                Ok(None) => {
                    inner.fail("transport closed by peer").await;
                    break;
                }
                Err(err) => {
                    error!("transport read error: {}", err);
                    inner.fail("read error").await;
                    break;
                }
            }
        }
    }
    trace!("dispatch loop ended");
}

async fn dispatch_frame(inner: &Arc<WanInner>, frame_tx: &mpsc::Sender<Frame>, data: Bytes) {
    let frame = match Frame::decode(data) {
        Ok(frame) => frame,
        Err(err) => {
            // Unknown kinds and malformed frames are dropped; the protocol
            // must tolerate future extension.
            warn!("dropping undecodable frame: {}", err);
            return;
        }
    };

    match frame.kind {
        FrameKind::Heartbeat => trace!("heartbeat received"),
        FrameKind::Connect => handle_connect(inner, frame_tx, frame).await,
        FrameKind::Connected | FrameKind::Data | FrameKind::Close => {
            let channel_id = frame.channel_id;
            let kind = frame.kind;
            let event = match kind {
                FrameKind::Connected => StreamEvent::Connected,
                FrameKind::Data => StreamEvent::Data(frame.payload),
                _ => StreamEvent::Close,
            };
            match inner.routing.lookup(channel_id).await {
                Some(handle) => {
                    if !handle.deliver(event) {
                        debug!(channel_id, "stream receiver gone; frame dropped");
                    }
                }
                // Normal race between a close and in-flight frames
                None => debug!(channel_id, ?kind, "frame for unknown channel dropped"),
            }
        }
    }
}

async fn handle_connect(inner: &Arc<WanInner>, frame_tx: &mpsc::Sender<Frame>, frame: Frame) {
    match ConnectPayload::decode(&frame.payload) {
        Ok(ConnectPayload::Target(target)) => {
            // Register the pending entry before the dial task starts, so a
            // duplicate channel id is refused here and never dialed
            let (handle, events) = StreamHandle::channel();
            let state = handle.state_cell();
            if !inner.routing.register(frame.channel_id, handle).await {
                warn!(
                    channel_id = frame.channel_id,
                    "connect for a channel already in use; dropped"
                );
                return;
            }
            let wan = WanHandle {
                frame_tx: frame_tx.clone(),
            };
            tokio::spawn(stream::accept_peer_stream(
                frame.channel_id,
                target,
                wan,
                inner.routing.clone(),
                state,
                events,
            ));
        }
        Ok(ConnectPayload::Register { .. }) => {
            warn!(
                channel_id = frame.channel_id,
                "peer sent a registration request; refusing"
            );
            let _ = frame_tx.send(Frame::close(frame.channel_id)).await;
        }
        Err(err) => {
            warn!(
                channel_id = frame.channel_id,
                "malformed connect payload: {}", err
            );
            let _ = frame_tx.send(Frame::close(frame.channel_id)).await;
        }
    }
}

async fn heartbeat_task(
    frame_tx: mpsc::Sender<Frame>,
    period: Duration,
    mut failure_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // interval fires immediately; the first beat belongs one period out
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = failure_rx.changed() => break,
            _ = ticker.tick() => {
                trace!("sending heartbeat");
                if frame_tx.send(Frame::heartbeat()).await.is_err() {
                    break;
                }
            }
        }
    }
    trace!("heartbeat task ended");
}
