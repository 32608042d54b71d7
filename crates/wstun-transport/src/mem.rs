//! In-memory transport used by tests
//!
//! [`pair`] yields two connected endpoints; dropping either half of one
//! endpoint is observed by the other as a closed connection. [`MemConnector`]
//! scripts connect outcomes so supervisor behavior (retries, fatal auth) can
//! be exercised without a network.

use crate::{BoxSink, BoxSource, ConnectError, Connector, TransportError, TransportSink, TransportSource};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug)]
pub struct MemSink {
    tx: Option<mpsc::Sender<Bytes>>,
}

#[async_trait]
impl TransportSink for MemSink {
    async fn send(&mut self, data: Bytes) -> Result<(), TransportError> {
        match &self.tx {
            Some(tx) => tx.send(data).await.map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}

#[derive(Debug)]
pub struct MemSource {
    rx: mpsc::Receiver<Bytes>,
}

#[async_trait]
impl TransportSource for MemSource {
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

/// Create a connected pair of duplex endpoints: (near, far).
pub fn pair() -> ((BoxSink, BoxSource), (BoxSink, BoxSource)) {
    let (near_tx, far_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (far_tx, near_rx) = mpsc::channel(CHANNEL_CAPACITY);

    let near: (BoxSink, BoxSource) = (
        Box::new(MemSink { tx: Some(near_tx) }),
        Box::new(MemSource { rx: near_rx }),
    );
    let far: (BoxSink, BoxSource) = (
        Box::new(MemSink { tx: Some(far_tx) }),
        Box::new(MemSource { rx: far_rx }),
    );

    (near, far)
}

/// Scripted connector: queued failures are returned first, then every attempt
/// succeeds with a fresh [`pair`] whose far end is handed to the test.
pub struct MemConnector {
    failures: Mutex<VecDeque<ConnectError>>,
    attempts: AtomicUsize,
    peer_tx: mpsc::UnboundedSender<(BoxSink, BoxSource)>,
}

impl MemConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(BoxSink, BoxSource)>) {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            failures: Mutex::new(VecDeque::new()),
            attempts: AtomicUsize::new(0),
            peer_tx,
        });
        (connector, peer_rx)
    }

    /// Queue a failure for the next connect attempt.
    pub fn push_failure(&self, err: ConnectError) {
        self.failures.lock().unwrap().push_back(err);
    }

    /// Number of connect attempts made so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemConnector {
    async fn connect(
        &self,
        _server: &str,
        _auth: &str,
    ) -> Result<(BoxSink, BoxSource), ConnectError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }

        let (near, far) = pair();
        self.peer_tx
            .send(far)
            .map_err(|_| ConnectError::Transient("peer receiver dropped".to_string()))?;
        Ok(near)
    }
}
