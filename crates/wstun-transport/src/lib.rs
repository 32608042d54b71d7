//! Transport abstraction for the tunnel connection
//!
//! The tunnel core only sees an opaque message-framed duplex connection,
//! split into a write half and a read half. Concrete implementations live in
//! separate crates (WebSocket) and in `mem` (in-memory, tests only, behind
//! the `test-util` feature).

#[cfg(any(test, feature = "test-util"))]
pub mod mem;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Other(String),
}

/// Write half of the duplex connection. The connection forbids concurrent
/// writers, so exactly one task may own this at a time.
#[async_trait]
pub trait TransportSink: Send + std::fmt::Debug {
    /// Send one message; the transport preserves message boundaries.
    async fn send(&mut self, data: Bytes) -> Result<(), TransportError>;

    /// Close the connection.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Read half of the duplex connection.
#[async_trait]
pub trait TransportSource: Send + std::fmt::Debug {
    /// Receive the next message; `None` once the peer has closed.
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError>;
}

pub type BoxSink = Box<dyn TransportSink>;
pub type BoxSource = Box<dyn TransportSource>;

/// Outcome of a failed connect attempt
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The peer rejected the credential; retrying cannot help.
    #[error("authentication rejected (status {status})")]
    AuthRejected { status: u16 },

    #[error("connect failed: {0}")]
    Transient(String),
}

impl ConnectError {
    /// Returns true if this error is non-recoverable and retrying won't help
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConnectError::AuthRejected { .. })
    }
}

/// Establishes the persistent duplex connection. The handshake carries the
/// auth credential and the protocol-version marker as request metadata.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, server: &str, auth: &str)
        -> Result<(BoxSink, BoxSource), ConnectError>;
}
