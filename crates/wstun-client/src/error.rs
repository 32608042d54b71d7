//! Tunnel client errors

use thiserror::Error;
use wstun_transport::ConnectError;

/// Tunnel client errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("authentication rejected (status {status})")]
    AuthRejected { status: u16 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    /// Returns true if this error is non-recoverable and retrying won't help
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TunnelError::AuthRejected { .. } | TunnelError::Config(_)
        )
    }
}

impl From<ConnectError> for TunnelError {
    fn from(err: ConnectError) -> Self {
        match err {
            ConnectError::AuthRejected { status } => TunnelError::AuthRejected { status },
            ConnectError::Transient(msg) => TunnelError::Connection(msg),
        }
    }
}

impl From<wstun_proto::ProtoError> for TunnelError {
    fn from(err: wstun_proto::ProtoError) -> Self {
        TunnelError::Protocol(err.to_string())
    }
}
