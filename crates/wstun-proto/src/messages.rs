//! Control-message payloads carried in Connect frames

use crate::ProtoError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A dialable endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetAddr {
    pub host: String,
    pub port: u16,
}

impl TargetAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Payload of a Connect frame
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectPayload {
    /// Dial this endpoint. Sent for local and dynamic forwards, and by the
    /// peer for streams belonging to a remote-forward registration (the peer
    /// echoes the registered local target).
    Target(TargetAddr),
    /// Remote-forward registration: ask the peer to listen on `listen` and
    /// route every accepted connection back to `target` on our side.
    Register { listen: String, target: TargetAddr },
}

impl ConnectPayload {
    pub fn encode(&self) -> Result<Bytes, ProtoError> {
        bincode::serialize(self)
            .map(Bytes::from)
            .map_err(|e| ProtoError::BadConnectPayload(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtoError> {
        bincode::deserialize(bytes).map_err(|e| ProtoError::BadConnectPayload(e.to_string()))
    }
}
