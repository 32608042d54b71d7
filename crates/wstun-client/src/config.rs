//! Client configuration

use crate::error::TunnelError;
use serde::{Deserialize, Serialize};
use wstun_proto::ForwardSpec;

/// Tunnel client configuration, parsed once at startup and immutable
/// thereafter. Loadable from a JSON document of the same shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Auth credential sent with the connection handshake
    #[serde(default)]
    pub auth: String,

    /// Tunnel server URL
    pub server: String,

    /// Local forward specs, `listen:host:port`
    #[serde(default)]
    pub local: Vec<String>,

    /// Remote forward specs, `listen:host:port` with `listen` on the peer
    #[serde(default)]
    pub remote: Vec<String>,

    /// Dynamic (SOCKS5) forward listen addresses
    #[serde(default)]
    pub dynamic: Vec<String>,
}

impl ClientConfig {
    /// Parse every configured forward spec string.
    pub fn forward_specs(&self) -> Result<Vec<ForwardSpec>, TunnelError> {
        let mut specs = Vec::new();
        for spec in &self.local {
            specs.push(ForwardSpec::parse_local(spec).map_err(|e| TunnelError::Config(e.to_string()))?);
        }
        for spec in &self.remote {
            specs.push(ForwardSpec::parse_remote(spec).map_err(|e| TunnelError::Config(e.to_string()))?);
        }
        for spec in &self.dynamic {
            specs.push(ForwardSpec::parse_dynamic(spec).map_err(|e| TunnelError::Config(e.to_string()))?);
        }
        Ok(specs)
    }
}
