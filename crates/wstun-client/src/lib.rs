//! Multiplexed reverse-tunnel client engine
//!
//! One persistent connection to the tunnel server carries many independent
//! virtual TCP streams, each identified by a channel id. The engine is
//! split along the protocol's seams: the [`routing`] table maps channel
//! ids to live streams, [`stream`] runs each stream's lifecycle and byte
//! bridging, [`wan`] owns the transport (serialized writes, inbound
//! dispatch, heartbeat), [`forward`] turns configured forward specs into
//! listeners and streams, and [`session`] supervises connect/reconnect.

pub mod config;
pub mod error;
pub mod forward;
pub mod routing;
pub mod session;
pub mod stream;
pub mod wan;

#[cfg(test)]
mod tests;

pub use config::ClientConfig;
pub use error::TunnelError;
pub use forward::{ForwardingManager, SessionHandle};
pub use routing::{RoutingTable, StreamHandle};
pub use session::{ShutdownHandle, TunnelClient, RECONNECT_DELAY};
pub use stream::{StreamEvent, StreamState, VirtualStream, DRAIN_TIMEOUT};
pub use wan::{Wan, WanHandle, HEARTBEAT_INTERVAL};
