//! Tunnel Protocol Definitions
//!
//! This crate defines the frame format, control-message payloads, and forward
//! specifications for the multiplexed tunnel protocol.

pub mod forward;
pub mod frame;
pub mod messages;

pub use forward::{ForwardSpec, SpecParseError};
pub use frame::{ChannelId, Frame, FrameKind, ProtoError};
pub use messages::{ConnectPayload, TargetAddr};

/// Protocol version, sent as handshake metadata
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Reserved channel id for connection-global frames (heartbeats)
pub const CONTROL_CHANNEL_ID: u32 = 0;
