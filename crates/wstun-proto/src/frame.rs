//! Frame format for the multiplexed tunnel protocol

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Channel identifier
pub type ChannelId = u32;

/// Frame kinds carried over the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Introduces a new channel; payload is a serialized [`crate::ConnectPayload`]
    Connect = 0,
    /// Positive answer to a Connect on the same channel
    Connected = 1,
    /// Raw application bytes for an established channel
    Data = 2,
    /// End of a channel; payload may carry an error reason
    Close = 3,
    /// Connection-global liveness signal on channel 0, no payload
    Heartbeat = 4,
}

impl TryFrom<u8> for FrameKind {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameKind::Connect),
            1 => Ok(FrameKind::Connected),
            2 => Ok(FrameKind::Data),
            3 => Ok(FrameKind::Close),
            4 => Ok(FrameKind::Heartbeat),
            other => Err(ProtoError::UnknownKind(other)),
        }
    }
}

/// One message unit on the transport
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: FrameKind,
    pub channel_id: ChannelId,
    pub payload: Bytes,
}

impl Frame {
    /// Frame header size: channel_id (4) + kind (1) + length (4) = 9 bytes
    pub const HEADER_SIZE: usize = 9;

    pub fn new(kind: FrameKind, channel_id: ChannelId, payload: Bytes) -> Self {
        Self {
            kind,
            channel_id,
            payload,
        }
    }

    pub fn connect(channel_id: ChannelId, payload: Bytes) -> Self {
        Self::new(FrameKind::Connect, channel_id, payload)
    }

    pub fn connected(channel_id: ChannelId) -> Self {
        Self::new(FrameKind::Connected, channel_id, Bytes::new())
    }

    pub fn data(channel_id: ChannelId, payload: Bytes) -> Self {
        Self::new(FrameKind::Data, channel_id, payload)
    }

    pub fn close(channel_id: ChannelId) -> Self {
        Self::new(FrameKind::Close, channel_id, Bytes::new())
    }

    pub fn close_with_reason(channel_id: ChannelId, reason: &str) -> Self {
        Self::new(
            FrameKind::Close,
            channel_id,
            Bytes::copy_from_slice(reason.as_bytes()),
        )
    }

    pub fn heartbeat() -> Self {
        Self::new(FrameKind::Heartbeat, crate::CONTROL_CHANNEL_ID, Bytes::new())
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<Bytes, ProtoError> {
        let payload_len = self.payload.len();
        if payload_len > crate::MAX_FRAME_SIZE as usize {
            return Err(ProtoError::FrameTooLarge(payload_len));
        }

        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + payload_len);

        buf.put_u32(self.channel_id);
        buf.put_u8(self.kind as u8);
        buf.put_u32(payload_len as u32);
        buf.put(self.payload.clone());

        Ok(buf.freeze())
    }

    /// Decode frame from bytes
    pub fn decode(mut buf: Bytes) -> Result<Self, ProtoError> {
        if buf.len() < Self::HEADER_SIZE {
            return Err(ProtoError::Truncated);
        }

        let channel_id = buf.get_u32();
        let kind = FrameKind::try_from(buf.get_u8())?;
        let length = buf.get_u32();

        if length > crate::MAX_FRAME_SIZE {
            return Err(ProtoError::FrameTooLarge(length as usize));
        }

        if buf.remaining() < length as usize {
            return Err(ProtoError::Truncated);
        }

        let payload = buf.split_to(length as usize);

        Ok(Self {
            kind,
            channel_id,
            payload,
        })
    }
}

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("unknown frame kind: {0}")]
    UnknownKind(u8),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("truncated frame")]
    Truncated,

    #[error("malformed connect payload: {0}")]
    BadConnectPayload(String),
}
