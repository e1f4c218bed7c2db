//! Frame types carried on the wire.

use bytes::Bytes;

/// One-byte frame discriminant.
///
/// Values follow the WebSocket opcodes for the same concepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Binary = 0x01,
    Text = 0x02,
    Close = 0x08,
    Ping = 0x09,
    Pong = 0x0A,
}

impl FrameKind {
    // ---
    pub fn from_u8(value: u8) -> Option<Self> {
        // ---
        match value {
            0x01 => Some(FrameKind::Binary),
            0x02 => Some(FrameKind::Text),
            0x08 => Some(FrameKind::Close),
            0x09 => Some(FrameKind::Ping),
            0x0A => Some(FrameKind::Pong),
            _ => None,
        }
    }
}

/// A decoded frame.
///
/// # Wire Format
///
/// ```text
/// +--------+----------------+-----------------+
/// | kind:1 | length:4 (BE)  | payload:length  |
/// +--------+----------------+-----------------+
/// ```
///
/// Ping and pong payloads are an 8-byte big-endian nonce; close frames are
/// empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// One encoded chunk.
    Binary(Bytes),

    /// Control string, e.g. the end-of-stream marker.
    Text(String),

    /// RTT probe request.
    Ping(u64),

    /// RTT probe answer echoing the ping nonce.
    Pong(u64),

    /// Orderly shutdown notice.
    Close,
}

impl Frame {
    // ---
    /// Size of the fixed frame header in bytes.
    pub const HEADER_SIZE: usize = 5;

    pub fn kind(&self) -> FrameKind {
        // ---
        match self {
            Frame::Binary(_) => FrameKind::Binary,
            Frame::Text(_) => FrameKind::Text,
            Frame::Ping(_) => FrameKind::Ping,
            Frame::Pong(_) => FrameKind::Pong,
            Frame::Close => FrameKind::Close,
        }
    }

    pub fn text(s: impl Into<String>) -> Self {
        // ---
        Frame::Text(s.into())
    }

    /// Payload length as it will appear on the wire.
    pub fn payload_len(&self) -> usize {
        // ---
        match self {
            Frame::Binary(b) => b.len(),
            Frame::Text(s) => s.len(),
            Frame::Ping(_) | Frame::Pong(_) => 8,
            Frame::Close => 0,
        }
    }
}
