//! Codec for encoding and decoding frames on a byte stream.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::frame::{Frame, FrameKind};

/// Largest payload a peer may declare. Chunks are a few KiB in practice.
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// Error type for codec operations
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Unknown frame kind byte
    #[error("invalid frame kind: {0:#04x}")]
    InvalidKind(u8),

    /// Declared payload exceeds [`MAX_PAYLOAD_LEN`]
    #[error("frame payload too large: {0} bytes")]
    TooLarge(usize),

    /// Payload does not match what the frame kind requires
    #[error("invalid frame payload: {0}")]
    InvalidPayload(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Length-prefixed frame codec, used through `tokio_util::codec::Framed`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    // ---
    pub fn new() -> Self {
        // ---
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        // ---
        if src.len() < Frame::HEADER_SIZE {
            return Ok(None);
        }

        // Peek the header without consuming it until the payload is complete
        let kind_byte = src[0];
        let kind = FrameKind::from_u8(kind_byte).ok_or(CodecError::InvalidKind(kind_byte))?;
        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if len > MAX_PAYLOAD_LEN {
            return Err(CodecError::TooLarge(len));
        }

        if src.len() < Frame::HEADER_SIZE + len {
            src.reserve(Frame::HEADER_SIZE + len - src.len());
            return Ok(None);
        }

        src.advance(Frame::HEADER_SIZE);
        let payload = src.split_to(len).freeze();

        let frame = match kind {
            FrameKind::Binary => Frame::Binary(payload),
            FrameKind::Text => {
                let text = String::from_utf8(payload.to_vec())
                    .map_err(|e| CodecError::InvalidPayload(format!("text frame: {e}")))?;
                Frame::Text(text)
            }
            FrameKind::Ping | FrameKind::Pong => {
                let nonce = read_nonce(&payload)?;
                if kind == FrameKind::Ping {
                    Frame::Ping(nonce)
                } else {
                    Frame::Pong(nonce)
                }
            }
            FrameKind::Close => Frame::Close,
        };

        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        // ---
        let len = frame.payload_len();
        if len > MAX_PAYLOAD_LEN {
            return Err(CodecError::TooLarge(len));
        }

        dst.reserve(Frame::HEADER_SIZE + len);
        dst.put_u8(frame.kind() as u8);
        dst.put_u32(len as u32);

        match frame {
            Frame::Binary(payload) => dst.extend_from_slice(&payload),
            Frame::Text(text) => dst.extend_from_slice(text.as_bytes()),
            Frame::Ping(nonce) | Frame::Pong(nonce) => dst.put_u64(nonce),
            Frame::Close => {}
        }

        Ok(())
    }
}

fn read_nonce(payload: &[u8]) -> Result<u64, CodecError> {
    // ---
    let bytes: [u8; 8] = payload.try_into().map_err(|_| {
        CodecError::InvalidPayload(format!("probe nonce must be 8 bytes, got {}", payload.len()))
    })?;
    Ok(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use bytes::Bytes;

    fn encode(frame: Frame) -> BytesMut {
        // ---
        let mut buf = BytesMut::new();
        FrameCodec.encode(frame, &mut buf).expect("encode failed");
        buf
    }

    #[test]
    fn binary_header_layout() {
        // ---
        let buf = encode(Frame::Binary(Bytes::from_static(&[7, 8, 9])));
        assert_eq!(&buf[..], &[0x01, 0, 0, 0, 3, 7, 8, 9]);
    }

    #[test]
    fn decodes_back_to_back_frames() {
        // ---
        let mut buf = encode(Frame::Binary(Bytes::from_static(b"abc")));
        buf.extend_from_slice(&encode(Frame::Ping(42)));
        buf.extend_from_slice(&encode(Frame::text("done")));

        let mut codec = FrameCodec::new();
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::Binary(Bytes::from_static(b"abc")))
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::Ping(42)));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::text("done")));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn waits_for_partial_payload() {
        // ---
        let full = encode(Frame::Binary(Bytes::from(vec![1u8; 100])));
        let mut partial = BytesMut::from(&full[..50]);

        let mut codec = FrameCodec::new();
        assert_eq!(codec.decode(&mut partial).unwrap(), None);

        partial.extend_from_slice(&full[50..]);
        let frame = codec.decode(&mut partial).unwrap().expect("frame complete");
        assert_eq!(frame.payload_len(), 100);
    }

    #[test]
    fn rejects_unknown_kind() {
        // ---
        let mut buf = BytesMut::from(&[0x7f, 0, 0, 0, 0][..]);
        assert!(matches!(
            FrameCodec.decode(&mut buf),
            Err(CodecError::InvalidKind(0x7f))
        ));
    }

    #[test]
    fn rejects_oversized_declaration() {
        // ---
        let mut buf = BytesMut::new();
        buf.put_u8(0x01);
        buf.put_u32((MAX_PAYLOAD_LEN + 1) as u32);
        assert!(matches!(
            FrameCodec.decode(&mut buf),
            Err(CodecError::TooLarge(_))
        ));
    }

    #[test]
    fn rejects_short_ping_nonce() {
        // ---
        let mut buf = BytesMut::from(&[0x09, 0, 0, 0, 2, 1, 2][..]);
        assert!(matches!(
            FrameCodec.decode(&mut buf),
            Err(CodecError::InvalidPayload(_))
        ));
    }

    #[test]
    fn rejects_invalid_utf8_text() {
        // ---
        let mut buf = BytesMut::from(&[0x02, 0, 0, 0, 2, 0xff, 0xfe][..]);
        assert!(FrameCodec.decode(&mut buf).is_err());
    }
}
