//! `tokio_util::codec::{Encoder, Decoder}` implementation of the frame
//! format: 8-byte BE payload size, 4-byte BE message type, then payload.
//!
//! The decoder is two-phase (awaiting header, then awaiting body) the same
//! way the read loop is described in §4.3: it never blocks mid-frame, it
//! just reports `Ok(None)` until enough bytes have accumulated, which is
//! exactly what `Framed`'s read-more-and-retry loop expects.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};
use crate::wire::{MessageType, RawFrame};

const HEADER_LEN: usize = 8 + 4;

/// Frames larger than this are rejected rather than accumulated
/// indefinitely; a single block (20 MiB) plus framing overhead comfortably
/// fits well under this.
const MAX_FRAME_LEN: u64 = 64 * 1024 * 1024;

#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Set once a header has been parsed, so subsequent calls know how many
    /// more bytes to wait for before extracting the body.
    awaiting_body: Option<(MessageType, usize)>,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for FrameCodec {
    type Item = RawFrame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RawFrame>> {
        let (msg_type, payload_len) = match self.awaiting_body {
            Some(state) => state,
            None => {
                if src.len() < HEADER_LEN {
                    src.reserve(HEADER_LEN - src.len());
                    return Ok(None);
                }
                let payload_len = src.get_u64() as u64;
                if payload_len > MAX_FRAME_LEN {
                    return Err(Error::FrameTooLarge(payload_len));
                }
                let msg_type = MessageType::from_u32(src.get_u32())?;
                let state = (msg_type, payload_len as usize);
                self.awaiting_body = Some(state);
                state
            }
        };

        if src.len() < payload_len {
            src.reserve(payload_len - src.len());
            return Ok(None);
        }

        let payload = src.split_to(payload_len).to_vec();
        self.awaiting_body = None;
        Ok(Some(RawFrame { msg_type, payload }))
    }
}

impl Encoder<RawFrame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: RawFrame, dst: &mut BytesMut) -> Result<()> {
        dst.reserve(HEADER_LEN + frame.payload.len());
        dst.put_u64(frame.payload.len() as u64);
        dst.put_u32(frame.msg_type as u32);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_then_decodes_single_frame() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        let frame = RawFrame {
            msg_type: MessageType::Block,
            payload: vec![1, 2, 3],
        };
        codec.encode(frame.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.msg_type, frame.msg_type);
        assert_eq!(decoded.payload, frame.payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn reassembles_frame_fed_one_byte_at_a_time() {
        let mut encode_codec = FrameCodec::new();
        let mut wire = BytesMut::new();
        encode_codec
            .encode(
                RawFrame {
                    msg_type: MessageType::Encryption,
                    payload: 0u32.to_be_bytes().to_vec(),
                },
                &mut wire,
            )
            .unwrap();

        let mut decode_codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        let mut result = None;
        for byte in wire.iter() {
            buf.put_u8(*byte);
            if let Some(frame) = decode_codec.decode(&mut buf).unwrap() {
                result = Some(frame);
            }
        }
        let frame = result.expect("frame should have been reassembled");
        assert_eq!(frame.msg_type, MessageType::Encryption);
        assert_eq!(frame.payload, 0u32.to_be_bytes().to_vec());
    }

    #[test]
    fn decode_returns_none_on_partial_header() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_slice(&[0u8; 5]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn rejects_oversized_frame() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u64(MAX_FRAME_LEN + 1);
        buf.put_u32(MessageType::Block as u32);
        assert!(codec.decode(&mut buf).is_err());
    }
}
