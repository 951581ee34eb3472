//! Frame decoding for the replication byte stream

use std::io;

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use mirrorfs_core::types::{TransactionFrame, FRAME_HEADER_LEN, FRAME_MAGIC, FRAME_TRAILER_LEN};

/// Upper bound on a single frame body; anything larger is a corrupt
/// length prefix
const MAX_FRAME_BODY: usize = 256 * 1024 * 1024;

/// Decodes length-prefixed transaction frames from the wire.
///
/// The stream is read-only for the follower and any integrity failure
/// surfaces as an error that tears the connection down; reconnecting
/// from the last applied position is always safe.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = TransactionFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let magic = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        if magic != FRAME_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad frame magic {magic:#010x}"),
            ));
        }
        let body_len = u32::from_le_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if body_len > MAX_FRAME_BODY {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame body of {body_len} bytes exceeds limit"),
            ));
        }
        let total = FRAME_HEADER_LEN + body_len + FRAME_TRAILER_LEN;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        let frame_bytes = src.split_to(total);
        let (frame, consumed) = TransactionFrame::decode(&frame_bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        debug_assert_eq!(consumed, total);
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirrorfs_core::types::FramePage;

    fn frame(position: u64) -> TransactionFrame {
        TransactionFrame::new(
            position,
            vec![FramePage::new(position * 32, vec![position as u8; 32])],
        )
    }

    #[test]
    fn test_decode_waits_for_complete_frame() {
        let mut codec = FrameCodec::new();
        let encoded = frame(1).encode();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&encoded[..5]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[5..encoded.len() - 1]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[encoded.len() - 1..]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.position, 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_back_to_back_frames() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&frame(1).encode());
        buf.extend_from_slice(&frame(2).encode());

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().position, 1);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().position, 2);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_bad_magic_tears_down() {
        let mut codec = FrameCodec::new();
        let mut encoded = frame(1).encode().to_vec();
        encoded[1] ^= 0xff;
        let mut buf = BytesMut::from(&encoded[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_corrupt_payload_tears_down() {
        let mut codec = FrameCodec::new();
        let mut encoded = frame(1).encode().to_vec();
        let mid = encoded.len() / 2;
        encoded[mid] ^= 0xff;
        let mut buf = BytesMut::from(&encoded[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_absurd_length_rejected() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
        buf.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(codec.decode(&mut buf).is_err());
    }
}
