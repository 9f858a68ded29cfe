//! Length-prefixed framing for stream transports.
//!
//! Datagram transports carry one request per packet. Stream transports (TCP
//! clients and the peer listener) wrap each request or reply in a frame:
//!
//! ```text
//! +---------+---------------------+
//! | length  | payload             |
//! | u16 LE  | length bytes        |
//! +---------+---------------------+
//! ```

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the frame length prefix.
pub const FRAME_HEADER_SIZE: usize = 2;

/// Largest payload accepted in a single frame.
pub const MAX_FRAME_SIZE: usize = 8192;

/// A single length-prefixed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Bytes,
}

impl Frame {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Encodes the frame into bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let len = self.payload.len();
        if len == 0 {
            return Err(ProtocolError::EmptyFrame);
        }
        if len > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + len);
        buf.put_u16_le(len as u16);
        buf.put_slice(&self.payload);
        Ok(buf)
    }

    /// Decodes a frame from bytes.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed, or `Err` on protocol errors.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let len = u16::from_le_bytes([buf[0], buf[1]]) as usize;
        if len == 0 {
            return Err(ProtocolError::EmptyFrame);
        }
        if len > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }

        if buf.len() < FRAME_HEADER_SIZE + len {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(len).freeze();
        Ok(Some(Self { payload }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let frame = Frame::new(&b"abc"[..]);
        let encoded = frame.encode().unwrap();
        assert_eq!(&encoded[..], &[3, 0, b'a', b'b', b'c']);

        let mut buf = encoded;
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_incomplete_frame() {
        let mut buf = BytesMut::from(&[5u8][..]);
        assert!(Frame::decode(&mut buf).unwrap().is_none());

        let mut buf = BytesMut::from(&[5u8, 0, 1, 2][..]);
        assert!(Frame::decode(&mut buf).unwrap().is_none());
        // Nothing consumed while waiting
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn test_frame_too_large() {
        let frame = Frame::new(vec![0u8; MAX_FRAME_SIZE + 1]);
        assert!(matches!(
            frame.encode(),
            Err(ProtocolError::FrameTooLarge { .. })
        ));

        let mut buf = BytesMut::new();
        buf.put_u16_le((MAX_FRAME_SIZE + 1) as u16);
        assert!(matches!(
            Frame::decode(&mut buf),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_empty_frame_rejected() {
        assert!(matches!(
            Frame::new(Bytes::new()).encode(),
            Err(ProtocolError::EmptyFrame)
        ));
        let mut buf = BytesMut::from(&[0u8, 0][..]);
        assert!(matches!(
            Frame::decode(&mut buf),
            Err(ProtocolError::EmptyFrame)
        ));
    }

    #[test]
    fn test_multiple_frames_in_buffer() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&Frame::new(&b"one"[..]).encode().unwrap());
        buf.extend_from_slice(&Frame::new(&b"two"[..]).encode().unwrap());

        assert_eq!(Frame::decode(&mut buf).unwrap().unwrap().payload, "one");
        assert_eq!(Frame::decode(&mut buf).unwrap().unwrap().payload, "two");
        assert!(Frame::decode(&mut buf).unwrap().is_none());
    }
}
