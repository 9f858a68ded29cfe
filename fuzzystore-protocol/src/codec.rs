//! Incremental decoder for framed streams.

use crate::error::ProtocolError;
use crate::frame::Frame;
use bytes::{Bytes, BytesMut};

/// Buffers stream data and yields complete frames.
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next frame from the buffer.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        Frame::decode(&mut self.buffer)
    }

    /// Attempts to decode the next request payload from the buffer.
    pub fn decode_payload(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        Ok(self.decode_frame()?.map(|frame| frame.payload))
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Wraps a payload in a frame.
pub fn encode_frame(payload: &[u8]) -> Result<BytesMut, ProtocolError> {
    Frame::new(Bytes::copy_from_slice(payload)).encode()
}
