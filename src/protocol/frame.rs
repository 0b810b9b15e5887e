//! Binary frame protocol with varint length-prefixed messages
//!
//! Frame format:
//! ```text
//! +----------------------+------------------+
//! | length               | payload          |
//! | (LEB128 varint, 1-10)| (length bytes)   |
//! +----------------------+------------------+
//! ```
//!
//! The length prefix uses the same encoding as protobuf's length-delimited fields, so
//! a frame is exactly what `prost::Message::encode_length_delimited` produces.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::encoding::{encode_varint, encoded_len_varint};

use crate::error::{ChatError, Result};

/// Longest valid varint encoding of a u64
pub const MAX_VARINT_LEN: usize = 10;

/// Default maximum frame payload size (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Outcome of peeking at a length prefix
enum LengthPrefix {
    /// Prefix is complete: (declared payload length, prefix size in bytes)
    Complete(u64, usize),
    /// More bytes are needed before the prefix can be read
    Incomplete,
}

/// Read a varint length prefix without consuming it
fn peek_length(buf: &[u8]) -> Result<LengthPrefix> {
    let mut value: u64 = 0;
    for (i, byte) in buf.iter().take(MAX_VARINT_LEN).enumerate() {
        value |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(LengthPrefix::Complete(value, i + 1));
        }
    }

    if buf.len() >= MAX_VARINT_LEN {
        return Err(ChatError::protocol("Length prefix exceeds 10 bytes"));
    }
    Ok(LengthPrefix::Incomplete)
}

/// A single protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame with the given payload
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Get the total encoded size of this frame
    pub fn encoded_size(&self) -> usize {
        encoded_len_varint(self.payload.len() as u64) + self.payload.len()
    }

    /// Encode this frame into a buffer
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_size());
        encode_varint(self.payload.len() as u64, buf);
        buf.put_slice(&self.payload);
    }

    /// Encode this frame into a new Bytes
    pub fn encode_to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Try to decode a frame from a buffer.
    ///
    /// Returns `Ok(Some(frame))` if a whole frame was available, `Ok(None)` if more
    /// data is needed. Nothing is consumed until a whole frame is present.
    pub fn decode(buf: &mut BytesMut, max_frame_size: usize) -> Result<Option<Frame>> {
        let (payload_len, prefix_len) = match peek_length(&buf[..])? {
            LengthPrefix::Complete(len, prefix) => (len, prefix),
            LengthPrefix::Incomplete => return Ok(None),
        };

        if payload_len > max_frame_size as u64 {
            return Err(ChatError::protocol(format!(
                "Frame payload too large: {} bytes (max: {})",
                payload_len, max_frame_size
            )));
        }

        let payload_len = payload_len as usize;
        if buf.len() < prefix_len + payload_len {
            buf.reserve(prefix_len + payload_len - buf.len());
            return Ok(None);
        }

        buf.advance(prefix_len);
        let payload = buf.split_to(payload_len).freeze();

        Ok(Some(Frame { payload }))
    }

    /// Decode a single frame from a complete buffer (no streaming)
    pub fn decode_complete(data: &[u8], max_frame_size: usize) -> Result<Frame> {
        let mut buf = BytesMut::from(data);
        match Self::decode(&mut buf, max_frame_size)? {
            Some(frame) if buf.is_empty() => Ok(frame),
            Some(_) => Err(ChatError::protocol(format!(
                "Trailing {} bytes after frame",
                buf.len()
            ))),
            None => Err(ChatError::protocol("Incomplete frame")),
        }
    }
}

/// Frame accumulator for streaming use
#[derive(Debug)]
pub struct FrameCodec {
    buffer: BytesMut,
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Create a new frame codec
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Create a new frame codec with a custom payload limit
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            max_frame_size,
        }
    }

    /// Feed data into the codec
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next frame
    pub fn decode_next(&mut self) -> Result<Option<Frame>> {
        Frame::decode(&mut self.buffer, self.max_frame_size)
    }

    /// Get the current buffer length
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Clear the buffer
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_encode_decode() {
        let original = Frame::new("Hello, World!");
        let encoded = original.encode_to_bytes();
        assert_eq!(encoded[0], 13);

        let decoded = Frame::decode_complete(&encoded, MAX_FRAME_SIZE).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_multi_byte_length_prefix() {
        let original = Frame::new(vec![7u8; 300]);
        let encoded = original.encode_to_bytes();
        // 300 = 0b10_0101100 -> [0xAC, 0x02]
        assert_eq!(&encoded[..2], &[0xAC, 0x02]);
        assert_eq!(encoded.len(), 302);

        let decoded = Frame::decode_complete(&encoded, MAX_FRAME_SIZE).unwrap();
        assert_eq!(decoded.payload.len(), 300);
    }

    #[test]
    fn test_frame_codec_streaming() {
        let mut codec = FrameCodec::new();

        let frame1 = Frame::new(vec![1u8; 200]);
        let frame2 = Frame::new(vec![2u8; 10]);

        let mut data = BytesMut::new();
        frame1.encode(&mut data);
        frame2.encode(&mut data);

        // Half of the two-byte prefix
        codec.feed(&data[..1]);
        assert!(codec.decode_next().unwrap().is_none());

        codec.feed(&data[1..50]);
        assert!(codec.decode_next().unwrap().is_none());
        assert_eq!(codec.buffered_len(), 50);

        codec.feed(&data[50..]);
        assert_eq!(codec.decode_next().unwrap().unwrap(), frame1);
        assert_eq!(codec.decode_next().unwrap().unwrap(), frame2);
        assert!(codec.decode_next().unwrap().is_none());
        assert_eq!(codec.buffered_len(), 0);
    }

    #[test]
    fn test_empty_frame() {
        let frame = Frame::new(Bytes::new());
        assert_eq!(frame.encoded_size(), 1);

        let encoded = frame.encode_to_bytes();
        let decoded = Frame::decode_complete(&encoded, MAX_FRAME_SIZE).unwrap();
        assert_eq!(frame, decoded);
    }

    #[test]
    fn test_overlong_varint_rejected() {
        let mut codec = FrameCodec::new();
        codec.feed(&[0xFF; 11]);
        assert!(matches!(codec.decode_next(), Err(ChatError::Protocol(_))));
    }

    #[test]
    fn test_frame_too_large() {
        let mut data = BytesMut::new();
        encode_varint(1025, &mut data);

        let mut codec = FrameCodec::with_max_frame_size(1024);
        codec.feed(&data);
        assert!(matches!(codec.decode_next(), Err(ChatError::Protocol(_))));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut data = BytesMut::new();
        Frame::new("abc").encode(&mut data);
        data.put_u8(0x01);
        assert!(Frame::decode_complete(&data, MAX_FRAME_SIZE).is_err());
    }
}
