//! Codec for encoding/decoding envelopes to/from frames
//!
//! This module provides the bridge between typed envelopes and binary frames,
//! both as free functions and as a `tokio_util` codec for framed transports.

use bytes::{Bytes, BytesMut};
use prost::Message;
use tokio_util::codec::{Decoder, Encoder};

use super::frame::{Frame, MAX_FRAME_SIZE};
use super::messages::Envelope;
use crate::error::{ChatError, Result};

/// Encode an envelope into a complete frame (length prefix included)
pub fn encode(envelope: &Envelope) -> Bytes {
    Frame::new(envelope.encode_to_vec()).encode_to_bytes()
}

/// Decode an envelope from a frame payload
pub fn decode(payload: &[u8]) -> Result<Envelope> {
    Ok(Envelope::decode(payload)?)
}

/// Length-prefixed protobuf codec for `FramedRead` / `FramedWrite`
#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    max_frame_size: usize,
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl EnvelopeCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = ChatError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>> {
        match Frame::decode(src, self.max_frame_size)? {
            Some(frame) => decode(&frame.payload).map(Some),
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Envelope>> {
        match self.decode(buf)? {
            Some(envelope) => Ok(Some(envelope)),
            None if buf.is_empty() => Ok(None),
            None => Err(ChatError::transport(format!(
                "Stream closed with {} bytes of a partial frame",
                buf.len()
            ))),
        }
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = ChatError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<()> {
        let len = item.encoded_len();
        if len > self.max_frame_size {
            return Err(ChatError::protocol(format!(
                "Outbound envelope too large: {} bytes (max: {})",
                len, self.max_frame_size
            )));
        }
        item.encode_length_delimited(dst)?;
        Ok(())
    }
}
