//! Protocol layer for the routing core
//!
//! This module provides:
//! - Varint length-prefixed frame encoding/decoding
//! - Protobuf envelope definitions
//! - A `tokio_util` codec joining the two

pub mod codec;
pub mod frame;
pub mod messages;

// Re-export commonly used types
pub use codec::{EnvelopeCodec, decode, encode};
pub use frame::{Frame, FrameCodec, MAX_FRAME_SIZE};
pub use messages::*;
