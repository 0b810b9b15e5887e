//! Transport layer
//!
//! This module provides:
//! - Connection handles shared between sessions and registries
//! - Idle timers for ping/pong liveness
//! - QUIC endpoint setup and the single-stream adapter

pub mod connection;
pub mod heartbeat;
pub mod quic;

// Re-export commonly used types
pub use connection::{ConnectionHandle, ConnectionId, ConnectionStatus};
pub use heartbeat::{ActivityClock, HeartbeatConfig, IdleEvent, IdleMonitor};
pub use quic::QuicBiStream;
