//! Real-time chat message routing core
//!
//! Clients hold one long-lived connection (TCP or QUIC) and exchange
//! length-prefixed protobuf envelopes with a node. Each node:
//!
//! - binds a connection to the (account, platform) identity it asserts
//! - buffers outbound messages per recipient so they survive reconnects
//! - dispatches inbound envelopes to handlers by payload case
//! - relays messages for recipients held by other nodes through a durable stream

pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod transport;

pub use client::{ChatClient, ClientConfig, ClientEvent, Connector, QuicConnector, TcpConnector};
pub use config::{NodeConfig, TransportKind};
pub use error::{ChatError, Result};
pub use server::{ChatNode, NodeServices, local_cluster};

use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generate a unique message ID
pub fn generate_message_id() -> String {
    Uuid::new_v4().to_string()
}

/// Get current timestamp in milliseconds since UNIX epoch
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
