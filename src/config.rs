//! Node configuration
//!
//! [`NodeConfig`] is a plain struct with defaults. A JSON file can override
//! any subset of it; every field in the file is optional and durations are
//! spelled out with their unit (`read_idle_secs`, `read_block_ms`, ...).

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ChatError, Result};
use crate::protocol::frame::MAX_FRAME_SIZE;
use crate::relay::RelayConfig;
use crate::server::dispatcher::DispatcherConfig;
use crate::server::session::SessionConfig;
use crate::server::sink_registry::{OverflowPolicy, SinkConfig};
use crate::transport::heartbeat::HeartbeatConfig;

/// Transport the node listens on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    #[default]
    Tcp,
    Quic,
}

impl TransportKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "tcp" => Some(TransportKind::Tcp),
            "quic" => Some(TransportKind::Quic),
            _ => None,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "tcp"),
            TransportKind::Quic => write!(f, "quic"),
        }
    }
}

/// Node configuration
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    /// Identifier other nodes relay to
    pub node_id: String,
    /// Address to bind to
    pub bind_addr: SocketAddr,
    pub transport: TransportKind,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Largest accepted frame payload in bytes
    pub max_frame_size: usize,
    pub heartbeat: HeartbeatConfig,
    pub sinks: SinkConfig,
    pub dispatcher: DispatcherConfig,
    pub relay: RelayConfig,
    /// Nodes this process runs on consecutive ports, relaying to each other
    /// through an in-process backend. One node runs without relay.
    pub nodes: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: format!("node-{}", &crate::generate_message_id()[..8]),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 4433)),
            transport: TransportKind::Tcp,
            max_connections: 10000,
            max_frame_size: MAX_FRAME_SIZE,
            heartbeat: HeartbeatConfig::default(),
            sinks: SinkConfig::default(),
            dispatcher: DispatcherConfig::default(),
            relay: RelayConfig::default(),
            nodes: 1,
        }
    }
}

impl NodeConfig {
    /// Load overrides from a JSON file on top of the defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ChatError::config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let file: FileConfig = serde_json::from_str(raw)?;
        let mut config = Self::default();
        file.apply(&mut config)?;
        Ok(config)
    }

    /// Per-connection settings derived from this config
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            heartbeat: self.heartbeat.clone(),
            max_frame_size: self.max_frame_size,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    node_id: Option<String>,
    bind_addr: Option<String>,
    transport: Option<String>,
    max_connections: Option<usize>,
    max_frame_size: Option<usize>,
    heartbeat: Option<FileHeartbeat>,
    sinks: Option<FileSinks>,
    workers: Option<usize>,
    relay: Option<FileRelay>,
    nodes: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileHeartbeat {
    read_idle_secs: Option<u64>,
    write_idle_secs: Option<u64>,
    all_idle_secs: Option<u64>,
    /// Zero disables closing on missed pongs
    max_missed_pings: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileSinks {
    capacity: Option<usize>,
    overflow: Option<String>,
    /// Zero disables idle eviction
    idle_ttl_secs: Option<u64>,
    eviction_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileRelay {
    group: Option<String>,
    batch_size: Option<usize>,
    read_block_ms: Option<u64>,
    claim_idle_ms: Option<u64>,
    max_deliveries: Option<u32>,
}

fn secs_or_disabled(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl FileConfig {
    fn apply(self, config: &mut NodeConfig) -> Result<()> {
        if let Some(node_id) = self.node_id {
            config.node_id = node_id;
        }
        if let Some(bind_addr) = self.bind_addr {
            config.bind_addr = bind_addr.parse()?;
        }
        if let Some(transport) = self.transport {
            config.transport = TransportKind::parse(&transport)
                .ok_or_else(|| ChatError::config(format!("Unknown transport: {}", transport)))?;
        }
        if let Some(max) = self.max_connections {
            config.max_connections = max;
        }
        if let Some(max) = self.max_frame_size {
            config.max_frame_size = max;
        }
        if let Some(nodes) = self.nodes {
            if nodes == 0 {
                return Err(ChatError::config("nodes must be at least 1"));
            }
            config.nodes = nodes;
        }
        if let Some(workers) = self.workers {
            if workers == 0 {
                return Err(ChatError::config("workers must be at least 1"));
            }
            config.dispatcher.workers = workers;
        }

        if let Some(heartbeat) = self.heartbeat {
            let target = &mut config.heartbeat;
            if let Some(secs) = heartbeat.read_idle_secs {
                target.read_idle = secs_or_disabled(secs);
            }
            if let Some(secs) = heartbeat.write_idle_secs {
                target.write_idle = secs_or_disabled(secs);
            }
            if let Some(secs) = heartbeat.all_idle_secs {
                target.all_idle = secs_or_disabled(secs);
            }
            if let Some(max) = heartbeat.max_missed_pings {
                target.max_missed_pings = (max > 0).then_some(max);
            }
        }

        if let Some(sinks) = self.sinks {
            let target = &mut config.sinks;
            if let Some(capacity) = sinks.capacity {
                if capacity == 0 {
                    return Err(ChatError::config("Sink capacity must be at least 1"));
                }
                target.capacity = capacity;
            }
            if let Some(overflow) = sinks.overflow {
                target.overflow = OverflowPolicy::parse(&overflow)
                    .ok_or_else(|| ChatError::config(format!("Unknown overflow policy: {}", overflow)))?;
            }
            if let Some(secs) = sinks.idle_ttl_secs {
                target.idle_ttl = secs_or_disabled(secs);
            }
            if let Some(secs) = sinks.eviction_interval_secs {
                target.eviction_interval = Duration::from_secs(secs.max(1));
            }
        }

        if let Some(relay) = self.relay {
            let target = &mut config.relay;
            if let Some(group) = relay.group {
                target.group = group;
            }
            if let Some(batch_size) = relay.batch_size {
                target.batch_size = batch_size.max(1);
            }
            if let Some(ms) = relay.read_block_ms {
                target.read_block = Duration::from_millis(ms);
            }
            if let Some(ms) = relay.claim_idle_ms {
                target.claim_idle = Duration::from_millis(ms);
            }
            if let Some(max) = relay.max_deliveries {
                target.max_deliveries = max.max(1);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_keeps_defaults() {
        let config = NodeConfig::from_json_str("{}").unwrap();
        let defaults = NodeConfig::default();

        assert_eq!(config.bind_addr, defaults.bind_addr);
        assert_eq!(config.heartbeat, defaults.heartbeat);
        assert_eq!(config.sinks, defaults.sinks);
        assert_eq!(config.relay, defaults.relay);
        assert!(config.node_id.starts_with("node-"));
    }

    #[test]
    fn test_overrides_are_applied() {
        let config = NodeConfig::from_json_str(
            r#"{
                "node_id": "node-7",
                "bind_addr": "0.0.0.0:9000",
                "transport": "quic",
                "max_connections": 10,
                "workers": 4,
                "heartbeat": { "read_idle_secs": 5, "max_missed_pings": 0 },
                "sinks": { "capacity": 16, "overflow": "reject", "idle_ttl_secs": 0 },
                "relay": { "group": "g", "claim_idle_ms": 250 },
                "nodes": 3
            }"#,
        )
        .unwrap();

        assert_eq!(config.node_id, "node-7");
        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.transport, TransportKind::Quic);
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.dispatcher.workers, 4);
        assert_eq!(config.heartbeat.read_idle, Some(Duration::from_secs(5)));
        assert_eq!(config.heartbeat.max_missed_pings, None);
        assert_eq!(config.sinks.capacity, 16);
        assert_eq!(config.sinks.overflow, OverflowPolicy::Reject);
        assert_eq!(config.sinks.idle_ttl, None);
        assert_eq!(config.relay.group, "g");
        assert_eq!(config.relay.claim_idle, Duration::from_millis(250));
        assert_eq!(config.relay.max_deliveries, RelayConfig::default().max_deliveries);
        assert_eq!(config.nodes, 3);
    }

    #[test]
    fn test_invalid_values_are_config_errors() {
        let bad_transport = NodeConfig::from_json_str(r#"{ "transport": "carrier-pigeon" }"#);
        assert!(matches!(bad_transport, Err(ChatError::Config(_))));

        let bad_policy = NodeConfig::from_json_str(r#"{ "sinks": { "overflow": "explode" } }"#);
        assert!(matches!(bad_policy, Err(ChatError::Config(_))));

        let bad_addr = NodeConfig::from_json_str(r#"{ "bind_addr": "nowhere" }"#);
        assert!(matches!(bad_addr, Err(ChatError::InvalidAddress(_))));

        let no_nodes = NodeConfig::from_json_str(r#"{ "nodes": 0 }"#);
        assert!(matches!(no_nodes, Err(ChatError::Config(_))));

        let unknown_field = NodeConfig::from_json_str(r#"{ "colour": "blue" }"#);
        assert!(unknown_field.is_err());
    }

    #[test]
    fn test_transport_kind_parse() {
        assert_eq!(TransportKind::parse("TCP"), Some(TransportKind::Tcp));
        assert_eq!(TransportKind::parse("quic"), Some(TransportKind::Quic));
        assert_eq!(TransportKind::parse("udp"), None);
    }
}
