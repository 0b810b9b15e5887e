//! Cross-node relay
//!
//! Every node owns one durable inbound stream (`chat:relay:{node_id}`). A node
//! that cannot deliver to a recipient locally appends a [`RelayRecord`] to the
//! stream of the node holding that recipient. That node's [`RelayConsumer`]
//! reads the stream through a consumer group and publishes into its local
//! sinks, acknowledging each record only after delivery succeeded.

pub mod consumer;
pub mod locator;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use prost::Message;
use tracing::debug;

use crate::error::Result;
use crate::protocol::messages::{AccountId, Envelope, Platform};

pub use consumer::RelayConsumer;
pub use locator::{NodeLocator, SharedDirectory};
pub use store::{EntryId, MemoryStreamStore, StreamEntry, StreamStore};

/// Stream key of a node's inbound relay stream
pub fn stream_key(node_id: &str) -> String {
    format!("chat:relay:{}", node_id)
}

/// Dead-letter stream paired with `stream`
pub fn dead_letter_key(stream: &str) -> String {
    format!("{}:dead", stream)
}

/// A message in transit to another node
#[derive(Debug, Clone, PartialEq)]
pub struct RelayRecord {
    pub to_account: AccountId,
    pub from_account: AccountId,
    /// Single target platform; every local endpoint of the account when unset
    pub to_platform: Option<Platform>,
    /// Protobuf-encoded [`Envelope`]
    pub body: Bytes,
}

impl RelayRecord {
    pub fn new(
        to_account: impl Into<AccountId>,
        from_account: impl Into<AccountId>,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            to_account: to_account.into(),
            from_account: from_account.into(),
            to_platform: None,
            body: body.into(),
        }
    }

    /// Wrap an envelope for relaying
    pub fn for_envelope(
        to_account: impl Into<AccountId>,
        from_account: impl Into<AccountId>,
        envelope: &Envelope,
    ) -> Self {
        Self::new(to_account, from_account, envelope.encode_to_vec())
    }

    pub fn with_platform(mut self, platform: Option<Platform>) -> Self {
        self.to_platform = platform;
        self
    }

    /// Decode the carried envelope
    pub fn envelope(&self) -> Result<Envelope> {
        Ok(Envelope::decode(self.body.as_ref())?)
    }
}

/// Relay configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    /// Consumer group every node reads its own stream through
    pub group: String,
    /// Records fetched per read
    pub batch_size: usize,
    /// How long one read waits for new records
    pub read_block: Duration,
    /// Pending records idle this long are claimed again
    pub claim_idle: Duration,
    /// Failed deliveries before a record goes to the dead-letter stream
    pub max_deliveries: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            group: "chat-relay".to_string(),
            batch_size: 64,
            read_block: Duration::from_secs(5),
            claim_idle: Duration::from_secs(30),
            max_deliveries: 5,
        }
    }
}

/// Collaborators every node of one cluster shares to relay between nodes.
///
/// All nodes must be built with the same backend. A deployment spanning hosts
/// plugs in its own [`NodeLocator`] and [`StreamStore`] backed by a shared
/// service; [`RelayBackend::in_process`] serves nodes living in one process.
#[derive(Clone)]
pub struct RelayBackend {
    pub locator: Arc<dyn NodeLocator>,
    pub store: Arc<dyn StreamStore>,
}

impl std::fmt::Debug for RelayBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayBackend").finish_non_exhaustive()
    }
}

impl RelayBackend {
    pub fn new(locator: Arc<dyn NodeLocator>, store: Arc<dyn StreamStore>) -> Self {
        Self { locator, store }
    }

    /// Shared directory and memory streams for nodes in this process
    pub fn in_process() -> Self {
        Self::new(Arc::new(SharedDirectory::new()), Arc::new(MemoryStreamStore::new()))
    }
}

/// Appends records to other nodes' streams
#[derive(Clone)]
pub struct RelayPublisher {
    store: Arc<dyn StreamStore>,
}

impl std::fmt::Debug for RelayPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayPublisher").finish_non_exhaustive()
    }
}

impl RelayPublisher {
    pub fn new(store: Arc<dyn StreamStore>) -> Self {
        Self { store }
    }

    /// Append `record` to the inbound stream of `target_node`
    pub async fn relay(&self, target_node: &str, record: RelayRecord) -> Result<EntryId> {
        let stream = stream_key(target_node);
        let to_account = record.to_account.clone();
        let id = self.store.append(&stream, record).await?;
        debug!(stream = %stream, entry = id, to = %to_account, "Relayed record");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::ChatMessage;

    #[test]
    fn test_stream_keys() {
        assert_eq!(stream_key("node-a"), "chat:relay:node-a");
        assert_eq!(dead_letter_key(&stream_key("node-a")), "chat:relay:node-a:dead");
    }

    #[test]
    fn test_record_carries_envelope() {
        let envelope = Envelope::chat(ChatMessage::new("alice", "bob", "hi"));
        let record = RelayRecord::for_envelope("bob", "alice", &envelope)
            .with_platform(Some(Platform::Mobile));

        assert_eq!(record.envelope().unwrap(), envelope);
        assert_eq!(record.to_platform, Some(Platform::Mobile));
    }

    #[tokio::test]
    async fn test_publisher_appends_to_target_stream() {
        let store = Arc::new(MemoryStreamStore::new());
        let publisher = RelayPublisher::new(store.clone());

        publisher
            .relay("node-b", RelayRecord::new("bob", "alice", Bytes::from_static(b"x")))
            .await
            .unwrap();

        assert_eq!(store.stream_len(&stream_key("node-b")), 1);
        assert_eq!(store.stream_len(&stream_key("node-a")), 0);
    }
}
