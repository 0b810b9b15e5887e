//! Relay consumer: drains a node's inbound stream into local sinks

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::store::{StreamEntry, StreamStore};
use super::{RelayConfig, RelayRecord, dead_letter_key, stream_key};
use crate::error::{ChatError, Result};
use crate::protocol::messages::{NodeId, RecipientKey};
use crate::server::sink_registry::SinkRegistry;

/// Pause after a failed store call before polling again
const STORE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Outcome of handling one stream entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    /// Published into this many local sinks and acknowledged
    Delivered(usize),
    /// Some endpoints took it; the rest were re-appended as single-endpoint
    /// records and the original acknowledged
    PartiallyDelivered { delivered: usize, retried: usize },
    /// Delivery failed; left pending for redelivery
    Pending,
    /// Delivery failed too often; moved to the dead-letter stream and acknowledged
    DeadLettered,
}

/// The single consumer-group member reading this node's relay stream
pub struct RelayConsumer {
    node_id: NodeId,
    stream: String,
    store: Arc<dyn StreamStore>,
    sinks: Arc<SinkRegistry>,
    config: RelayConfig,
}

impl RelayConsumer {
    pub fn new(
        node_id: impl Into<NodeId>,
        store: Arc<dyn StreamStore>,
        sinks: Arc<SinkRegistry>,
        config: RelayConfig,
    ) -> Self {
        let node_id = node_id.into();
        Self {
            stream: stream_key(&node_id),
            node_id,
            store,
            sinks,
            config,
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Create the consumer group on this node's stream
    pub async fn init(&self) -> Result<()> {
        self.store.ensure_group(&self.stream, &self.config.group).await
    }

    /// Local keys a record should be published to
    fn resolve_keys(&self, record: &RelayRecord) -> Vec<RecipientKey> {
        if let Some(platform) = record.to_platform {
            return vec![RecipientKey::new(record.to_account.clone(), platform)];
        }
        let keys = self.sinks.keys_for_account(&record.to_account);
        if keys.is_empty() {
            vec![RecipientKey::desktop(record.to_account.clone())]
        } else {
            keys
        }
    }

    /// Publish to every resolved key; returns the count delivered and the keys that refused
    fn deliver(&self, record: &RelayRecord) -> Result<(usize, Vec<(RecipientKey, ChatError)>)> {
        let envelope = record.envelope()?;
        let mut delivered = 0;
        let mut failed = Vec::new();
        for key in self.resolve_keys(record) {
            match self.sinks.register_sink_flow(&key).try_publish(envelope.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => failed.push((key, e)),
            }
        }
        Ok((delivered, failed))
    }

    /// Deliver one entry and acknowledge it on success.
    ///
    /// A failed entry stays pending unless it has used up its deliveries, in
    /// which case it is copied to the dead-letter stream and acknowledged. When
    /// only some endpoints refuse it, those get their own records so the ones
    /// that accepted it never see it twice.
    pub async fn process_entry(&self, entry: &StreamEntry) -> Result<EntryOutcome> {
        let group = &self.config.group;
        let (delivered, mut failed) = match self.deliver(&entry.record) {
            Ok(attempt) => attempt,
            Err(e) => return self.retry_or_dead_letter(entry, e).await,
        };

        match failed.pop() {
            None => {
                self.store.ack(&self.stream, group, entry.id).await?;
                debug!(
                    stream = %self.stream,
                    entry = entry.id,
                    to = %entry.record.to_account,
                    delivered,
                    "Relay record delivered"
                );
                Ok(EntryOutcome::Delivered(delivered))
            }
            Some((_, e)) if delivered == 0 => self.retry_or_dead_letter(entry, e).await,
            Some(last) => {
                failed.push(last);
                for (key, e) in &failed {
                    warn!(
                        stream = %self.stream,
                        entry = entry.id,
                        recipient = %key,
                        "Relay delivery to endpoint failed, retrying it alone: {}",
                        e
                    );
                    let retry = entry.record.clone().with_platform(Some(key.platform));
                    self.store.append(&self.stream, retry).await?;
                }
                self.store.ack(&self.stream, group, entry.id).await?;
                Ok(EntryOutcome::PartiallyDelivered {
                    delivered,
                    retried: failed.len(),
                })
            }
        }
    }

    async fn retry_or_dead_letter(&self, entry: &StreamEntry, e: ChatError) -> Result<EntryOutcome> {
        let group = &self.config.group;
        if entry.deliveries >= self.config.max_deliveries {
            let dead = dead_letter_key(&self.stream);
            self.store.append(&dead, entry.record.clone()).await?;
            self.store.ack(&self.stream, group, entry.id).await?;
            error!(
                stream = %self.stream,
                entry = entry.id,
                deliveries = entry.deliveries,
                "Relay record dead-lettered: {}",
                e
            );
            return Ok(EntryOutcome::DeadLettered);
        }

        warn!(
            stream = %self.stream,
            entry = entry.id,
            deliveries = entry.deliveries,
            "Relay delivery failed, leaving pending: {}",
            e
        );
        Ok(EntryOutcome::Pending)
    }

    /// Reclaim stale pending records, then read new ones; returns entries handled
    pub async fn poll_once(&self) -> Result<usize> {
        let group = &self.config.group;
        let mut entries = self
            .store
            .claim_stale(
                &self.stream,
                group,
                &self.node_id,
                self.config.claim_idle,
                self.config.batch_size,
            )
            .await?;

        if entries.is_empty() {
            entries = self
                .store
                .read_group(
                    &self.stream,
                    group,
                    &self.node_id,
                    self.config.batch_size,
                    self.config.read_block,
                )
                .await?;
        }

        for entry in &entries {
            self.process_entry(entry).await?;
        }
        Ok(entries.len())
    }

    /// Consume until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        loop {
            match self.init().await {
                Ok(()) => break,
                Err(e) => {
                    error!("Failed to create relay consumer group: {}", e);
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(STORE_RETRY_DELAY) => {}
                    }
                }
            }
        }

        info!(stream = %self.stream, group = %self.config.group, "Relay consumer started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.poll_once() => {
                    if let Err(e) = result {
                        error!(stream = %self.stream, "Relay poll failed: {}", e);
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(STORE_RETRY_DELAY) => {}
                        }
                    }
                }
            }
        }

        info!(stream = %self.stream, "Relay consumer stopped");
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}
