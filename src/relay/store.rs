//! Durable stream store abstraction
//!
//! Modelled on append-only streams with consumer groups: records are appended
//! by key, read once per group, tracked as pending until acknowledged, and can
//! be claimed again after sitting unacknowledged for too long.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::RelayRecord;
use crate::error::{ChatError, Result};

/// Position of a record within its stream
pub type EntryId = u64;

/// A record handed to a consumer
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: EntryId,
    pub record: RelayRecord,
    /// How many times this record has been handed out, this delivery included
    pub deliveries: u32,
}

/// Durable per-key streams with consumer groups
pub trait StreamStore: Send + Sync {
    /// Append a record, returning its id
    fn append<'a>(&'a self, stream: &'a str, record: RelayRecord) -> BoxFuture<'a, Result<EntryId>>;

    /// Create the consumer group if missing (creating the stream too)
    fn ensure_group<'a>(&'a self, stream: &'a str, group: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Read records never delivered to `group`, waiting up to `block` for some
    fn read_group<'a>(
        &'a self,
        stream: &'a str,
        group: &'a str,
        consumer: &'a str,
        count: usize,
        block: Duration,
    ) -> BoxFuture<'a, Result<Vec<StreamEntry>>>;

    /// Acknowledge a pending record; `false` if it was not pending
    fn ack<'a>(&'a self, stream: &'a str, group: &'a str, id: EntryId) -> BoxFuture<'a, Result<bool>>;

    /// Take over pending records idle for at least `min_idle`
    fn claim_stale<'a>(
        &'a self,
        stream: &'a str,
        group: &'a str,
        consumer: &'a str,
        min_idle: Duration,
        count: usize,
    ) -> BoxFuture<'a, Result<Vec<StreamEntry>>>;

    /// Number of delivered but unacknowledged records
    fn pending_count<'a>(&'a self, stream: &'a str, group: &'a str) -> BoxFuture<'a, Result<usize>>;
}

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct GroupState {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, PendingEntry>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: BTreeMap<EntryId, RelayRecord>,
    next_id: EntryId,
    groups: HashMap<String, GroupState>,
}

impl StreamState {
    /// Drop entries every group has delivered and acknowledged
    fn compact(&mut self) {
        if self.groups.is_empty() {
            return;
        }
        let floor = self
            .groups
            .values()
            .map(|group| match group.pending.keys().next() {
                Some(&oldest) => oldest.min(group.last_delivered + 1),
                None => group.last_delivered + 1,
            })
            .min()
            .unwrap_or(0);
        self.entries = self.entries.split_off(&floor);
    }

    fn group_mut(&mut self, stream: &str, group: &str) -> Result<&mut GroupState> {
        self.groups
            .get_mut(group)
            .ok_or_else(|| ChatError::store(format!("No group {} on stream {}", group, stream)))
    }
}

/// In-process stream store
#[derive(Debug, Default)]
pub struct MemoryStreamStore {
    streams: DashMap<String, StreamState>,
    appended: Notify,
}

impl MemoryStreamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records currently retained in `stream`
    pub fn stream_len(&self, stream: &str) -> usize {
        self.streams
            .get(stream)
            .map(|state| state.entries.len())
            .unwrap_or(0)
    }

    /// Snapshot of the records retained in `stream`
    pub fn records(&self, stream: &str) -> Vec<RelayRecord> {
        self.streams
            .get(stream)
            .map(|state| state.entries.values().cloned().collect())
            .unwrap_or_default()
    }

    fn read_new(&self, stream: &str, group: &str, consumer: &str, count: usize) -> Result<Vec<StreamEntry>> {
        let mut state = self
            .streams
            .get_mut(stream)
            .ok_or_else(|| ChatError::store(format!("No such stream: {}", stream)))?;
        let state = &mut *state;

        let group_state = state.group_mut(stream, group)?;
        let start = group_state.last_delivered + 1;
        let now = Instant::now();

        let mut out = Vec::new();
        for (&id, record) in state.entries.range(start..).take(count) {
            out.push(StreamEntry {
                id,
                record: record.clone(),
                deliveries: 1,
            });
        }

        let group_state = state.group_mut(stream, group)?;
        for entry in &out {
            group_state.last_delivered = entry.id;
            group_state.pending.insert(
                entry.id,
                PendingEntry {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    deliveries: 1,
                },
            );
        }
        Ok(out)
    }
}

impl StreamStore for MemoryStreamStore {
    fn append<'a>(&'a self, stream: &'a str, record: RelayRecord) -> BoxFuture<'a, Result<EntryId>> {
        Box::pin(async move {
            let id = {
                let mut state = self.streams.entry(stream.to_string()).or_default();
                state.next_id += 1;
                let id = state.next_id;
                state.entries.insert(id, record);
                id
            };
            self.appended.notify_waiters();
            Ok(id)
        })
    }

    fn ensure_group<'a>(&'a self, stream: &'a str, group: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.streams
                .entry(stream.to_string())
                .or_default()
                .groups
                .entry(group.to_string())
                .or_default();
            Ok(())
        })
    }

    fn read_group<'a>(
        &'a self,
        stream: &'a str,
        group: &'a str,
        consumer: &'a str,
        count: usize,
        block: Duration,
    ) -> BoxFuture<'a, Result<Vec<StreamEntry>>> {
        Box::pin(async move {
            let deadline = Instant::now() + block;
            loop {
                let appended = self.appended.notified();
                tokio::pin!(appended);
                appended.as_mut().enable();

                let entries = self.read_new(stream, group, consumer, count)?;
                if !entries.is_empty() || Instant::now() >= deadline {
                    return Ok(entries);
                }

                tokio::select! {
                    _ = &mut appended => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
        })
    }

    fn ack<'a>(&'a self, stream: &'a str, group: &'a str, id: EntryId) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let Some(mut state) = self.streams.get_mut(stream) else {
                return Ok(false);
            };
            let acked = state.group_mut(stream, group)?.pending.remove(&id).is_some();
            if acked {
                state.compact();
            }
            Ok(acked)
        })
    }

    fn claim_stale<'a>(
        &'a self,
        stream: &'a str,
        group: &'a str,
        consumer: &'a str,
        min_idle: Duration,
        count: usize,
    ) -> BoxFuture<'a, Result<Vec<StreamEntry>>> {
        Box::pin(async move {
            let Some(mut state) = self.streams.get_mut(stream) else {
                return Ok(Vec::new());
            };
            let state = &mut *state;
            let now = Instant::now();

            let group_state = state
                .groups
                .get_mut(group)
                .ok_or_else(|| ChatError::store(format!("No group {} on stream {}", group, stream)))?;

            let mut out = Vec::new();
            for (&id, pending) in group_state.pending.iter_mut() {
                if out.len() >= count {
                    break;
                }
                if now.saturating_duration_since(pending.delivered_at) < min_idle {
                    continue;
                }
                let Some(record) = state.entries.get(&id) else {
                    continue;
                };
                pending.consumer = consumer.to_string();
                pending.delivered_at = now;
                pending.deliveries += 1;
                out.push(StreamEntry {
                    id,
                    record: record.clone(),
                    deliveries: pending.deliveries,
                });
            }
            Ok(out)
        })
    }

    fn pending_count<'a>(&'a self, stream: &'a str, group: &'a str) -> BoxFuture<'a, Result<usize>> {
        Box::pin(async move {
            match self.streams.get(stream) {
                Some(state) => state
                    .groups
                    .get(group)
                    .map(|group| group.pending.len())
                    .ok_or_else(|| ChatError::store(format!("No group {} on stream {}", group, stream))),
                None => Ok(0),
            }
        })
    }
}
