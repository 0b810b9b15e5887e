//! Registry of live connections, keyed by recipient
//!
//! Registration is last-writer-wins. The caller decides what to do with a
//! displaced handle; sessions close it so the older transport winds down.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use crate::protocol::messages::{Platform, RecipientKey};
use crate::transport::connection::ConnectionHandle;

/// Concurrent map from recipient key to its live connection
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<RecipientKey, Arc<ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `key` to `handle`, returning the handle it displaced
    pub fn register(
        &self,
        key: RecipientKey,
        handle: Arc<ConnectionHandle>,
    ) -> Option<Arc<ConnectionHandle>> {
        debug!(recipient = %key, conn_id = handle.id(), "Registering connection");
        self.connections
            .insert(key, handle.clone())
            .filter(|previous| !Arc::ptr_eq(previous, &handle))
    }

    /// Current connection for `key`
    pub fn lookup(&self, key: &RecipientKey) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(key).map(|entry| entry.value().clone())
    }

    /// Remove whatever connection is registered for `key`
    pub fn remove(&self, key: &RecipientKey) -> Option<Arc<ConnectionHandle>> {
        self.connections.remove(key).map(|(_, handle)| handle)
    }

    /// Remove the entry only if it still belongs to `connection_id`.
    ///
    /// A late teardown of a replaced connection leaves the newer entry alone.
    pub fn remove_if_current(&self, key: &RecipientKey, connection_id: &str) -> bool {
        match self.connections.entry(key.clone()) {
            Entry::Occupied(entry) if entry.get().id() == connection_id => {
                entry.remove();
                true
            }
            _ => false,
        }
    }

    /// Live endpoints of one account, one lookup per platform
    pub fn connections_for_account(&self, account: &str) -> Vec<(RecipientKey, Arc<ConnectionHandle>)> {
        Platform::ALL
            .iter()
            .filter_map(|platform| {
                let key = RecipientKey::new(account, *platform);
                let handle = self.lookup(&key)?;
                Some((key, handle))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
