//! Endpoint to node lookup
//!
//! The relay only needs to know which node holds the live connection of each
//! recipient endpoint. Entries are kept per [`RecipientKey`], so one device
//! going away never hides another device of the same account that lives on a
//! different node. Where that knowledge comes from is up to the deployment; an
//! in-process [`SharedDirectory`] covers single-host clusters and tests.

use dashmap::DashMap;
use tracing::trace;

use crate::protocol::messages::{NodeId, Platform, RecipientKey};

/// Answers "which node holds endpoint X"
pub trait NodeLocator: Send + Sync {
    /// Node currently holding the connection for `key`
    fn locate(&self, key: &RecipientKey) -> Option<NodeId>;

    /// Record that `node` now holds the connection for `key`
    fn announce(&self, key: &RecipientKey, node: &str);

    /// Forget the mapping if it still points at `node`
    fn withdraw(&self, key: &RecipientKey, node: &str);

    /// Every located endpoint of `account`
    fn locate_account(&self, account: &str) -> Vec<(RecipientKey, NodeId)> {
        Platform::ALL
            .iter()
            .filter_map(|platform| {
                let key = RecipientKey::new(account, *platform);
                let node = self.locate(&key)?;
                Some((key, node))
            })
            .collect()
    }
}

/// Directory shared by every node in the process
#[derive(Debug, Default)]
pub struct SharedDirectory {
    endpoints: DashMap<RecipientKey, NodeId>,
}

impl SharedDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of located endpoints
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

impl NodeLocator for SharedDirectory {
    fn locate(&self, key: &RecipientKey) -> Option<NodeId> {
        self.endpoints.get(key).map(|node| node.value().clone())
    }

    fn announce(&self, key: &RecipientKey, node: &str) {
        trace!(recipient = %key, node, "Announcing endpoint location");
        self.endpoints.insert(key.clone(), node.to_string());
    }

    fn withdraw(&self, key: &RecipientKey, node: &str) {
        if self.endpoints.remove_if(key, |_, current| current == node).is_some() {
            trace!(recipient = %key, node, "Withdrew endpoint location");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_announce_and_locate() {
        let directory = SharedDirectory::new();
        let key = RecipientKey::desktop("alice");
        assert!(directory.locate(&key).is_none());

        directory.announce(&key, "node-a");
        assert_eq!(directory.locate(&key).as_deref(), Some("node-a"));

        directory.announce(&key, "node-b");
        assert_eq!(directory.locate(&key).as_deref(), Some("node-b"));
        assert_eq!(directory.len(), 1);
    }

    #[test]
    fn test_withdraw_only_own_mapping() {
        let directory = SharedDirectory::new();
        let key = RecipientKey::desktop("alice");
        directory.announce(&key, "node-b");

        directory.withdraw(&key, "node-a");
        assert_eq!(directory.locate(&key).as_deref(), Some("node-b"));

        directory.withdraw(&key, "node-b");
        assert!(directory.is_empty());
    }

    #[test]
    fn test_devices_on_different_nodes_are_tracked_separately() {
        let directory = SharedDirectory::new();
        let desktop = RecipientKey::desktop("bob");
        let mobile = RecipientKey::mobile("bob");

        directory.announce(&desktop, "node-a");
        directory.announce(&mobile, "node-b");
        assert_eq!(
            directory.locate_account("bob"),
            vec![
                (desktop.clone(), "node-a".to_string()),
                (mobile.clone(), "node-b".to_string()),
            ]
        );

        // The phone leaving node-b does not hide the desktop on node-a
        directory.withdraw(&mobile, "node-b");
        assert_eq!(directory.locate(&desktop).as_deref(), Some("node-a"));
        assert_eq!(directory.locate_account("bob"), vec![(desktop, "node-a".to_string())]);
    }
}
