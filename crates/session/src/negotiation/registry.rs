// Registry of in-flight negotiations keyed by (peer, negotiation id).
//
// The registry is the single source of truth for whether a negotiation is
// active. Session and resource negotiations live in two independent
// registries of the same shape.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tandem_common::types::UserId;
use tracing::{debug, warn};

/// Identity of a registered negotiation.
pub trait Negotiation: Send + Sync {
    fn peer(&self) -> &UserId;

    fn negotiation_id(&self) -> &str;
}

type RegistryKey = (UserId, String);

pub struct NegotiationRegistry<N> {
    name: &'static str,
    entries: Mutex<HashMap<RegistryKey, Arc<N>>>,
}

impl<N: Negotiation> NegotiationRegistry<N> {
    pub fn new(name: &'static str) -> Self {
        Self { name, entries: Mutex::new(HashMap::new()) }
    }

    /// Register a negotiation. A duplicate key is rejected, never overwritten.
    pub fn add(&self, negotiation: Arc<N>) -> bool {
        let key = (negotiation.peer().clone(), negotiation.negotiation_id().to_string());
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(&key) {
            warn!(
                registry = self.name,
                peer = %key.0,
                negotiation_id = %key.1,
                "negotiation already registered; rejecting duplicate"
            );
            return false;
        }
        entries.insert(key, negotiation);
        true
    }

    pub fn remove(&self, peer: &UserId, negotiation_id: &str) -> Option<Arc<N>> {
        let key = (peer.clone(), negotiation_id.to_string());
        let removed = self.entries.lock().unwrap_or_else(PoisonError::into_inner).remove(&key);
        if removed.is_none() {
            debug!(
                registry = self.name,
                peer = %peer,
                negotiation_id,
                "negotiation to remove is not registered"
            );
        }
        removed
    }

    pub fn get(&self, peer: &UserId, negotiation_id: &str) -> Option<Arc<N>> {
        let key = (peer.clone(), negotiation_id.to_string());
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).get(&key).cloned()
    }

    pub fn contains(&self, peer: &UserId, negotiation_id: &str) -> bool {
        self.get(peer, negotiation_id).is_some()
    }

    /// Point-in-time copy; safe to iterate while the registry changes.
    pub fn list(&self) -> Vec<Arc<N>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fake {
        peer: UserId,
        id: String,
        label: &'static str,
    }

    impl Negotiation for Fake {
        fn peer(&self) -> &UserId {
            &self.peer
        }

        fn negotiation_id(&self) -> &str {
            &self.id
        }
    }

    fn fake(peer: &str, id: &str, label: &'static str) -> Arc<Fake> {
        Arc::new(Fake { peer: UserId::new(peer), id: id.into(), label })
    }

    #[test]
    fn duplicate_add_keeps_the_first_entry() {
        let registry = NegotiationRegistry::new("session");
        assert!(registry.add(fake("bob", "n1", "first")));
        assert!(!registry.add(fake("bob", "n1", "second")));

        assert_eq!(registry.len(), 1);
        let entry = registry.get(&UserId::new("bob"), "n1").unwrap();
        assert_eq!(entry.label, "first");
    }

    #[test]
    fn same_id_from_different_peers_is_distinct() {
        let registry = NegotiationRegistry::new("resource");
        assert!(registry.add(fake("bob", "n1", "bob")));
        assert!(registry.add(fake("carol", "n1", "carol")));
        assert_eq!(registry.list().len(), 2);
    }

    #[test]
    fn list_counts_adds_minus_removes() {
        let registry = NegotiationRegistry::new("session");
        for id in ["a", "b", "c"] {
            registry.add(fake("bob", id, "x"));
        }
        assert!(registry.remove(&UserId::new("bob"), "b").is_some());
        assert!(registry.remove(&UserId::new("bob"), "b").is_none());
        assert!(registry.remove(&UserId::new("bob"), "missing").is_none());

        let snapshot = registry.list();
        registry.add(fake("bob", "d", "x"));
        assert_eq!(snapshot.len(), 2);
        assert_eq!(registry.len(), 3);
        assert!(!registry.contains(&UserId::new("bob"), "b"));
    }
}
