use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use tracing::debug;

use super::rule::PathMapRule;

/// What one remote update changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SharedRuleDelta {
    pub removed: Vec<PathMapRule>,
    pub added: Vec<PathMapRule>,
}

impl SharedRuleDelta {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }
}

/// Rules other producers shared through an agent, per peer id.
///
/// Owned by whoever creates it and handed around by clone; the lock is only
/// held for one read-modify-write.
#[derive(Debug, Clone, Default)]
pub struct SharedRuleStore {
    rules: Arc<Mutex<HashMap<String, Vec<PathMapRule>>>>,
}

impl SharedRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer_id: &str) -> Vec<PathMapRule> {
        self.rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn clear(&self, peer_id: &str) {
        self.rules.lock().unwrap_or_else(PoisonError::into_inner).remove(peer_id);
    }

    /// Bring the shared rules of `peer_id` in line with what the agent reports.
    ///
    /// Known rules the agent no longer has are dropped; remote rules marked
    /// shared that are not known yet are added. Mappings compare on
    /// `(source, destination)`.
    pub fn update_from_remote(&self, peer_id: &str, remote: Option<&[PathMapRule]>) -> SharedRuleDelta {
        let remote = remote.unwrap_or_default();
        let mut guard = self.rules.lock().unwrap_or_else(PoisonError::into_inner);
        let existing = guard.entry(peer_id.to_string()).or_default();

        let mut delta = SharedRuleDelta::default();

        existing.retain(|rule| {
            let keep = remote.iter().any(|r| r.same_mapping(rule));
            if !keep {
                delta.removed.push(rule.clone());
            }
            keep
        });

        for rule in remote.iter().filter(|r| r.shared) {
            if existing.iter().any(|e| e.same_mapping(rule)) {
                continue;
            }
            existing.push(rule.clone());
            delta.added.push(rule.clone());
        }

        if !delta.is_empty() {
            debug!(peer = %peer_id, added = delta.added.len(), removed = delta.removed.len(), "shared path map rules changed");
        }
        delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adds_shared_and_drops_vanished_rules() {
        let store = SharedRuleStore::new();

        let first = vec![
            PathMapRule::new("/a", "/b").shared(),
            PathMapRule::new("/c", "/d"),
        ];
        let delta = store.update_from_remote("p1", Some(first.as_slice()));
        assert_eq!(delta.added, vec![PathMapRule::new("/a", "/b").shared()]);
        assert!(delta.removed.is_empty());

        let second = vec![PathMapRule::new("/e", "/f").shared()];
        let delta = store.update_from_remote("p1", Some(second.as_slice()));
        assert_eq!(delta.removed.len(), 1);
        assert_eq!(delta.added.len(), 1);
        assert_eq!(store.get("p1"), second);
    }

    #[test]
    fn repeated_update_is_quiet() {
        let store = SharedRuleStore::new();
        let rules = vec![PathMapRule::new("/a", "/b").shared()];
        store.update_from_remote("p1", Some(rules.as_slice()));
        assert!(store.update_from_remote("p1", Some(rules.as_slice())).is_empty());
    }

    #[test]
    fn peers_are_tracked_separately() {
        let store = SharedRuleStore::new();
        let rules = vec![PathMapRule::new("/a", "/b").shared()];
        store.update_from_remote("p1", Some(rules.as_slice()));
        assert!(store.get("p2").is_empty());
        store.update_from_remote("p1", None);
        assert!(store.get("p1").is_empty());
    }
}
