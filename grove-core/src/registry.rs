//! Leaf registry table: pure, single-threaded state. Owners wrap it in a
//! lock and expose only these accessor operations to connection workers.

use std::collections::HashMap;

use crate::protocol::LeafInfo;

/// Registry of registered leaves, keyed by PEM public key.
///
/// Replicated copies on sibling ultrapeers are independent tables kept in
/// sync by gossip; consistency between them is eventual.
#[derive(Debug, Default)]
pub struct Registry {
    entries: HashMap<String, LeafInfo>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `info.public_key` (last write wins).
    /// Returns the replaced entry, if any.
    pub fn upsert(&mut self, info: LeafInfo) -> Option<LeafInfo> {
        self.entries.insert(info.public_key.clone(), info)
    }

    /// Insert only if the key is absent. Returns whether the entry was
    /// inserted; a duplicate is the gossip loop-prevention signal.
    pub fn insert_if_absent(&mut self, info: LeafInfo) -> bool {
        if self.entries.contains_key(&info.public_key) {
            return false;
        }
        self.entries.insert(info.public_key.clone(), info);
        true
    }

    pub fn remove(&mut self, public_key: &str) -> Option<LeafInfo> {
        self.entries.remove(public_key)
    }

    pub fn get(&self, public_key: &str) -> Option<&LeafInfo> {
        self.entries.get(public_key)
    }

    /// Merge a full-registry snapshot from a sibling. Existing local entries
    /// win; returns the entries that were actually added.
    pub fn merge(&mut self, incoming: HashMap<String, LeafInfo>) -> Vec<LeafInfo> {
        let mut added = Vec::new();
        for (public_key, info) in incoming {
            if !self.entries.contains_key(&public_key) {
                self.entries.insert(public_key, info.clone());
                added.push(info);
            }
        }
        added
    }

    /// Point-in-time copy, for full syncs and broadcasts. Callers release
    /// the surrounding lock before doing anything with the copy.
    pub fn snapshot(&self) -> HashMap<String, LeafInfo> {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(key: &str, port: u16) -> LeafInfo {
        LeafInfo {
            public_key: key.to_string(),
            ip: "10.0.0.1".parse().unwrap(),
            p2p_port: port,
            registered_at: 0,
        }
    }

    #[test]
    fn upsert_is_last_write_wins() {
        let mut reg = Registry::new();
        assert!(reg.upsert(info("K1", 6001)).is_none());
        let replaced = reg.upsert(info("K1", 6002)).unwrap();
        assert_eq!(replaced.p2p_port, 6001);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get("K1").unwrap().p2p_port, 6002);
    }

    #[test]
    fn insert_if_absent_drops_duplicates() {
        let mut reg = Registry::new();
        assert!(reg.insert_if_absent(info("K1", 6001)));
        assert!(!reg.insert_if_absent(info("K1", 6002)));
        assert_eq!(reg.get("K1").unwrap().p2p_port, 6001);
    }

    #[test]
    fn remove_returns_entry_once() {
        let mut reg = Registry::new();
        reg.upsert(info("K1", 6001));
        assert!(reg.remove("K1").is_some());
        assert!(reg.remove("K1").is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn merge_prefers_existing_entries() {
        let mut reg = Registry::new();
        reg.upsert(info("K1", 6001));

        let mut incoming = HashMap::new();
        incoming.insert("K1".to_string(), info("K1", 7777));
        incoming.insert("K2".to_string(), info("K2", 6002));

        let added = reg.merge(incoming);
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].public_key, "K2");
        assert_eq!(reg.get("K1").unwrap().p2p_port, 6001);
        assert_eq!(reg.get("K2").unwrap().p2p_port, 6002);
    }

    #[test]
    fn snapshot_is_independent_copy() {
        let mut reg = Registry::new();
        reg.upsert(info("K1", 6001));
        let snap = reg.snapshot();
        reg.remove("K1");
        assert!(snap.contains_key("K1"));
        assert!(reg.is_empty());
    }
}
