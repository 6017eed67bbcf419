//! Last-known values per cache key.
//!
//! Entries outlive the live listener that produced them, so a consumer
//! that comes back after teardown can render something immediately while a
//! new listener starts.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hearth_core::{CacheKey, Snapshot};
use tracing::trace;

/// A stored value and when it was observed.
#[derive(Debug, Clone, PartialEq)]
pub struct StateEntry {
    pub value: Snapshot,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct StateStore {
    entries: DashMap<CacheKey, StateEntry>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stored value for `key`.
    pub fn get(&self, key: &str) -> Option<Snapshot> {
        self.entries.get(key).map(|e| e.value().value.clone())
    }

    pub fn entry(&self, key: &str) -> Option<StateEntry> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    pub fn set(&self, key: CacheKey, value: Snapshot) {
        trace!(key = %key, "state stored");
        self.entries.insert(
            key,
            StateEntry {
                value,
                observed_at: Utc::now(),
            },
        );
    }

    /// Store an emission for `key`.
    ///
    /// List results also seed each contained document under its own path,
    /// so opening one of them later starts from the known value.
    pub fn record(&self, key: &CacheKey, value: &Snapshot) {
        if value.is_list() {
            for doc in value.iter_documents() {
                self.set(
                    CacheKey::new(doc.path.clone()),
                    Snapshot::document(Some(doc.clone())),
                );
            }
        }
        self.set(key.clone(), value.clone());
    }

    /// Remove the entry for `key`; absent keys are ignored.
    pub fn clear(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn clear_many<'a>(&self, keys: impl IntoIterator<Item = &'a CacheKey>) {
        for key in keys {
            self.entries.remove(key.as_str());
        }
    }

    pub fn clear_all(&self) {
        self.entries.clear();
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.entries.iter().map(|e| e.key().clone()).collect()
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
    use hearth_core::Document;

    #[test]
    fn test_set_get_clear() {
        let store = StateStore::new();
        let key = CacheKey::from("flights/a");
        assert_eq!(store.get("flights/a"), None);

        store.set(key.clone(), Snapshot::document(None));
        assert_eq!(store.get("flights/a"), Some(Snapshot::document(None)));
        assert!(store.entry("flights/a").unwrap().observed_at <= Utc::now());

        assert!(store.clear("flights/a"));
        assert!(!store.clear("flights/a"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_record_seeds_documents_of_lists() {
        let store = StateStore::new();
        let a = Document::new("flights/a").with("number", 1);
        let b = Document::new("flights/b").with("number", 2);
        store.record(
            &CacheKey::from("flights"),
            &Snapshot::documents(vec![a.clone(), b]),
        );

        assert_eq!(store.len(), 3);
        assert_eq!(store.get("flights/a"), Some(Snapshot::document(Some(a))));
    }

    #[test]
    fn test_clear_many_ignores_absent_keys() {
        let store = StateStore::new();
        store.set(CacheKey::from("a/1"), Snapshot::document(None));
        store.set(CacheKey::from("a/2"), Snapshot::document(None));
        store.clear_many(&[CacheKey::from("a/1"), CacheKey::from("missing")]);
        assert_eq!(store.keys(), vec![CacheKey::from("a/2")]);
    }
}
