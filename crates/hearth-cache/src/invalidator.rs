//! Cache invalidation.

use std::collections::BTreeSet;
use std::sync::Arc;

use hearth_core::path::{doc_id, parent};
use hearth_core::{CacheKey, Handle};
use tracing::debug;

use crate::{Multiplexer, QueryInvalidation, StateStore, WriteReceipt};

/// Drops live entries and stored values so the next observer starts from a
/// fresh listener.
///
/// Invalidating a key that has nothing cached is a no-op.
#[derive(Debug, Clone)]
pub struct Invalidator {
    mux: Multiplexer,
    states: Arc<StateStore>,
    policy: QueryInvalidation,
}

impl Invalidator {
    pub fn new(mux: Multiplexer, states: Arc<StateStore>, policy: QueryInvalidation) -> Self {
        Self {
            mux,
            states,
            policy,
        }
    }

    pub fn policy(&self) -> QueryInvalidation {
        self.policy
    }

    /// Invalidate one key. Returns whether anything was cached for it.
    pub fn invalidate(&self, key: &str) -> bool {
        let live = self.mux.remove(key);
        let stored = self.states.clear(key);
        if live || stored {
            debug!(key = %key, live, stored, "invalidated");
        }
        live || stored
    }

    pub fn invalidate_many<'a>(&self, keys: impl IntoIterator<Item = &'a CacheKey>) -> usize {
        keys.into_iter()
            .filter(|key| self.invalidate(key.as_str()))
            .count()
    }

    pub fn invalidate_handle(&self, handle: &Handle) -> bool {
        self.invalidate(handle.key().as_str())
    }

    /// Drop every live entry and every stored value.
    pub fn clear_all(&self) {
        self.mux.clear();
        self.states.clear_all();
        debug!("cache cleared");
    }

    /// Keys affected by a committed write under the configured policy.
    ///
    /// Always includes each written document and its parent collection.
    pub fn keys_for_write(&self, receipt: &WriteReceipt) -> Vec<CacheKey> {
        let mut keys = BTreeSet::new();
        let mut collections = BTreeSet::new();
        for path in &receipt.written {
            keys.insert(CacheKey::new(path.clone()));
            let collection = parent(path);
            if !collection.is_empty() {
                keys.insert(CacheKey::new(collection));
                collections.insert(collection.to_string());
            }
        }

        if self.policy != QueryInvalidation::None {
            let mut candidates: BTreeSet<CacheKey> = self.mux.live_keys().into_iter().collect();
            candidates.extend(self.states.keys());
            for key in candidates.into_iter().filter(CacheKey::is_query) {
                let affected = match self.policy {
                    QueryInvalidation::All => true,
                    QueryInvalidation::SameCollection => collections.iter().any(|c| {
                        key.root_path() == c || key.collection_group() == Some(doc_id(c))
                    }),
                    QueryInvalidation::None => false,
                };
                if affected {
                    keys.insert(key);
                }
            }
        }

        keys.into_iter().collect()
    }

    /// Invalidate everything a committed write may have changed. Returns
    /// the keys that had something cached.
    pub fn invalidate_after_write(&self, receipt: &WriteReceipt) -> Vec<CacheKey> {
        self.keys_for_write(receipt)
            .into_iter()
            .filter(|key| self.invalidate(key.as_str()))
            .collect()
    }
}
