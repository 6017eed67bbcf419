//! Hand-off of values from a server render to the browser.
//!
//! The server side publishes values as listeners produce them and exports
//! the result as a JSON map keyed by cache key. The browser side hydrates
//! that map and consumes each value once.

use dashmap::DashMap;
use hearth_core::{CacheKey, Snapshot};
use tracing::{debug, trace, warn};

use crate::ExecutionContext;

#[derive(Debug)]
pub struct TransferBridge {
    context: ExecutionContext,
    values: DashMap<CacheKey, Snapshot>,
}

impl TransferBridge {
    pub fn new(context: ExecutionContext) -> Self {
        Self {
            context,
            values: DashMap::new(),
        }
    }

    pub fn context(&self) -> ExecutionContext {
        self.context
    }

    /// Record `value` for `key` on the server side.
    ///
    /// The first value published for a key wins. Missing documents are not
    /// transferred. In the browser context this does nothing.
    pub fn publish(&self, key: &CacheKey, value: &Snapshot) {
        if self.context != ExecutionContext::Server {
            return;
        }
        if matches!(value, Snapshot::Document { document: None }) {
            trace!(key = %key, "skipping transfer of missing document");
            return;
        }
        self.values
            .entry(key.clone())
            .or_insert_with(|| value.clone());
    }

    /// Take the transferred value for `key`, if any.
    ///
    /// A value can be consumed once. In the server context this always
    /// returns `None`.
    pub fn consume(&self, key: &str) -> Option<Snapshot> {
        if self.context != ExecutionContext::Browser {
            return None;
        }
        let (_, value) = self.values.remove(key)?;
        trace!(key = %key, "consumed transferred value");
        Some(value)
    }

    /// Whether a value for `key` is waiting to be consumed or exported.
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Serialize every published value into the hydration map.
    pub fn export(&self) -> Result<serde_json::Map<String, serde_json::Value>, serde_json::Error> {
        let mut map = serde_json::Map::new();
        for entry in self.values.iter() {
            map.insert(entry.key().to_string(), serde_json::to_value(entry.value())?);
        }
        debug!(entries = map.len(), "exported transfer state");
        Ok(map)
    }

    /// Load a hydration map produced by [`export`](Self::export).
    ///
    /// Entries that do not parse are skipped. Returns the number loaded.
    pub fn hydrate(&self, map: serde_json::Map<String, serde_json::Value>) -> usize {
        let mut loaded = 0;
        for (key, value) in map {
            match serde_json::from_value::<Snapshot>(value) {
                Ok(snapshot) => {
                    self.values.insert(CacheKey::new(key), snapshot);
                    loaded += 1;
                }
                Err(e) => warn!(key = %key, error = %e, "skipping malformed transfer entry"),
            }
        }
        debug!(entries = loaded, "hydrated transfer state");
        loaded
    }
}
