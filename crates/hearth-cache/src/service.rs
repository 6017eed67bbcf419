//! The live cache service.
//!
//! [`LiveCache`] picks how a handle is watched from the execution context:
//!
//! - **Server**: every emission of a fresh listener is published to the
//!   transfer bridge; nothing is memoized
//! - **Browser, memorize off**: a fresh listener per watch
//! - **Browser, memorize on**: the shared multiplexed listener, preceded by
//!   a transferred value or, failing that, the last stored value

use std::sync::Arc;

use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use hearth_core::{CacheKey, CollectionRef, Handle, Params, Selector, Snapshot, Target};
use tracing::{debug, trace};

use crate::{
    CacheConfig, CacheError, ExecutionContext, Invalidator, Multiplexer, RemoteStore, StateStore,
    TransferBridge, WriteOp, WriteReceipt,
};

/// A stream of full-state values for one or more handles.
pub type LiveStream<T = Snapshot> = BoxStream<'static, Result<T, CacheError>>;

pub struct LiveCache<S> {
    store: Arc<S>,
    config: CacheConfig,
    states: Arc<StateStore>,
    transfer: Arc<TransferBridge>,
    mux: Multiplexer,
    invalidator: Invalidator,
}

impl<S> Clone for LiveCache<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            config: self.config.clone(),
            states: self.states.clone(),
            transfer: self.transfer.clone(),
            mux: self.mux.clone(),
            invalidator: self.invalidator.clone(),
        }
    }
}

impl<S: RemoteStore> LiveCache<S> {
    pub fn new(store: S, config: CacheConfig) -> Self {
        Self::with_store(Arc::new(store), config)
    }

    pub fn with_store(store: Arc<S>, config: CacheConfig) -> Self {
        let states = Arc::new(StateStore::new());
        let mux = Multiplexer::new(states.clone(), &config);
        let invalidator = Invalidator::new(mux.clone(), states.clone(), config.query_invalidation);
        Self {
            store,
            transfer: Arc::new(TransferBridge::new(config.context)),
            config,
            states,
            mux,
            invalidator,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn states(&self) -> &Arc<StateStore> {
        &self.states
    }

    pub fn transfer(&self) -> &Arc<TransferBridge> {
        &self.transfer
    }

    pub fn multiplexer(&self) -> &Multiplexer {
        &self.mux
    }

    pub fn invalidator(&self) -> &Invalidator {
        &self.invalidator
    }

    /// Watch a handle.
    #[tracing::instrument(skip(self, handle), fields(key = %handle.key()))]
    pub fn watch(&self, handle: &Handle) -> LiveStream {
        let key = handle.key();
        match (self.config.context, self.config.memorize) {
            (ExecutionContext::Server, _) => self.watch_server(handle, key),
            (ExecutionContext::Browser, false) => self.watch_raw(handle, key),
            (ExecutionContext::Browser, true) => self.watch_memorized(handle, key),
        }
    }

    fn watch_raw(&self, handle: &Handle, key: CacheKey) -> LiveStream {
        self.store
            .listen(handle)
            .map(move |item| {
                item.map_err(|source| CacheError::Listen {
                    key: key.clone(),
                    source,
                })
            })
            .boxed()
    }

    fn watch_server(&self, handle: &Handle, key: CacheKey) -> LiveStream {
        let transfer = self.transfer.clone();
        let published = key.clone();
        self.watch_raw(handle, key)
            .inspect(move |item| {
                if let Ok(snapshot) = item {
                    transfer.publish(&published, snapshot);
                }
            })
            .boxed()
    }

    fn watch_memorized(&self, handle: &Handle, key: CacheKey) -> LiveStream {
        let store = self.store.clone();
        let owned = handle.clone();
        let subscription = self.mux.observe(key.clone(), move || store.listen(&owned));

        // A transferred value is one-shot, so take it even when unused.
        let transferred = self.transfer.consume(key.as_str());
        let seed = if subscription.has_replay() {
            None
        } else if let Some(value) = transferred {
            trace!(key = %key, "seeding from transfer");
            self.states.set(key.clone(), value.clone());
            Some(value)
        } else {
            self.states.get(key.as_str()).inspect(|_| {
                trace!(key = %key, "seeding from stored state");
            })
        };

        stream::iter(seed.map(Ok)).chain(subscription).boxed()
    }

    /// Watch a resolved target. A single handle yields one-element vectors.
    pub fn watch_target(&self, target: Target) -> LiveStream<Vec<Snapshot>> {
        match target {
            Target::One(handle) => self.watch(&handle).map(|item| item.map(|s| vec![s])).boxed(),
            Target::Many(handles) => self.watch_many(&handles),
        }
    }

    /// Resolve `selector` against `collection` and watch the result.
    ///
    /// Resolution errors are returned before anything is subscribed.
    pub fn watch_selector(
        &self,
        collection: &CollectionRef,
        selector: Selector,
        params: Option<&Params>,
    ) -> Result<LiveStream<Vec<Snapshot>>, CacheError> {
        let target = collection.resolve(selector, params)?;
        Ok(self.watch_target(target))
    }

    /// Watch several handles at once.
    ///
    /// Emits the latest value of every handle, in input order, once each has
    /// produced at least one value, and again on every later change. An
    /// empty input emits a single empty vector. The first error ends the
    /// stream.
    pub fn watch_many(&self, handles: &[Handle]) -> LiveStream<Vec<Snapshot>> {
        if handles.is_empty() {
            return stream::once(async { Ok::<_, CacheError>(Vec::new()) }).boxed();
        }
        let latest: Vec<Option<Snapshot>> = vec![None; handles.len()];
        let streams = stream::select_all(
            handles
                .iter()
                .enumerate()
                .map(|(index, handle)| self.watch(handle).map(move |item| (index, item))),
        );

        stream::unfold(Some((streams, latest)), |state| async move {
            let (mut streams, mut latest) = state?;
            loop {
                let (index, item) = streams.next().await?;
                match item {
                    Ok(snapshot) => {
                        latest[index] = Some(snapshot);
                        if latest.iter().all(Option::is_some) {
                            let values: Vec<Snapshot> = latest.iter().flatten().cloned().collect();
                            return Some((Ok(values), Some((streams, latest))));
                        }
                    }
                    Err(error) => return Some((Err(error), None)),
                }
            }
        })
        .boxed()
    }

    /// The first value of [`watch`](Self::watch).
    #[tracing::instrument(skip(self, handle), fields(key = %handle.key()))]
    pub async fn load(&self, handle: &Handle) -> Result<Snapshot, CacheError> {
        let mut values = self.watch(handle);
        values
            .next()
            .await
            .unwrap_or_else(|| Err(CacheError::Closed { key: handle.key() }))
    }

    /// Invalidate `handle`, then load it from a fresh listener.
    #[tracing::instrument(skip(self, handle), fields(key = %handle.key()))]
    pub async fn reload(&self, handle: &Handle) -> Result<Snapshot, CacheError> {
        self.invalidator.invalidate_handle(handle);
        self.load(handle).await
    }

    /// Read once from the store, bypassing the cache.
    pub async fn get_value(&self, handle: &Handle) -> Result<Snapshot, CacheError> {
        Ok(self.store.get(handle).await?)
    }

    /// Commit writes and invalidate what they touched.
    #[tracing::instrument(skip(self, writes), fields(count = writes.len()))]
    pub async fn commit(&self, writes: Vec<WriteOp>) -> Result<WriteReceipt, CacheError> {
        let receipt = self.store.commit(writes).await?;
        let invalidated = self.invalidator.invalidate_after_write(&receipt);
        debug!(
            written = receipt.written.len(),
            invalidated = invalidated.len(),
            "write committed"
        );
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    use hearth_core::{BuildError, Document, FieldValue, FilterOp, limit, where_};
    use pretty_assertions::assert_eq;

    use crate::{MemoryStore, TeardownDelay};

    fn flight(id: &str, number: i64) -> Document {
        Document::new(format!("flights/{id}")).with("number", number)
    }

    fn store() -> MemoryStore {
        MemoryStore::with_documents([flight("a", 1), flight("b", 2), flight("c", 30)])
    }

    fn doc_handle(id: &str) -> Handle {
        Handle::document(format!("flights/{id}")).unwrap()
    }

    fn single(snapshot: &Snapshot) -> &Document {
        snapshot.iter_documents().next().expect("document present")
    }

    #[tokio::test(start_paused = true)]
    async fn test_browser_watch_shares_listener() {
        let store = store();
        let cache = LiveCache::new(store.clone(), CacheConfig::default());
        let handle = doc_handle("a");

        let mut a = cache.watch(&handle);
        let mut b = cache.watch(&handle);
        assert_eq!(single(&a.next().await.unwrap().unwrap()).path, "flights/a");
        assert_eq!(single(&b.next().await.unwrap().unwrap()).path, "flights/a");
        assert_eq!(store.listen_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memorize_off_opens_listener_per_watch() {
        let store = store();
        let cache = LiveCache::new(store.clone(), CacheConfig::default().with_memorize(false));
        let handle = doc_handle("a");
        let _a = cache.watch(&handle);
        let _b = cache.watch(&handle);
        assert_eq!(store.listen_count(), 2);
        assert!(cache.multiplexer().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_publishes_transfer_state() {
        let cache = LiveCache::new(store(), CacheConfig::server());
        let handle = doc_handle("a");
        let missing = doc_handle("zz");

        cache.load(&handle).await.unwrap();
        cache.load(&missing).await.unwrap();
        assert!(cache.multiplexer().is_empty());

        let map = cache.transfer().export().unwrap();
        assert_eq!(map.keys().collect::<Vec<_>>(), vec!["flights/a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_browser_starts_from_transferred_value() {
        let stale = Snapshot::document(Some(flight("a", 100)));
        let mut map = serde_json::Map::new();
        map.insert("flights/a".into(), serde_json::to_value(&stale).unwrap());

        let cache = LiveCache::new(store(), CacheConfig::default());
        cache.transfer().hydrate(map);

        let handle = doc_handle("a");
        let mut values = cache.watch(&handle);
        assert_eq!(values.next().await.unwrap().unwrap(), stale);
        let live = values.next().await.unwrap().unwrap();
        assert_eq!(single(&live).get("number"), Some(&FieldValue::Integer(1)));

        // Consumed once.
        assert!(cache.transfer().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_seed_after_teardown() {
        let store = store();
        let cache = LiveCache::new(
            store.clone(),
            CacheConfig::default().with_teardown(TeardownDelay::After(Duration::from_millis(100))),
        );
        let handle = doc_handle("a");

        cache.load(&handle).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(cache.multiplexer().is_empty());

        store.insert(flight("a", 5));
        let mut values = cache.watch(&handle);
        let seeded = values.next().await.unwrap().unwrap();
        assert_eq!(single(&seeded).get("number"), Some(&FieldValue::Integer(1)));
        let fresh = values.next().await.unwrap().unwrap();
        assert_eq!(single(&fresh).get("number"), Some(&FieldValue::Integer(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_collection_emission_seeds_documents() {
        let cache = LiveCache::new(store(), CacheConfig::default());
        let handle = Handle::collection("flights").unwrap();
        cache.load(&handle).await.unwrap();
        assert!(cache.states().get("flights/b").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_uses_fresh_listener() {
        let store = store();
        let cache = LiveCache::new(
            store.clone(),
            CacheConfig::default().with_teardown(TeardownDelay::Never),
        );
        let handle = doc_handle("a");
        cache.load(&handle).await.unwrap();
        cache.reload(&handle).await.unwrap();
        assert_eq!(store.listen_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_many() {
        let cache = LiveCache::new(store(), CacheConfig::default());
        let mut empty = cache.watch_many(&[]);
        assert_eq!(empty.next().await.unwrap().unwrap(), Vec::<Snapshot>::new());
        assert!(empty.next().await.is_none());

        let mut both = cache.watch_many(&[doc_handle("b"), doc_handle("a")]);
        let values = both.next().await.unwrap().unwrap();
        let paths: Vec<&str> = values.iter().map(|s| single(s).path.as_str()).collect();
        assert_eq!(paths, vec!["flights/b", "flights/a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_many_ends_on_first_error() {
        let store = store();
        store.deny("flights/b", crate::ListenError::PermissionDenied("no".into()));
        let cache = LiveCache::new(store, CacheConfig::default());
        let mut values = cache.watch_many(&[doc_handle("a"), doc_handle("b")]);
        assert!(matches!(
            values.next().await,
            Some(Err(CacheError::Listen { .. }))
        ));
        assert!(values.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_selector_reports_build_errors() {
        let cache = LiveCache::new(store(), CacheConfig::default());
        let stakeholders = CollectionRef::new("movies/:movieId/stakeholders");
        let err = cache
            .watch_selector(&stakeholders, Selector::Collection, None)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            CacheError::Build(BuildError::MissingParam { .. })
        ));
        assert!(cache.multiplexer().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_selector_query() {
        let cache = LiveCache::new(store(), CacheConfig::default());
        let mut values = cache
            .watch_selector(
                &CollectionRef::new("flights"),
                Selector::ByQuery(vec![where_("number", FilterOp::LessThan, 10), limit(3)]),
                None,
            )
            .unwrap();
        let values = values.next().await.unwrap().unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].iter_documents().count(), 2);
        assert!(cache.multiplexer().is_live("flights|f:[number < i:10]|l:3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_invalidates_written_keys() {
        let cache = LiveCache::new(store(), CacheConfig::default());
        let handle = doc_handle("a");
        cache.load(&handle).await.unwrap();
        assert!(cache.states().get("flights/a").is_some());

        let receipt = cache
            .commit(vec![WriteOp::Set {
                path: "flights/a".into(),
                fields: BTreeMap::from([("number".to_string(), FieldValue::from(9))]),
            }])
            .await
            .unwrap();
        assert_eq!(receipt.written, vec!["flights/a"]);
        assert!(cache.states().get("flights/a").is_none());
        assert!(!cache.multiplexer().is_live("flights/a"));

        let fresh = cache.get_value(&handle).await.unwrap();
        assert_eq!(single(&fresh).get("number"), Some(&FieldValue::Integer(9)));
    }
}
