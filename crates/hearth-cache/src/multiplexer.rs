//! Subscription multiplexer.
//!
//! At most one live listener runs per [`CacheKey`]. Subscribers share it
//! through a broadcast channel; the entry keeps the latest value so that a
//! late subscriber starts from it. When the last subscriber detaches the
//! entry stays open for the configured [`TeardownDelay`], and a new
//! subscriber arriving in that window reuses it.
//!
//! Locking: the entry map shard is always taken before an entry's own
//! mutex, never after. Pump and teardown tasks release the entry mutex
//! before touching the map.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll, ready};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::{Stream, StreamExt};
use hearth_core::{CacheKey, Snapshot};
use tokio::sync::broadcast;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, trace, warn};

use crate::{CacheConfig, CacheError, ListenError, SnapshotStream, StateStore, TeardownDelay};

/// What a live entry broadcasts to its subscribers.
#[derive(Debug, Clone)]
enum Event {
    Value(Snapshot),
    Error(ListenError),
    Complete,
}

#[derive(Debug, Default)]
struct EntryState {
    refcount: usize,
    last_value: Option<Snapshot>,
    /// Errored, completed, or torn down. A closed entry is never reused.
    closed: bool,
    /// Removed from the map by invalidation while still observed.
    orphaned: bool,
    /// Bumped on every attach and every scheduled teardown; a teardown
    /// only fires if the epoch it was scheduled with is still current.
    teardown_epoch: u64,
    teardown: Option<JoinHandle<()>>,
    pump: Option<AbortHandle>,
}

struct LiveEntry {
    key: CacheKey,
    tx: broadcast::Sender<Event>,
    state: Mutex<EntryState>,
}

impl LiveEntry {
    fn new(key: CacheKey, capacity: usize) -> Arc<Self> {
        let (tx, _) = broadcast::channel(capacity);
        Arc::new(Self {
            key,
            tx,
            state: Mutex::new(EntryState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a subscriber. Returns `None` if the entry is closed.
    ///
    /// The receiver and the replay value are taken under the same lock the
    /// pump publishes under, so the subscriber sees every value exactly
    /// once from the replay onward.
    fn attach(&self) -> Option<(broadcast::Receiver<Event>, Option<Snapshot>)> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        state.refcount += 1;
        state.teardown_epoch += 1;
        if let Some(timer) = state.teardown.take() {
            timer.abort();
            trace!(key = %self.key, "teardown cancelled");
        }
        Some((self.tx.subscribe(), state.last_value.clone()))
    }

    /// Store and broadcast a value. Returns whether the value should also
    /// be recorded in the state store.
    fn publish(&self, snapshot: Snapshot) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.last_value = Some(snapshot.clone());
        if self.tx.send(Event::Value(snapshot)).is_err() {
            trace!(key = %self.key, "no subscribers for live value");
        }
        !state.orphaned
    }

    /// Close the entry and broadcast a terminal event.
    fn finish(&self, event: Event) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.pump = None;
        if self.tx.send(event).is_err() {
            trace!(key = %self.key, "no subscribers for terminal event");
        }
    }
}

struct Inner {
    entries: DashMap<CacheKey, Arc<LiveEntry>>,
    states: Arc<StateStore>,
    teardown: TeardownDelay,
    capacity: usize,
    listeners_opened: AtomicU64,
}

impl Inner {
    /// Remove `entry` from the map if it is still the one stored there.
    fn forget(&self, entry: &Arc<LiveEntry>) {
        self.entries
            .remove_if(&entry.key, |_, current| Arc::ptr_eq(current, entry));
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for entry in self.entries.iter() {
            let mut state = entry.value().lock();
            state.closed = true;
            if let Some(pump) = state.pump.take() {
                pump.abort();
            }
            if let Some(timer) = state.teardown.take() {
                timer.abort();
            }
        }
    }
}

/// Shares one live listener per cache key between any number of
/// subscribers.
///
/// Cloning is cheap and clones share all entries. Must be used from within
/// a Tokio runtime.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("entries", &self.inner.entries.len())
            .field("teardown", &self.inner.teardown)
            .finish()
    }
}

impl Multiplexer {
    pub fn new(states: Arc<StateStore>, config: &CacheConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                states,
                teardown: config.teardown,
                capacity: config.channel_capacity.max(1),
                listeners_opened: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribe to `key`, opening a listener with `create` if none is live.
    ///
    /// `create` runs at most once per live entry and never while an
    /// internal lock is held. Nothing is emitted until the returned
    /// subscription is polled.
    pub fn observe<F>(&self, key: CacheKey, create: F) -> Subscription
    where
        F: FnOnce() -> SnapshotStream,
    {
        let (entry, rx, replay, fresh) = match self.inner.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => match occupied.get().attach() {
                Some((rx, replay)) => (occupied.get().clone(), rx, replay, false),
                None => {
                    let entry = self.new_entry(&key);
                    let rx = entry.tx.subscribe();
                    occupied.insert(entry.clone());
                    (entry, rx, None, true)
                }
            },
            Entry::Vacant(vacant) => {
                let entry = self.new_entry(&key);
                let rx = entry.tx.subscribe();
                vacant.insert(entry.clone());
                (entry, rx, None, true)
            }
        };

        if fresh {
            let stream = create();
            self.inner.listeners_opened.fetch_add(1, Ordering::Relaxed);
            let task = tokio::spawn(pump(Arc::downgrade(&self.inner), entry.clone(), stream));
            let mut state = entry.lock();
            if state.closed {
                task.abort();
            } else {
                state.pump = Some(task.abort_handle());
            }
            debug!(key = %key, "opened live listener");
        } else {
            trace!(key = %key, refcount = self.refcount(key.as_str()), "joined live listener");
        }

        Subscription {
            key,
            replay,
            events: BroadcastStream::new(rx),
            attachment: Some(Attachment {
                inner: Arc::downgrade(&self.inner),
                entry,
            }),
            done: false,
        }
    }

    fn new_entry(&self, key: &CacheKey) -> Arc<LiveEntry> {
        let entry = LiveEntry::new(key.clone(), self.inner.capacity);
        entry.lock().refcount = 1;
        entry
    }

    /// Drop the live entry for `key` from the map.
    ///
    /// Subscribers already attached keep receiving from the old listener
    /// until they detach; the next `observe` opens a new one. Returns
    /// whether an entry was present.
    pub fn remove(&self, key: &str) -> bool {
        match self.inner.entries.remove(key) {
            Some((key, entry)) => {
                let mut state = entry.lock();
                state.orphaned = true;
                if state.refcount == 0 {
                    state.closed = true;
                    if let Some(pump) = state.pump.take() {
                        pump.abort();
                    }
                    if let Some(timer) = state.teardown.take() {
                        timer.abort();
                    }
                }
                debug!(key = %key, refcount = state.refcount, "live entry invalidated");
                true
            }
            None => false,
        }
    }

    /// Drop every live entry. See [`remove`](Self::remove).
    pub fn clear(&self) {
        for key in self.live_keys() {
            self.remove(key.as_str());
        }
    }

    /// Number of subscribers attached to the live entry for `key`.
    pub fn refcount(&self, key: &str) -> usize {
        self.inner
            .entries
            .get(key)
            .map(|e| e.value().lock().refcount)
            .unwrap_or(0)
    }

    /// Whether an open listener exists for `key`.
    pub fn is_live(&self, key: &str) -> bool {
        self.inner
            .entries
            .get(key)
            .is_some_and(|e| !e.value().lock().closed)
    }

    pub fn live_keys(&self) -> Vec<CacheKey> {
        self.inner
            .entries
            .iter()
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Total number of listeners opened over the multiplexer's lifetime.
    pub fn listeners_opened(&self) -> u64 {
        self.inner.listeners_opened.load(Ordering::Relaxed)
    }

    pub fn states(&self) -> &Arc<StateStore> {
        &self.inner.states
    }
}

/// Forward the listener into the entry until it ends, fails, or the task
/// is aborted by teardown.
async fn pump(inner: Weak<Inner>, entry: Arc<LiveEntry>, mut stream: SnapshotStream) {
    while let Some(item) = stream.next().await {
        match item {
            Ok(snapshot) => {
                if entry.publish(snapshot.clone()) {
                    if let Some(inner) = inner.upgrade() {
                        inner.states.record(&entry.key, &snapshot);
                    }
                }
            }
            Err(error) => {
                warn!(key = %entry.key, error = %error, "live listener failed");
                entry.finish(Event::Error(error));
                if let Some(inner) = inner.upgrade() {
                    inner.forget(&entry);
                }
                return;
            }
        }
    }
    debug!(key = %entry.key, "live listener completed");
    entry.finish(Event::Complete);
    if let Some(inner) = inner.upgrade() {
        inner.forget(&entry);
    }
}

async fn teardown_after(inner: Weak<Inner>, entry: Arc<LiveEntry>, epoch: u64, delay: TeardownDelay) {
    match delay {
        TeardownDelay::After(duration) => tokio::time::sleep(duration).await,
        TeardownDelay::Immediate => tokio::task::yield_now().await,
        TeardownDelay::Never => return,
    }
    {
        let mut state = entry.lock();
        if state.refcount > 0 || state.closed || state.teardown_epoch != epoch {
            return;
        }
        state.closed = true;
        state.teardown = None;
        if let Some(pump) = state.pump.take() {
            pump.abort();
        }
    }
    if let Some(inner) = inner.upgrade() {
        inner.forget(&entry);
    }
    debug!(key = %entry.key, "live listener torn down");
}

/// A subscriber's hold on a live entry.
struct Attachment {
    inner: Weak<Inner>,
    entry: Arc<LiveEntry>,
}

impl Attachment {
    fn release(self) {
        // Upgraded before locking so the guard is dropped first.
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let entry = self.entry;
        let mut state = entry.lock();
        state.refcount = state.refcount.saturating_sub(1);
        if state.refcount > 0 || state.closed {
            return;
        }
        let delay = inner.teardown;
        if delay == TeardownDelay::Never && !state.orphaned {
            trace!(key = %entry.key, "entry kept open");
            return;
        }

        state.teardown_epoch += 1;
        let epoch = state.teardown_epoch;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                // Orphaned entries have no map slot to be reused from.
                let delay = if state.orphaned {
                    TeardownDelay::Immediate
                } else {
                    delay
                };
                trace!(key = %entry.key, %delay, "teardown scheduled");
                state.teardown = Some(runtime.spawn(teardown_after(
                    Arc::downgrade(&inner),
                    entry.clone(),
                    epoch,
                    delay,
                )));
            }
            Err(_) => {
                state.closed = true;
                if let Some(pump) = state.pump.take() {
                    pump.abort();
                }
                drop(state);
                inner.forget(&entry);
                debug!(key = %entry.key, "live listener closed outside runtime");
            }
        }
    }
}

/// One subscriber's view of a live entry.
///
/// Yields the replayed value first (if the entry already had one), then
/// every value the shared listener produces. A listener failure, or falling
/// further behind than the channel capacity, is yielded once as an error
/// and ends the stream. Dropping the subscription detaches
/// it.
pub struct Subscription {
    key: CacheKey,
    replay: Option<Snapshot>,
    events: BroadcastStream<Event>,
    attachment: Option<Attachment>,
    done: bool,
}

impl Subscription {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Whether the first item will be the entry's cached latest value.
    pub fn has_replay(&self) -> bool {
        self.replay.is_some()
    }

    /// Stop receiving and release this subscriber's hold on the entry.
    ///
    /// Calling it more than once has no further effect.
    pub fn detach(&mut self) {
        self.done = true;
        self.replay = None;
        if let Some(attachment) = self.attachment.take() {
            attachment.release();
        }
    }
}

impl Stream for Subscription {
    type Item = Result<Snapshot, CacheError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.done {
            return Poll::Ready(None);
        }
        if let Some(value) = this.replay.take() {
            return Poll::Ready(Some(Ok(value)));
        }
        loop {
            match ready!(this.events.poll_next_unpin(cx)) {
                Some(Ok(Event::Value(snapshot))) => return Poll::Ready(Some(Ok(snapshot))),
                Some(Ok(Event::Error(source))) => {
                    let key = this.key.clone();
                    this.detach();
                    return Poll::Ready(Some(Err(CacheError::Listen { key, source })));
                }
                Some(Ok(Event::Complete)) | None => {
                    this.detach();
                    return Poll::Ready(None);
                }
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    warn!(key = %this.key, skipped, "subscriber lagged; ending its stream");
                    let key = this.key.clone();
                    this.detach();
                    return Poll::Ready(Some(Err(CacheError::Lagged { key, skipped })));
                }
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("has_replay", &self.replay.is_some())
            .field("done", &self.done)
            .finish()
    }
}
