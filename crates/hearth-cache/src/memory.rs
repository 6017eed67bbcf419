//! In-process document store.
//!
//! Holds documents in a sorted map and re-evaluates every open listener on
//! each commit. Listeners only emit when their result actually changed.
//! Used by tests, the demo, and the bridge worker.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use futures_util::stream;
use hearth_core::path::{assert_document, assert_path, doc_id, parent};
use hearth_core::{
    Bound, Direction, Document, FieldValue, Filter, FilterOp, Handle, LimitKind, OrderBy, Query,
    Snapshot,
};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::{ListenError, Listener, RemoteStore, SnapshotStream, StoreError, WriteOp, WriteReceipt};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
enum Change {
    Commit,
    /// Fail open listeners whose handle path is `path`.
    Fail { path: String, error: ListenError },
}

struct MemoryInner {
    documents: RwLock<BTreeMap<String, Document>>,
    changes: broadcast::Sender<Change>,
    /// Paths whose listeners and reads are refused.
    denied: DashMap<String, ListenError>,
    listens: AtomicUsize,
}

impl MemoryInner {
    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Document>> {
        self.documents.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Document>> {
        self.documents.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, change: Change) {
        if self.changes.send(change).is_err() {
            trace!("no open listeners for store change");
        }
    }
}

/// A [`RemoteStore`] over an in-memory map of documents.
///
/// Cloning is cheap; clones share documents and listeners.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("documents", &self.inner.read().len())
            .finish()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(MemoryInner {
                documents: RwLock::new(BTreeMap::new()),
                changes,
                denied: DashMap::new(),
                listens: AtomicUsize::new(0),
            }),
        }
    }

    pub fn with_documents(documents: impl IntoIterator<Item = Document>) -> Self {
        let store = Self::new();
        {
            let mut docs = store.inner.write();
            for doc in documents {
                docs.insert(doc.path.clone(), doc);
            }
        }
        store
    }

    /// Build a store from a JSON object of `path -> fields`.
    ///
    /// Field values are plain JSON (see [`FieldValue::from_json`]).
    pub fn from_json(value: serde_json::Value) -> Result<Self, StoreError> {
        let serde_json::Value::Object(entries) = value else {
            return Err(StoreError::InvalidArgument(
                "seed must be a JSON object of document paths".into(),
            ));
        };
        let mut documents = Vec::with_capacity(entries.len());
        for (path, fields) in entries {
            if !is_valid_doc_path(&path) {
                return Err(StoreError::InvalidArgument(format!(
                    "not a document path: {path}"
                )));
            }
            let FieldValue::Map(fields) = FieldValue::from_json(fields) else {
                return Err(StoreError::InvalidArgument(format!(
                    "fields of {path} must be an object"
                )));
            };
            documents.push(Document { path, fields });
        }
        Ok(Self::with_documents(documents))
    }

    /// Insert or replace a document and notify listeners.
    pub fn insert(&self, document: Document) {
        self.inner.write().insert(document.path.clone(), document);
        self.inner.notify(Change::Commit);
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Number of listeners opened so far.
    pub fn listen_count(&self) -> usize {
        self.inner.listens.load(AtomicOrdering::SeqCst)
    }

    /// Refuse future listeners and reads on `path` with `error`.
    pub fn deny(&self, path: impl Into<String>, error: ListenError) {
        self.inner.denied.insert(path.into(), error);
    }

    pub fn allow(&self, path: &str) {
        self.inner.denied.remove(path);
    }

    /// Fail every open listener whose handle path is `path`.
    pub fn fail(&self, path: impl Into<String>, error: ListenError) {
        self.inner.notify(Change::Fail {
            path: path.into(),
            error,
        });
    }

    /// Evaluate `handle` against the current documents.
    pub fn evaluate(&self, handle: &Handle) -> Snapshot {
        evaluate(&self.inner.read(), handle)
    }

    fn denied(&self, handle: &Handle) -> Option<ListenError> {
        self.inner
            .denied
            .get(handle.path())
            .map(|e| e.value().clone())
    }
}

impl Listener for MemoryStore {
    fn listen(&self, handle: &Handle) -> SnapshotStream {
        self.inner.listens.fetch_add(1, AtomicOrdering::SeqCst);
        if let Some(error) = self.denied(handle) {
            debug!(path = %handle.path(), "listener denied");
            return stream::once(async move { Err::<Snapshot, _>(error) }).boxed();
        }

        struct ListenState {
            inner: Arc<MemoryInner>,
            handle: Handle,
            changes: broadcast::Receiver<Change>,
            last: Option<Snapshot>,
            done: bool,
        }

        // Subscribe before the first evaluation so no commit is missed.
        let state = ListenState {
            changes: self.inner.changes.subscribe(),
            inner: self.inner.clone(),
            handle: handle.clone(),
            last: None,
            done: false,
        };

        stream::unfold(state, |mut state| async move {
            if state.done {
                return None;
            }
            if state.last.is_none() {
                // Never emit synchronously.
                tokio::task::yield_now().await;
            }
            loop {
                if state.last.is_some() {
                    match state.changes.recv().await {
                        Ok(Change::Commit) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Ok(Change::Fail { path, error }) => {
                            if path == state.handle.path() {
                                state.done = true;
                                return Some((Err(error), state));
                            }
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
                let snapshot = evaluate(&state.inner.read(), &state.handle);
                if state.last.as_ref() != Some(&snapshot) {
                    state.last = Some(snapshot.clone());
                    return Some((Ok(snapshot), state));
                }
            }
        })
        .boxed()
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn get(&self, handle: &Handle) -> Result<Snapshot, StoreError> {
        if let Some(error) = self.denied(handle) {
            return Err(StoreError::PermissionDenied(error.to_string()));
        }
        Ok(self.evaluate(handle))
    }

    async fn commit(&self, writes: Vec<WriteOp>) -> Result<WriteReceipt, StoreError> {
        let written = {
            let mut docs = self.inner.write();
            for write in &writes {
                let path = write.path();
                if !is_valid_doc_path(path) {
                    return Err(StoreError::InvalidArgument(format!(
                        "not a document path: {path}"
                    )));
                }
                if matches!(write, WriteOp::Update { .. })
                    && !docs.contains_key(path)
                    && !writes_set_before(&writes, write)
                {
                    return Err(StoreError::NotFound(path.to_string()));
                }
            }

            let mut written = Vec::with_capacity(writes.len());
            for write in writes {
                written.push(write.path().to_string());
                match write {
                    WriteOp::Set { path, fields } => {
                        docs.insert(path.clone(), Document { path, fields });
                    }
                    WriteOp::Update { path, fields } => {
                        let doc = docs
                            .entry(path.clone())
                            .or_insert_with(|| Document::new(path));
                        doc.fields.extend(fields);
                    }
                    WriteOp::Delete { path } => {
                        docs.remove(&path);
                    }
                }
            }
            written
        };
        debug!(count = written.len(), "committed writes");
        self.inner.notify(Change::Commit);
        Ok(WriteReceipt { written })
    }
}

/// Whether a `Set` for the same path precedes `write` in the batch.
fn is_valid_doc_path(path: &str) -> bool {
    assert_path(path).and_then(|()| assert_document(path)).is_ok()
}

fn writes_set_before(writes: &[WriteOp], write: &WriteOp) -> bool {
    writes
        .iter()
        .take_while(|w| !std::ptr::eq(*w, write))
        .any(|w| matches!(w, WriteOp::Set { path, .. } if path == write.path()))
}

fn evaluate(docs: &BTreeMap<String, Document>, handle: &Handle) -> Snapshot {
    match handle {
        Handle::Document { path } => Snapshot::document(docs.get(path).cloned()),
        Handle::Collection { path } => Snapshot::documents(
            docs.values()
                .filter(|d| d.collection_path() == path)
                .cloned()
                .collect(),
        ),
        Handle::Query(query) => Snapshot::documents(run_query(docs, query)),
    }
}

fn run_query(docs: &BTreeMap<String, Document>, query: &Query) -> Vec<Document> {
    let mut matched: Vec<&Document> = docs
        .values()
        .filter(|d| in_scope(query, d))
        .filter(|d| query.filters().iter().all(|f| matches_filter(d, f)))
        .filter(|d| query.order_by().iter().all(|o| d.get(&o.field).is_some()))
        .collect();

    matched.sort_by(|a, b| compare_docs(a, b, query.order_by()));

    if let Some(start) = query.start() {
        matched.retain(|d| {
            let ord = cmp_to_bound(d, start, query.order_by());
            ord == Ordering::Greater || (start.inclusive && ord == Ordering::Equal)
        });
    }
    if let Some(end) = query.end() {
        matched.retain(|d| {
            let ord = cmp_to_bound(d, end, query.order_by());
            ord == Ordering::Less || (end.inclusive && ord == Ordering::Equal)
        });
    }

    if let Some(limit) = query.limit() {
        let count = limit.count as usize;
        match limit.kind {
            LimitKind::First => matched.truncate(count),
            LimitKind::Last => {
                let skip = matched.len().saturating_sub(count);
                matched.drain(..skip);
            }
        }
    }

    matched.into_iter().cloned().collect()
}

fn in_scope(query: &Query, doc: &Document) -> bool {
    match query.collection_group() {
        Some(group) => doc_id(parent(&doc.path)) == group,
        None => doc.collection_path() == query.path(),
    }
}

fn matches_filter(doc: &Document, filter: &Filter) -> bool {
    let Some(value) = doc.get(&filter.field) else {
        return false;
    };
    let expected = &filter.value;
    let list = match expected {
        FieldValue::Array(items) => items.as_slice(),
        _ => &[],
    };
    match filter.op {
        FilterOp::Equal => value.query_eq(expected),
        FilterOp::NotEqual => !value.query_eq(expected) && *value != FieldValue::Null,
        FilterOp::LessThan => value.query_cmp(expected) == Some(Ordering::Less),
        FilterOp::LessThanOrEqual => {
            matches!(value.query_cmp(expected), Some(Ordering::Less | Ordering::Equal))
        }
        FilterOp::GreaterThan => value.query_cmp(expected) == Some(Ordering::Greater),
        FilterOp::GreaterThanOrEqual => {
            matches!(value.query_cmp(expected), Some(Ordering::Greater | Ordering::Equal))
        }
        FilterOp::ArrayContains => match value {
            FieldValue::Array(items) => items.iter().any(|i| i.query_eq(expected)),
            _ => false,
        },
        FilterOp::ArrayContainsAny => match value {
            FieldValue::Array(items) => items.iter().any(|i| list.iter().any(|e| i.query_eq(e))),
            _ => false,
        },
        FilterOp::In => list.iter().any(|e| value.query_eq(e)),
        FilterOp::NotIn => {
            *value != FieldValue::Null && !list.iter().any(|e| value.query_eq(e))
        }
    }
}

/// Order by the order-by fields, then by path in the direction of the last
/// order-by.
fn compare_docs(a: &Document, b: &Document, order_by: &[OrderBy]) -> Ordering {
    for order in order_by {
        let ord = match (a.get(&order.field), b.get(&order.field)) {
            (Some(x), Some(y)) => x.total_cmp(y),
            _ => Ordering::Equal,
        };
        let ord = directed(ord, order.direction);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    let tiebreak = order_by.last().map(|o| o.direction).unwrap_or_default();
    directed(a.path.cmp(&b.path), tiebreak)
}

/// Compare a document's order-by values to a cursor position, in result
/// order.
fn cmp_to_bound(doc: &Document, bound: &Bound, order_by: &[OrderBy]) -> Ordering {
    for (order, position) in order_by.iter().zip(&bound.values) {
        let ord = match doc.get(&order.field) {
            Some(value) => value.total_cmp(position),
            None => Ordering::Less,
        };
        let ord = directed(ord, order.direction);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn directed(ord: Ordering, direction: Direction) -> Ordering {
    match direction {
        Direction::Asc => ord,
        Direction::Desc => ord.reverse(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_core::{
        end_before, limit, limit_to_last, order_by, start_after, start_at, where_,
    };
    use pretty_assertions::assert_eq;

    fn flights() -> MemoryStore {
        MemoryStore::with_documents((1..=5).map(|n| {
            Document::new(format!("flights/f{n}"))
                .with("number", n)
                .with("tags", vec![if n % 2 == 0 { "even" } else { "odd" }])
        }))
    }

    fn numbers(snapshot: &Snapshot) -> Vec<i64> {
        snapshot
            .iter_documents()
            .filter_map(|d| match d.get("number") {
                Some(FieldValue::Integer(n)) => Some(*n),
                _ => None,
            })
            .collect()
    }

    fn query(constraints: Vec<hearth_core::Constraint>) -> Handle {
        Handle::query("flights", constraints).unwrap()
    }

    #[test]
    fn test_filter_and_limit() {
        let store = flights();
        let snap = store.evaluate(&query(vec![where_("number", FilterOp::LessThan, 10), limit(3)]));
        assert_eq!(numbers(&snap), vec![1, 2, 3]);
    }

    #[test]
    fn test_order_and_limit_to_last() {
        let store = flights();
        let snap = store.evaluate(&query(vec![
            order_by("number", Direction::Asc),
            limit_to_last(2),
        ]));
        assert_eq!(numbers(&snap), vec![4, 5]);

        let snap = store.evaluate(&query(vec![order_by("number", Direction::Desc), limit(2)]));
        assert_eq!(numbers(&snap), vec![5, 4]);
    }

    #[test]
    fn test_cursors() {
        let store = flights();
        let snap = store.evaluate(&query(vec![
            order_by("number", Direction::Asc),
            start_at(vec![FieldValue::from(2)]),
            end_before(vec![FieldValue::from(4)]),
        ]));
        assert_eq!(numbers(&snap), vec![2, 3]);

        let snap = store.evaluate(&query(vec![
            order_by("number", Direction::Asc),
            start_after(vec![FieldValue::from(2)]),
        ]));
        assert_eq!(numbers(&snap), vec![3, 4, 5]);
    }

    #[test]
    fn test_array_and_membership_filters() {
        let store = flights();
        let snap = store.evaluate(&query(vec![where_("tags", FilterOp::ArrayContains, "even")]));
        assert_eq!(numbers(&snap), vec![2, 4]);

        let snap = store.evaluate(&query(vec![where_(
            "number",
            FilterOp::In,
            vec![FieldValue::from(1), FieldValue::from(5)],
        )]));
        assert_eq!(numbers(&snap), vec![1, 5]);

        let snap = store.evaluate(&query(vec![where_(
            "number",
            FilterOp::NotIn,
            vec![FieldValue::from(1), FieldValue::from(5)],
        )]));
        assert_eq!(numbers(&snap), vec![2, 3, 4]);
    }

    #[test]
    fn test_range_filters_skip_other_types() {
        let store = flights();
        store.insert(Document::new("flights/s").with("number", "ten"));
        let snap = store.evaluate(&query(vec![where_("number", FilterOp::GreaterThan, 3)]));
        assert_eq!(numbers(&snap), vec![4, 5]);
    }

    #[test]
    fn test_collection_group() {
        let store = MemoryStore::with_documents([
            Document::new("airlines/a/flights/f1").with("n", 1),
            Document::new("airlines/b/flights/f2").with("n", 2),
            Document::new("airlines/a").with("n", 3),
        ]);
        let handle = Handle::collection_group("flights", vec![order_by("n", Direction::Asc)])
            .unwrap();
        assert_eq!(store.evaluate(&handle).iter_documents().count(), 2);
    }

    #[test]
    fn test_from_json_seed() {
        let store = MemoryStore::from_json(serde_json::json!({
            "flights/a": { "number": 1 },
            "flights/b": { "number": 2.5 }
        }))
        .unwrap();
        assert_eq!(store.len(), 2);
        assert!(MemoryStore::from_json(serde_json::json!({ "flights": {} })).is_err());
        assert!(MemoryStore::from_json(serde_json::json!([1])).is_err());
    }

    #[tokio::test]
    async fn test_commit_is_atomic() {
        let store = flights();
        let err = store
            .commit(vec![
                WriteOp::Delete {
                    path: "flights/f1".into(),
                },
                WriteOp::Update {
                    path: "flights/missing".into(),
                    fields: BTreeMap::new(),
                },
            ])
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::NotFound("flights/missing".into()));
        assert_eq!(store.len(), 5);
    }

    #[tokio::test]
    async fn test_commit_rejects_key_separator_in_path() {
        let store = flights();
        let err = store
            .commit(vec![WriteOp::Delete {
                path: "flights/f1|l:3".into(),
            }])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
        assert!(MemoryStore::from_json(serde_json::json!({ "flights/a|b": {} })).is_err());
        assert_eq!(store.len(), 5);
    }

    #[tokio::test]
    async fn test_update_after_set_in_same_batch() {
        let store = MemoryStore::new();
        let receipt = store
            .commit(vec![
                WriteOp::Set {
                    path: "flights/n".into(),
                    fields: BTreeMap::from([("a".to_string(), FieldValue::from(1))]),
                },
                WriteOp::Update {
                    path: "flights/n".into(),
                    fields: BTreeMap::from([("b".to_string(), FieldValue::from(2))]),
                },
            ])
            .await
            .unwrap();
        assert_eq!(receipt.written, vec!["flights/n", "flights/n"]);
        let Snapshot::Document { document: Some(doc) } =
            store.get(&Handle::document("flights/n").unwrap()).await.unwrap()
        else {
            panic!("expected document");
        };
        assert_eq!(doc.fields.len(), 2);
    }

    #[tokio::test]
    async fn test_listener_emits_only_on_change() {
        let store = flights();
        let mut stream = store.listen(&Handle::document("flights/f1").unwrap());
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(numbers(&first), vec![1]);

        // A write elsewhere does not produce an emission for this document.
        store.insert(Document::new("flights/f9").with("number", 9));
        store.insert(Document::new("flights/f1").with("number", 11));
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(numbers(&second), vec![11]);
        assert_eq!(store.listen_count(), 1);
    }

    #[tokio::test]
    async fn test_denied_and_failed_listeners() {
        let store = flights();
        store.deny("flights", ListenError::PermissionDenied("flights".into()));
        let mut denied = store.listen(&Handle::collection("flights").unwrap());
        assert!(matches!(
            denied.next().await,
            Some(Err(ListenError::PermissionDenied(_)))
        ));
        assert!(denied.next().await.is_none());
        assert!(store.get(&Handle::collection("flights").unwrap()).await.is_err());

        let mut live = store.listen(&Handle::document("flights/f2").unwrap());
        live.next().await.unwrap().unwrap();
        store.fail("flights/f2", ListenError::Unavailable("gone".into()));
        assert_eq!(
            live.next().await.unwrap(),
            Err(ListenError::Unavailable("gone".into()))
        );
        assert!(live.next().await.is_none());
    }
}
