//! The contract between the cache and a document store.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use hearth_core::{FieldValue, Handle, Snapshot};
use serde::{Deserialize, Serialize};

use crate::{ListenError, StoreError};

/// Full-state snapshots for one handle, in store order.
///
/// The stream ends after an error. Dropping it closes the underlying
/// listener.
pub type SnapshotStream = BoxStream<'static, Result<Snapshot, ListenError>>;

/// Opens live listeners.
pub trait Listener: Send + Sync + 'static {
    /// Start listening to `handle`.
    ///
    /// Must not emit synchronously; the first snapshot arrives on a later
    /// poll.
    fn listen(&self, handle: &Handle) -> SnapshotStream;
}

/// A store that can also be read once and written.
#[async_trait]
pub trait RemoteStore: Listener {
    async fn get(&self, handle: &Handle) -> Result<Snapshot, StoreError>;

    /// Apply `writes` atomically.
    async fn commit(&self, writes: Vec<WriteOp>) -> Result<WriteReceipt, StoreError>;
}

impl<T: Listener + ?Sized> Listener for Arc<T> {
    fn listen(&self, handle: &Handle) -> SnapshotStream {
        (**self).listen(handle)
    }
}

#[async_trait]
impl<T: RemoteStore + ?Sized> RemoteStore for Arc<T> {
    async fn get(&self, handle: &Handle) -> Result<Snapshot, StoreError> {
        (**self).get(handle).await
    }

    async fn commit(&self, writes: Vec<WriteOp>) -> Result<WriteReceipt, StoreError> {
        (**self).commit(writes).await
    }
}

/// A single document write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum WriteOp {
    /// Replace the document.
    Set {
        path: String,
        fields: BTreeMap<String, FieldValue>,
    },
    /// Merge top-level fields into an existing document.
    Update {
        path: String,
        fields: BTreeMap<String, FieldValue>,
    },
    Delete { path: String },
}

impl WriteOp {
    pub fn path(&self) -> &str {
        match self {
            WriteOp::Set { path, .. } | WriteOp::Update { path, .. } | WriteOp::Delete { path } => {
                path
            }
        }
    }
}

/// Document paths touched by a committed write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteReceipt {
    pub written: Vec<String>,
}
