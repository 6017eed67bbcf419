//! Server-side dereferencing of document references.
//!
//! An expand path such as `plane` or `crew.captain` names a field holding a
//! path string, or an array of them. Each path is read from the store and
//! the field is replaced in place: a document path becomes the document
//! object (or `null`), a collection path becomes an array of documents.
//!
//! Only strings with at least two segments count as paths, so plain text
//! such as a name is never read as a top-level collection.

use hearth_cache::{RemoteStore, StoreError};
use hearth_core::Handle;
use hearth_core::path::{is_doc_path, is_path_ref};
use serde_json::{Map, Value};
use tracing::trace;

use crate::WireSnapshot;

/// Expand every `expands` path in every document of `snapshot`.
pub async fn expand_snapshot<S>(
    store: &S,
    snapshot: &mut WireSnapshot,
    expands: &[String],
) -> Result<(), StoreError>
where
    S: RemoteStore + ?Sized,
{
    if expands.is_empty() {
        return Ok(());
    }
    for document in snapshot.documents_mut() {
        for field in expands {
            expand_field(store, &mut document.data, field).await?;
        }
    }
    Ok(())
}

async fn expand_field<S>(store: &S, data: &mut Map<String, Value>, field: &str) -> Result<(), StoreError>
where
    S: RemoteStore + ?Sized,
{
    let mut segments = field.split('.').peekable();
    let mut parent = data;
    while let Some(segment) = segments.next() {
        let Some(child) = parent.get_mut(segment) else {
            return Ok(());
        };
        match child {
            Value::String(path) => {
                let path = path.clone();
                *child = fetch(store, &path).await?;
                return Ok(());
            }
            Value::Array(items) => {
                for item in items.iter_mut() {
                    if let Value::String(path) = item {
                        let path = path.clone();
                        *item = fetch(store, &path).await?;
                    }
                }
                return Ok(());
            }
            Value::Object(map) if segments.peek().is_some() => parent = map,
            _ => return Ok(()),
        }
    }
    Ok(())
}

/// Read `path` as a document or a collection. Strings that are not valid
/// paths are left as they are.
async fn fetch<S>(store: &S, path: &str) -> Result<Value, StoreError>
where
    S: RemoteStore + ?Sized,
{
    if !is_path_ref(path) {
        trace!(path = %path, "not expanding non-path value");
        return Ok(Value::String(path.to_string()));
    }
    let handle = if is_doc_path(path) {
        Handle::document(path)
    } else {
        Handle::collection(path)
    };
    let handle = match handle {
        Ok(handle) => handle,
        Err(e) => {
            trace!(path = %path, error = %e, "not expanding non-path value");
            return Ok(Value::String(path.to_string()));
        }
    };
    let snapshot = store.get(&handle).await?;
    Ok(WireSnapshot::from(&snapshot).into_json())
}
