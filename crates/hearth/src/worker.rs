//! The `worker` subcommand.

use std::path::Path;
use std::sync::Arc;

use hearth_bridge::WorkerHost;
use hearth_cache::MemoryStore;
use miette::Result;
use tracing::info;

/// Serve a seeded in-memory store on stdin/stdout until stdin closes.
pub async fn run(seed: Option<&Path>) -> Result<()> {
    let store = load_store(seed).await?;
    info!(documents = store.len(), "worker store ready");

    let host = WorkerHost::new(Arc::new(store));
    host.serve(tokio::io::stdin(), tokio::io::stdout())
        .await
        .map_err(|e| miette::miette!("worker failed: {}", e))
}

pub async fn load_store(seed: Option<&Path>) -> Result<MemoryStore> {
    let Some(path) = seed else {
        return Ok(MemoryStore::new());
    };
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| miette::miette!("failed to read seed {}: {}", path.display(), e))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|e| miette::miette!("seed {} is not JSON: {}", path.display(), e))?;
    MemoryStore::from_json(value).map_err(|e| miette::miette!("invalid seed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use hearth_cache::RemoteStore;
    use hearth_core::{FieldValue, Handle};

    #[tokio::test]
    async fn test_load_store_from_seed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "flights/a": {{ "number": 1 }}, "flights/b": {{ "number": 2 }} }}"#
        )
        .unwrap();

        let store = load_store(Some(file.path())).await.unwrap();
        assert_eq!(store.len(), 2);
        let snapshot = store.get(&Handle::document("flights/b").unwrap()).await.unwrap();
        let doc = snapshot.iter_documents().next().unwrap();
        assert_eq!(doc.get("number"), Some(&FieldValue::Integer(2)));
    }

    #[tokio::test]
    async fn test_load_store_rejects_collection_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "flights": {{ "number": 1 }} }}"#).unwrap();
        assert!(load_store(Some(file.path())).await.is_err());
    }

    #[tokio::test]
    async fn test_no_seed_is_empty_store() {
        assert!(load_store(None).await.unwrap().is_empty());
    }
}
