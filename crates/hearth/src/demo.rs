//! The `demo` subcommand: one shared listener for many watchers.

use std::collections::BTreeMap;
use std::time::Duration;

use futures_util::StreamExt;
use hearth_cache::{CacheConfig, LiveCache, MemoryStore, TeardownDelay, WriteOp};
use hearth_core::{Document, FieldValue, FilterOp, Handle, Snapshot, limit, where_};
use miette::Result;
use tracing::info;

const WATCHERS: usize = 3;

fn flight(id: &str, number: i64) -> Document {
    Document::new(format!("flights/{id}")).with("number", number)
}

fn describe(snapshot: &Snapshot) -> String {
    let ids: Vec<&str> = snapshot.iter_documents().map(|d| d.id()).collect();
    format!("[{}]", ids.join(", "))
}

pub async fn run(config: CacheConfig) -> Result<()> {
    info!(teardown = %config.teardown, policy = ?config.query_invalidation, "starting demo");
    let teardown = config.teardown;

    let store = MemoryStore::with_documents([flight("a", 1), flight("b", 2), flight("c", 30)]);
    let cache = LiveCache::new(store.clone(), config);
    let handle = Handle::query(
        "flights",
        vec![where_("number", FilterOp::LessThan, 10), limit(3)],
    )
    .map_err(|e| miette::miette!("{}", e))?;
    let key = handle.key();
    println!("key: {}", key);

    let mut watchers: Vec<_> = (0..WATCHERS).map(|_| cache.watch(&handle)).collect();
    for (i, watcher) in watchers.iter_mut().enumerate() {
        let value = next_value(watcher).await?;
        println!("watcher {} sees {}", i, describe(&value));
    }
    println!(
        "{} watchers, {} store listener(s), refcount {}",
        WATCHERS,
        store.listen_count(),
        cache.multiplexer().refcount(key.as_str())
    );

    drop(watchers);
    println!(
        "all watchers detached; entry live: {}",
        cache.multiplexer().is_live(key.as_str())
    );
    match teardown {
        TeardownDelay::After(delay) => {
            tokio::time::sleep(delay + Duration::from_millis(50)).await;
            println!(
                "after {}: entry live: {}",
                teardown,
                cache.multiplexer().is_live(key.as_str())
            );
        }
        TeardownDelay::Immediate => {
            tokio::task::yield_now().await;
            println!("entry live: {}", cache.multiplexer().is_live(key.as_str()));
        }
        TeardownDelay::Never => println!("teardown is never; the listener stays open"),
    }
    if let Some(stored) = cache.states().get(key.as_str()) {
        println!("stored value: {}", describe(&stored));
    }

    let receipt = cache
        .commit(vec![WriteOp::Set {
            path: "flights/a".into(),
            fields: BTreeMap::from([("number".to_string(), FieldValue::from(5))]),
        }])
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    println!(
        "wrote {:?}; stored value present: {}",
        receipt.written,
        cache.states().get(key.as_str()).is_some()
    );

    let mut again = cache.watch(&handle);
    let value = next_value(&mut again).await?;
    println!(
        "fresh watcher sees {}; store listeners opened: {}",
        describe(&value),
        store.listen_count()
    );
    Ok(())
}

async fn next_value<S>(values: &mut S) -> Result<Snapshot>
where
    S: futures_util::Stream<Item = Result<Snapshot, hearth_cache::CacheError>> + Unpin,
{
    match values.next().await {
        Some(Ok(value)) => Ok(value),
        Some(Err(e)) => Err(miette::miette!("{}", e)),
        None => Err(miette::miette!("stream ended before a value")),
    }
}
