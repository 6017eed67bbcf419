//! Live-query cache for Hearth.
//!
//! Many consumers watching the same data share one upstream listener. The
//! crate is split the same way the data flows:
//!
//! - **Multiplexer**: one live entry per [`CacheKey`], refcounted, with a
//!   delayed teardown and replay of the latest value to late subscribers
//! - **State store**: the last value seen per key, kept across teardowns
//! - **Transfer bridge**: values handed from a server render to the browser
//! - **Invalidator**: drops live entries and stored values by key, or by
//!   what a write touched
//! - **Service**: [`LiveCache`] wires the above over a [`RemoteStore`]
//! - **Memory store**: an in-process [`RemoteStore`] for tests and demos
//!
//! [`CacheKey`]: hearth_core::CacheKey

mod config;
mod error;
mod invalidator;
mod listener;
pub mod memory;
mod multiplexer;
mod service;
mod state;
mod transfer;

pub use config::{CacheConfig, ExecutionContext, QueryInvalidation, TeardownDelay};
pub use error::{CacheError, ListenError, StoreError};
pub use invalidator::Invalidator;
pub use listener::{Listener, RemoteStore, SnapshotStream, WriteOp, WriteReceipt};
pub use memory::MemoryStore;
pub use multiplexer::{Multiplexer, Subscription};
pub use service::{LiveCache, LiveStream};
pub use state::{StateEntry, StateStore};
pub use transfer::TransferBridge;
