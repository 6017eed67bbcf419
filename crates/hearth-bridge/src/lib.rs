//! Cross-process bridge for Hearth.
//!
//! A [`WorkerHost`] runs a [`RemoteStore`](hearth_cache::RemoteStore) in one
//! process and serves it over any byte channel as line-delimited JSON. A
//! [`WorkerClient`] in another process speaks the same protocol and
//! implements the store traits itself, so the cache can sit on top of it
//! unchanged.

mod client;
mod error;
pub mod expand;
mod host;
pub mod protocol;

pub use client::WorkerClient;
pub use error::BridgeError;
pub use host::WorkerHost;
pub use protocol::{
    BridgeEvent, BridgeRequest, ConstraintParams, ErrorCode, QueryOptions, Target, WireDocument,
    WireError, WireSnapshot,
};
