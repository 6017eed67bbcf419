//! Core data model for Hearth's live-query cache.
//!
//! This crate has no async code. It provides:
//!
//! - **Values**: typed field values, documents and full-state snapshots
//! - **Paths**: `:param` path templates and document/collection parity checks
//! - **Handles**: immutable document, collection and query handles
//! - **Selectors**: one tagged input resolved once into handles
//! - **Canonical keys**: a deterministic [`CacheKey`] per handle equivalence class

mod canon;
mod constraint;
mod error;
mod handle;
pub mod path;
mod selector;
mod value;

pub use canon::{CacheKey, canonical_value, key_of};
pub use constraint::{
    Bound, Constraint, Direction, Filter, FilterOp, Limit, LimitKind, OrderBy, end_at, end_before,
    limit, limit_to_last, order_by, start_after, start_at, where_,
};
pub use error::BuildError;
pub use handle::{Handle, Query};
pub use path::Params;
pub use selector::{CollectionRef, Selector, Target};
pub use value::{Document, FieldValue, Snapshot};
