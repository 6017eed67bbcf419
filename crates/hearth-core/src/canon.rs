//! Canonical cache keys.
//!
//! Two handles share a key exactly when they describe the same data. The
//! key is a plain string so it can also name entries in the hydration map.

use std::borrow::Borrow;
use std::fmt::{self, Write};

use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};

use crate::{Bound, FieldValue, Handle, LimitKind, Query};

/// Canonical identity of a handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this key names a query rather than a single path.
    pub fn is_query(&self) -> bool {
        self.0.contains('|')
    }

    /// The path portion of the key: the whole key for documents and
    /// collections, the queried collection path for queries.
    pub fn root_path(&self) -> &str {
        self.0.split('|').next().unwrap_or(&self.0)
    }

    /// Collection id of a collection-group query key.
    pub fn collection_group(&self) -> Option<&str> {
        self.0
            .split('|')
            .find_map(|section| section.strip_prefix("cg:"))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for CacheKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

/// Compute the canonical key of a handle.
///
/// # Example
///
/// ```
/// use hearth_core::{FilterOp, Handle, key_of, limit, where_};
///
/// let handle = Handle::query("flights", vec![where_("number", FilterOp::LessThan, 10), limit(3)])
///     .unwrap();
/// assert_eq!(key_of(&handle).as_str(), "flights|f:[number < i:10]|l:3");
/// ```
pub fn key_of(handle: &Handle) -> CacheKey {
    match handle {
        Handle::Document { path } | Handle::Collection { path } => CacheKey(path.clone()),
        Handle::Query(query) => CacheKey(query_key(query)),
    }
}

fn query_key(query: &Query) -> String {
    let mut key = query.path().to_string();

    if let Some(group) = query.collection_group() {
        let _ = write!(key, "|cg:{group}");
    }

    if !query.filters().is_empty() {
        let filters: Vec<String> = query
            .filters()
            .iter()
            .map(|f| {
                let mut out = String::new();
                push_name(&mut out, &f.field, &[]);
                let _ = write!(out, " {} {}", f.op, canonical_value(&f.value));
                out
            })
            .collect();
        let _ = write!(key, "|f:[{}]", filters.join(", "));
    }

    if let Some(limit) = query.limit() {
        let _ = write!(key, "|l:{}", limit.count);
    }

    if !query.order_by().is_empty() {
        let orders: Vec<String> = query
            .order_by()
            .iter()
            .map(|o| {
                let mut out = String::new();
                push_name(&mut out, &o.field, &[]);
                let _ = write!(out, " ({})", o.direction);
                out
            })
            .collect();
        let _ = write!(key, "|ob:[{}]", orders.join(", "));
    }

    if let Some(start) = query.start() {
        let side = if start.inclusive { "b" } else { "a" };
        let _ = write!(key, "|lb:{side}:{}", canonical_bound(start));
    }

    if let Some(end) = query.end() {
        let side = if end.inclusive { "a" } else { "b" };
        let _ = write!(key, "|ub:{side}:{}", canonical_bound(end));
    }

    if matches!(query.limit(), Some(limit) if limit.kind == LimitKind::Last) {
        key.push_str("|lt:L");
    }

    key
}

fn canonical_bound(bound: &Bound) -> String {
    canonical_value(&FieldValue::Array(bound.values.clone()))
}

/// Write `name` bare when it only holds identifier characters (or one of
/// `extra`), and as a JSON string otherwise.
///
/// A bare name never contains a quote, a separator, or whitespace, so it
/// cannot be mistaken for a quoted one or run into the next part of a key.
fn push_name(out: &mut String, name: &str, extra: &[char]) {
    let bare = !name.is_empty()
        && name.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') || extra.contains(&c)
        });
    if bare {
        out.push_str(name);
    } else {
        let _ = write!(out, "{}", serde_json::Value::String(name.to_string()));
    }
}

/// Type-tagged canonical rendering of a field value.
///
/// `1`, `1.0` and `"1"` render as `i:1`, `d:1` and `s:"1"`. Map entries are
/// rendered in sorted key order.
pub fn canonical_value(value: &FieldValue) -> String {
    let mut out = String::new();
    render(value, &mut out);
    out
}

fn render(value: &FieldValue, out: &mut String) {
    match value {
        FieldValue::Null => out.push_str("null"),
        FieldValue::Boolean(b) => {
            let _ = write!(out, "b:{b}");
        }
        FieldValue::Integer(i) => {
            let _ = write!(out, "i:{i}");
        }
        FieldValue::Double(d) => {
            let _ = write!(out, "d:{d}");
        }
        FieldValue::Timestamp(t) => {
            let _ = write!(out, "t:{}", t.to_rfc3339_opts(SecondsFormat::Nanos, true));
        }
        FieldValue::String(s) => {
            let _ = write!(out, "s:{}", serde_json::Value::String(s.clone()));
        }
        FieldValue::Bytes(bytes) => {
            out.push_str("x:");
            for byte in bytes {
                let _ = write!(out, "{byte:02x}");
            }
        }
        FieldValue::Reference(path) => {
            out.push_str("r:");
            push_name(out, path, &['/']);
        }
        FieldValue::GeoPoint {
            latitude,
            longitude,
        } => {
            let _ = write!(out, "geo({latitude},{longitude})");
        }
        FieldValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                render(item, out);
            }
            out.push(']');
        }
        FieldValue::Map(map) => {
            out.push('{');
            for (i, (k, v)) in map.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                push_name(out, k, &[]);
                out.push(':');
                render(v, out);
            }
            out.push('}');
        }
    }
}
