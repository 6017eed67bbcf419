//! Document values and full-state snapshots.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::path;

/// A typed field value stored in a document.
///
/// Values keep their type so that `1`, `1.0` and `"1"` stay distinct
/// when canonicalized or compared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum FieldValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Timestamp(DateTime<Utc>),
    String(String),
    Bytes(Vec<u8>),
    /// Path of another document or collection.
    Reference(String),
    GeoPoint { latitude: f64, longitude: f64 },
    Array(Vec<FieldValue>),
    Map(BTreeMap<String, FieldValue>),
}

impl FieldValue {
    /// Rank of the value's type in the cross-type sort order.
    ///
    /// Integers and doubles share a rank so they compare numerically.
    fn type_rank(&self) -> u8 {
        match self {
            FieldValue::Null => 0,
            FieldValue::Boolean(_) => 1,
            FieldValue::Integer(_) | FieldValue::Double(_) => 2,
            FieldValue::Timestamp(_) => 3,
            FieldValue::String(_) => 4,
            FieldValue::Bytes(_) => 5,
            FieldValue::Reference(_) => 6,
            FieldValue::GeoPoint { .. } => 7,
            FieldValue::Array(_) => 8,
            FieldValue::Map(_) => 9,
        }
    }

    /// Total order over values, used for query ordering and cursors.
    pub fn total_cmp(&self, other: &FieldValue) -> Ordering {
        use FieldValue::*;

        match (self, other) {
            (Boolean(a), Boolean(b)) => a.cmp(b),
            (Integer(a), Integer(b)) => a.cmp(b),
            (Integer(a), Double(b)) => (*a as f64).total_cmp(b),
            (Double(a), Integer(b)) => a.total_cmp(&(*b as f64)),
            (Double(a), Double(b)) => a.total_cmp(b),
            (Timestamp(a), Timestamp(b)) => a.cmp(b),
            (String(a), String(b)) => a.cmp(b),
            (Bytes(a), Bytes(b)) => a.cmp(b),
            (Reference(a), Reference(b)) => a.cmp(b),
            (
                GeoPoint {
                    latitude: la,
                    longitude: lo,
                },
                GeoPoint {
                    latitude: lb,
                    longitude: lob,
                },
            ) => la.total_cmp(lb).then(lo.total_cmp(lob)),
            (Array(a), Array(b)) => {
                for (x, y) in a.iter().zip(b) {
                    let ord = x.total_cmp(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Map(a), Map(b)) => {
                for ((ka, va), (kb, vb)) in a.iter().zip(b) {
                    let ord = ka.cmp(kb).then_with(|| va.total_cmp(vb));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }

    /// Whether two values are equal under query semantics (`1 == 1.0`).
    pub fn query_eq(&self, other: &FieldValue) -> bool {
        self.type_rank() == other.type_rank() && self.total_cmp(other) == Ordering::Equal
    }

    /// Ordering for range filters; `None` when the values are of
    /// incomparable types.
    pub fn query_cmp(&self, other: &FieldValue) -> Option<Ordering> {
        (self.type_rank() == other.type_rank()).then(|| self.total_cmp(other))
    }

    /// Convert plain JSON into a field value.
    ///
    /// Whole numbers become integers; strings stay strings (references and
    /// timestamps are not recovered from JSON).
    pub fn from_json(value: serde_json::Value) -> FieldValue {
        match value {
            serde_json::Value::Null => FieldValue::Null,
            serde_json::Value::Bool(b) => FieldValue::Boolean(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => FieldValue::Integer(i),
                None => FieldValue::Double(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => FieldValue::String(s),
            serde_json::Value::Array(items) => {
                FieldValue::Array(items.into_iter().map(FieldValue::from_json).collect())
            }
            serde_json::Value::Object(map) => FieldValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, FieldValue::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert into plain JSON.
    ///
    /// References become their path string and timestamps RFC 3339 strings,
    /// so the result carries no live object references.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FieldValue::Null => serde_json::Value::Null,
            FieldValue::Boolean(b) => serde_json::Value::Bool(*b),
            FieldValue::Integer(i) => serde_json::Value::from(*i),
            FieldValue::Double(d) => serde_json::Number::from_f64(*d)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            FieldValue::Timestamp(t) => serde_json::Value::String(t.to_rfc3339()),
            FieldValue::String(s) => serde_json::Value::String(s.clone()),
            FieldValue::Bytes(bytes) => {
                serde_json::Value::Array(bytes.iter().map(|b| serde_json::Value::from(*b)).collect())
            }
            FieldValue::Reference(path) => serde_json::Value::String(path.clone()),
            FieldValue::GeoPoint {
                latitude,
                longitude,
            } => serde_json::json!({ "latitude": latitude, "longitude": longitude }),
            FieldValue::Array(items) => {
                serde_json::Value::Array(items.iter().map(FieldValue::to_json).collect())
            }
            FieldValue::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Boolean(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Integer(v as i64)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Double(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::String(v)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(v: DateTime<Utc>) -> Self {
        FieldValue::Timestamp(v)
    }
}

impl<T: Into<FieldValue>> From<Vec<T>> for FieldValue {
    fn from(v: Vec<T>) -> Self {
        FieldValue::Array(v.into_iter().map(Into::into).collect())
    }
}

/// A stored document: its full path and its fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub path: String,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
}

impl Document {
    /// Create an empty document at `path`.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    /// Document id (last path segment).
    pub fn id(&self) -> &str {
        path::doc_id(&self.path)
    }

    /// Path of the collection containing this document.
    pub fn collection_path(&self) -> &str {
        path::parent(&self.path)
    }

    /// Look up a field by dotted path (`address.city`).
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        let mut segments = field.split('.');
        let mut current = self.fields.get(segments.next()?)?;
        for segment in segments {
            match current {
                FieldValue::Map(map) => current = map.get(segment)?,
                _ => return None,
            }
        }
        Some(current)
    }
}

/// Full state delivered by a listener for one handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Snapshot {
    /// A document, or `None` when it does not exist.
    Document { document: Option<Document> },
    /// The ordered documents of a collection or query.
    Documents { documents: Vec<Document> },
}

impl Snapshot {
    pub fn document(document: Option<Document>) -> Self {
        Snapshot::Document { document }
    }

    pub fn documents(documents: Vec<Document>) -> Self {
        Snapshot::Documents { documents }
    }

    /// Documents carried by this snapshot, in order.
    pub fn iter_documents(&self) -> impl Iterator<Item = &Document> {
        let slice: &[Document] = match self {
            Snapshot::Document { document } => document.as_slice(),
            Snapshot::Documents { documents } => documents.as_slice(),
        };
        slice.iter()
    }

    /// Whether this is a list result (collection or query).
    pub fn is_list(&self) -> bool {
        matches!(self, Snapshot::Documents { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numbers_compare_across_types() {
        assert_eq!(
            FieldValue::Integer(2).total_cmp(&FieldValue::Double(1.5)),
            Ordering::Greater
        );
        assert!(FieldValue::Integer(1).query_eq(&FieldValue::Double(1.0)));
        assert!(!FieldValue::Integer(1).query_eq(&FieldValue::String("1".into())));
    }

    #[test]
    fn test_cross_type_order() {
        let mut values = vec![
            FieldValue::String("a".into()),
            FieldValue::Null,
            FieldValue::Integer(3),
            FieldValue::Boolean(true),
        ];
        values.sort_by(|a, b| a.total_cmp(b));
        assert_eq!(
            values,
            vec![
                FieldValue::Null,
                FieldValue::Boolean(true),
                FieldValue::Integer(3),
                FieldValue::String("a".into()),
            ]
        );
    }

    #[test]
    fn test_dotted_field_lookup() {
        let address = FieldValue::Map(BTreeMap::from([(
            "city".to_string(),
            FieldValue::from("Paris"),
        )]));
        let doc = Document::new("users/u1").with("address", address);
        assert_eq!(doc.get("address.city"), Some(&FieldValue::from("Paris")));
        assert_eq!(doc.get("address.zip"), None);
        assert_eq!(doc.get("name"), None);
        assert_eq!(doc.id(), "u1");
        assert_eq!(doc.collection_path(), "users");
    }

    #[test]
    fn test_json_conversion_flattens_references() {
        let value = FieldValue::Map(BTreeMap::from([
            ("owner".to_string(), FieldValue::Reference("users/u1".into())),
            ("count".to_string(), FieldValue::Integer(3)),
        ]));
        assert_eq!(
            value.to_json(),
            serde_json::json!({ "owner": "users/u1", "count": 3 })
        );
    }

    #[test]
    fn test_json_whole_numbers_become_integers() {
        assert_eq!(
            FieldValue::from_json(serde_json::json!(10)),
            FieldValue::Integer(10)
        );
        assert_eq!(
            FieldValue::from_json(serde_json::json!(1.5)),
            FieldValue::Double(1.5)
        );
    }

    #[test]
    fn test_snapshot_serde_shape() {
        let snap = Snapshot::document(None);
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json, serde_json::json!({ "kind": "document", "document": null }));
        let back: Snapshot = serde_json::from_value(json).unwrap();
        assert_eq!(back, snap);
    }
}
