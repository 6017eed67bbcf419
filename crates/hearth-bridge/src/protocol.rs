//! Wire types exchanged between a worker host and its client.
//!
//! Every message is one JSON object per line. Requests flow client to host
//! and events flow back. Nothing on the wire holds a live reference:
//! constraints travel as `{type, payload}` records and document references
//! travel as path strings.

use hearth_cache::{ListenError, StoreError, WriteOp};
use hearth_core::path::is_doc_path;
use hearth_core::{Constraint, Direction, Document, FieldValue, FilterOp, Handle, Snapshot};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::BridgeError;

/// A constraint as plain data.
///
/// | type | payload |
/// |---|---|
/// | `where` | `[field, op, value]` |
/// | `orderBy` | `[field]` or `[field, "asc" \| "desc"]` |
/// | `limit`, `limitToLast` | `[count]` |
/// | `startAt`, `startAfter`, `endAt`, `endBefore` | `[value, ...]` |
///
/// Values use the tagged [`FieldValue`] encoding so their types survive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintParams {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Vec<Value>,
}

impl ConstraintParams {
    pub fn new(kind: impl Into<String>, payload: Vec<Value>) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// Rebuild the native constraint.
    pub fn to_constraint(&self) -> Result<Constraint, BridgeError> {
        let payload = self.payload.as_slice();
        match self.kind.as_str() {
            "where" => match payload {
                [field, op, value] => Ok(Constraint::Where {
                    field: string_arg(field, "where field")?,
                    op: string_arg(op, "where op")?.parse::<FilterOp>()?,
                    value: field_value(value)?,
                }),
                _ => Err(arity("where", 3, payload.len())),
            },
            "orderBy" => match payload {
                [field] => Ok(Constraint::OrderBy {
                    field: string_arg(field, "orderBy field")?,
                    direction: Direction::default(),
                }),
                [field, direction] => Ok(Constraint::OrderBy {
                    field: string_arg(field, "orderBy field")?,
                    direction: string_arg(direction, "orderBy direction")?.parse::<Direction>()?,
                }),
                _ => Err(arity("orderBy", 2, payload.len())),
            },
            "limit" => Ok(Constraint::Limit {
                count: count_arg("limit", payload)?,
            }),
            "limitToLast" => Ok(Constraint::LimitToLast {
                count: count_arg("limitToLast", payload)?,
            }),
            "startAt" => Ok(Constraint::StartAt {
                values: field_values(payload)?,
            }),
            "startAfter" => Ok(Constraint::StartAfter {
                values: field_values(payload)?,
            }),
            "endAt" => Ok(Constraint::EndAt {
                values: field_values(payload)?,
            }),
            "endBefore" => Ok(Constraint::EndBefore {
                values: field_values(payload)?,
            }),
            other => Err(BridgeError::Protocol(format!(
                "unknown constraint type: {other}"
            ))),
        }
    }
}

impl From<&Constraint> for ConstraintParams {
    fn from(constraint: &Constraint) -> Self {
        match constraint {
            Constraint::Where { field, op, value } => Self::new(
                "where",
                vec![
                    Value::from(field.as_str()),
                    Value::from(op.as_str()),
                    typed(value),
                ],
            ),
            Constraint::OrderBy { field, direction } => Self::new(
                "orderBy",
                vec![Value::from(field.as_str()), Value::from(direction.to_string())],
            ),
            Constraint::Limit { count } => Self::new("limit", vec![Value::from(*count)]),
            Constraint::LimitToLast { count } => {
                Self::new("limitToLast", vec![Value::from(*count)])
            }
            Constraint::StartAt { values } => Self::new("startAt", values.iter().map(typed).collect()),
            Constraint::StartAfter { values } => {
                Self::new("startAfter", values.iter().map(typed).collect())
            }
            Constraint::EndAt { values } => Self::new("endAt", values.iter().map(typed).collect()),
            Constraint::EndBefore { values } => {
                Self::new("endBefore", values.iter().map(typed).collect())
            }
        }
    }
}

fn typed(value: &FieldValue) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn field_value(value: &Value) -> Result<FieldValue, BridgeError> {
    Ok(serde_json::from_value(value.clone())?)
}

fn field_values(payload: &[Value]) -> Result<Vec<FieldValue>, BridgeError> {
    payload.iter().map(field_value).collect()
}

fn string_arg(value: &Value, what: &str) -> Result<String, BridgeError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| BridgeError::Protocol(format!("{what} must be a string")))
}

fn count_arg(kind: &str, payload: &[Value]) -> Result<u32, BridgeError> {
    match payload {
        [count] => count
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| BridgeError::Protocol(format!("{kind} count must be a u32"))),
        _ => Err(arity(kind, 1, payload.len())),
    }
}

fn arity(kind: &str, expected: usize, got: usize) -> BridgeError {
    BridgeError::Protocol(format!(
        "{kind} takes {expected} payload values, got {got}"
    ))
}

/// What a subscription or read targets: a path (or a collection group)
/// plus constraints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_group: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<ConstraintParams>,
}

impl Target {
    /// Build the handle on the receiving side.
    ///
    /// Document paths ignore constraints, as a document has no query.
    pub fn to_handle(&self) -> Result<Handle, BridgeError> {
        let constraints = self
            .constraints
            .iter()
            .map(ConstraintParams::to_constraint)
            .collect::<Result<Vec<_>, _>>()?;
        let handle = match &self.collection_group {
            Some(group) => Handle::collection_group(group.clone(), constraints)?,
            None if is_doc_path(&self.path) => Handle::document(self.path.clone())?,
            None => Handle::query(self.path.clone(), constraints)?,
        };
        Ok(handle)
    }
}

impl From<&Handle> for Target {
    fn from(handle: &Handle) -> Self {
        match handle {
            Handle::Document { path } | Handle::Collection { path } => Self {
                path: path.clone(),
                ..Self::default()
            },
            Handle::Query(query) => Self {
                path: query.path().to_string(),
                collection_group: query.collection_group().map(str::to_string),
                constraints: query.constraints().iter().map(ConstraintParams::from).collect(),
            },
        }
    }
}

/// Per-request options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOptions {
    /// Dotted field paths whose references the host dereferences before
    /// replying.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expands: Vec<String>,
}

impl QueryOptions {
    pub fn expand(mut self, field: impl Into<String>) -> Self {
        self.expands.push(field.into());
        self
    }
}

/// Client to host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum BridgeRequest {
    Subscribe {
        subscription_id: Uuid,
        #[serde(flatten)]
        target: Target,
        #[serde(default)]
        options: QueryOptions,
    },
    Unsubscribe {
        subscription_id: Uuid,
    },
    /// One-shot read answered with a `Reply` carrying a [`WireSnapshot`].
    Get {
        request_id: Uuid,
        #[serde(flatten)]
        target: Target,
        #[serde(default)]
        options: QueryOptions,
    },
    /// Commit answered with a `Reply` carrying a `WriteReceipt`.
    Write {
        request_id: Uuid,
        writes: Vec<WriteOp>,
    },
}

/// Host to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum BridgeEvent {
    Value {
        subscription_id: Uuid,
        value: WireSnapshot,
    },
    /// The subscription failed and is over.
    Error {
        subscription_id: Uuid,
        error: WireError,
    },
    /// The subscription ended without error.
    Complete {
        subscription_id: Uuid,
    },
    Reply {
        request_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<WireError>,
    },
}

impl BridgeEvent {
    pub fn success(request_id: Uuid, value: Value) -> Self {
        BridgeEvent::Reply {
            request_id,
            value: Some(value),
            error: None,
        }
    }

    pub fn failure(request_id: Uuid, error: WireError) -> Self {
        BridgeEvent::Reply {
            request_id,
            value: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    NotFound,
    PermissionDenied,
    InvalidArgument,
    Unavailable,
    Failed,
}

/// An error as plain data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: ErrorCode,
    pub message: String,
}

impl WireError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn into_listen_error(self) -> ListenError {
        match self.code {
            ErrorCode::PermissionDenied => ListenError::PermissionDenied(self.message),
            ErrorCode::Unavailable => ListenError::Unavailable(self.message),
            _ => ListenError::Failed(self.message),
        }
    }

    pub fn into_store_error(self) -> StoreError {
        match self.code {
            ErrorCode::NotFound => StoreError::NotFound(self.message),
            ErrorCode::PermissionDenied => StoreError::PermissionDenied(self.message),
            ErrorCode::InvalidArgument | ErrorCode::Failed => {
                StoreError::InvalidArgument(self.message)
            }
            ErrorCode::Unavailable => StoreError::Unavailable(self.message),
        }
    }
}

impl From<&ListenError> for WireError {
    fn from(error: &ListenError) -> Self {
        match error {
            ListenError::PermissionDenied(m) => Self::new(ErrorCode::PermissionDenied, m.clone()),
            ListenError::Unavailable(m) => Self::new(ErrorCode::Unavailable, m.clone()),
            ListenError::Failed(m) => Self::new(ErrorCode::Failed, m.clone()),
        }
    }
}

impl From<&StoreError> for WireError {
    fn from(error: &StoreError) -> Self {
        match error {
            StoreError::NotFound(m) => Self::new(ErrorCode::NotFound, m.clone()),
            StoreError::PermissionDenied(m) => Self::new(ErrorCode::PermissionDenied, m.clone()),
            StoreError::InvalidArgument(m) => Self::new(ErrorCode::InvalidArgument, m.clone()),
            StoreError::Unavailable(m) => Self::new(ErrorCode::Unavailable, m.clone()),
        }
    }
}

impl From<&BridgeError> for WireError {
    fn from(error: &BridgeError) -> Self {
        match error {
            BridgeError::Store(e) => e.into(),
            BridgeError::Build(_) | BridgeError::Protocol(_) | BridgeError::Json(_) => {
                Self::new(ErrorCode::InvalidArgument, error.to_string())
            }
            BridgeError::Io(_) | BridgeError::Disconnected => {
                Self::new(ErrorCode::Unavailable, error.to_string())
            }
        }
    }
}

/// A document as plain JSON. References are path strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireDocument {
    pub id: String,
    pub path: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl From<&Document> for WireDocument {
    fn from(document: &Document) -> Self {
        Self {
            id: document.id().to_string(),
            path: document.path.clone(),
            data: document
                .fields
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        }
    }
}

impl WireDocument {
    /// Convert back into a document. Field types are recovered from JSON,
    /// so references and timestamps arrive as strings.
    pub fn into_document(self) -> Document {
        Document {
            path: self.path,
            fields: self
                .data
                .into_iter()
                .map(|(k, v)| (k, FieldValue::from_json(v)))
                .collect(),
        }
    }
}

/// A snapshot as plain JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum WireSnapshot {
    Document { document: Option<WireDocument> },
    Documents { documents: Vec<WireDocument> },
}

impl From<&Snapshot> for WireSnapshot {
    fn from(snapshot: &Snapshot) -> Self {
        match snapshot {
            Snapshot::Document { document } => WireSnapshot::Document {
                document: document.as_ref().map(WireDocument::from),
            },
            Snapshot::Documents { documents } => WireSnapshot::Documents {
                documents: documents.iter().map(WireDocument::from).collect(),
            },
        }
    }
}

impl WireSnapshot {
    pub fn into_snapshot(self) -> Snapshot {
        match self {
            WireSnapshot::Document { document } => {
                Snapshot::document(document.map(WireDocument::into_document))
            }
            WireSnapshot::Documents { documents } => Snapshot::documents(
                documents.into_iter().map(WireDocument::into_document).collect(),
            ),
        }
    }

    pub fn documents_mut(&mut self) -> impl Iterator<Item = &mut WireDocument> {
        let slice: &mut [WireDocument] = match self {
            WireSnapshot::Document { document } => document.as_mut_slice(),
            WireSnapshot::Documents { documents } => documents.as_mut_slice(),
        };
        slice.iter_mut()
    }

    /// The value an expanded reference is replaced with: the document
    /// object (or `null`), or an array of document objects.
    pub fn into_json(self) -> Value {
        match self {
            WireSnapshot::Document { document } => document
                .and_then(|d| serde_json::to_value(d).ok())
                .unwrap_or(Value::Null),
            WireSnapshot::Documents { documents } => Value::Array(
                documents
                    .into_iter()
                    .filter_map(|d| serde_json::to_value(d).ok())
                    .collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_core::{end_before, limit, order_by, start_after, where_};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use test_case::test_case;

    #[test]
    fn test_subscribe_request_shape() {
        let id = Uuid::nil();
        let handle = Handle::query(
            "flights",
            vec![where_("number", FilterOp::LessThan, 10), limit(3)],
        )
        .unwrap();
        let request = BridgeRequest::Subscribe {
            subscription_id: id,
            target: Target::from(&handle),
            options: QueryOptions::default(),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({
                "op": "subscribe",
                "subscriptionId": id,
                "path": "flights",
                "constraints": [
                    { "type": "where", "payload": ["number", "<", { "type": "integer", "value": 10 }] },
                    { "type": "limit", "payload": [3] },
                ],
                "options": {},
            })
        );
        assert_eq!(serde_json::from_value::<BridgeRequest>(value).unwrap(), request);
    }

    #[test]
    fn test_target_rebuilds_equivalent_handle() {
        let handle = Handle::query(
            "flights",
            vec![
                where_("tags", FilterOp::ArrayContains, "night"),
                order_by("number", Direction::Desc),
                start_after(vec![FieldValue::from(5)]),
                end_before(vec![FieldValue::from(50)]),
                limit(10),
            ],
        )
        .unwrap();
        let wire = serde_json::to_string(&Target::from(&handle)).unwrap();
        let target: Target = serde_json::from_str(&wire).unwrap();
        assert_eq!(target.to_handle().unwrap().key(), handle.key());
    }

    #[test]
    fn test_collection_group_target() {
        let handle = Handle::collection_group("legs", vec![limit(1)]).unwrap();
        let target = Target::from(&handle);
        assert_eq!(target.collection_group.as_deref(), Some("legs"));
        assert_eq!(target.to_handle().unwrap().key(), handle.key());
    }

    #[test]
    fn test_document_target_ignores_constraints() {
        let target = Target {
            path: "flights/a".into(),
            collection_group: None,
            constraints: vec![ConstraintParams::new("limit", vec![json!(1)])],
        };
        assert_eq!(target.to_handle().unwrap(), Handle::document("flights/a").unwrap());
    }

    #[test_case("where", json!(["number", "<"]) ; "where arity")]
    #[test_case("where", json!(["number", "~", 1]) ; "unknown op")]
    #[test_case("limit", json!([-1]) ; "negative limit")]
    #[test_case("orderBy", json!(["number", "sideways"]) ; "bad direction")]
    #[test_case("groupBy", json!(["number"]) ; "unknown type")]
    fn test_invalid_constraints_are_rejected(kind: &str, payload: Value) {
        let Value::Array(payload) = payload else {
            unreachable!()
        };
        assert!(ConstraintParams::new(kind, payload).to_constraint().is_err());
    }

    #[test]
    fn test_references_travel_as_paths() {
        let document = Document::new("flights/a")
            .with("number", 1)
            .with("plane", FieldValue::Reference("planes/p1".into()));
        let wire = WireSnapshot::from(&Snapshot::document(Some(document)));
        assert_eq!(
            serde_json::to_value(&wire).unwrap(),
            json!({
                "kind": "document",
                "document": {
                    "id": "a",
                    "path": "flights/a",
                    "data": { "number": 1, "plane": "planes/p1" },
                },
            })
        );

        let back = wire.into_snapshot();
        let doc = back.iter_documents().next().unwrap();
        assert_eq!(doc.get("plane"), Some(&FieldValue::from("planes/p1")));
    }

    #[test]
    fn test_error_codes_round_trip_through_store_errors() {
        let wire = WireError::from(&StoreError::NotFound("flights/x".into()));
        assert_eq!(wire.code, ErrorCode::NotFound);
        assert_eq!(
            wire.into_store_error(),
            StoreError::NotFound("flights/x".into())
        );

        let wire = WireError::from(&ListenError::PermissionDenied("no".into()));
        assert_eq!(
            wire.into_listen_error(),
            ListenError::PermissionDenied("no".into())
        );
    }
}
