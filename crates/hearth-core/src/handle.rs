//! Immutable document, collection and query handles.

use serde::{Deserialize, Serialize};

use crate::constraint::{Bound, Constraint, Filter, FilterOp, Limit, LimitKind, OrderBy};
use crate::path::{assert_collection, assert_document, assert_path, is_doc_path};
use crate::{BuildError, CacheKey, FieldValue, key_of};

/// Identifies a document, a collection, or a constrained query.
///
/// Handles are cheap to clone and never change after construction; all
/// validation happens in the constructors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Handle {
    Document { path: String },
    Collection { path: String },
    Query(Query),
}

impl Handle {
    /// Handle for the document at `path`.
    pub fn document(path: impl Into<String>) -> Result<Self, BuildError> {
        let path = path.into();
        assert_path(&path)?;
        assert_document(&path)?;
        Ok(Handle::Document { path })
    }

    /// Handle for every document of the collection at `path`.
    pub fn collection(path: impl Into<String>) -> Result<Self, BuildError> {
        let path = path.into();
        assert_path(&path)?;
        assert_collection(&path)?;
        Ok(Handle::Collection { path })
    }

    /// Handle for a constrained query over the collection at `path`.
    ///
    /// An empty constraint list yields a plain collection handle.
    pub fn query(path: impl Into<String>, constraints: Vec<Constraint>) -> Result<Self, BuildError> {
        let path = path.into();
        assert_path(&path)?;
        assert_collection(&path)?;
        if constraints.is_empty() {
            return Ok(Handle::Collection { path });
        }
        Ok(Handle::Query(Query::build(path, None, constraints)?))
    }

    /// Handle for a query over every collection named `collection_id`.
    pub fn collection_group(
        collection_id: impl Into<String>,
        constraints: Vec<Constraint>,
    ) -> Result<Self, BuildError> {
        let group = collection_id.into();
        assert_path(&group)?;
        if group.contains('/') {
            return Err(BuildError::InvalidPath(group));
        }
        Ok(Handle::Query(Query::build(String::new(), Some(group), constraints)?))
    }

    /// Document or collection handle, chosen by path parity.
    pub fn reference(path: impl Into<String>) -> Result<Self, BuildError> {
        let path = path.into();
        assert_path(&path)?;
        if is_doc_path(&path) {
            Ok(Handle::Document { path })
        } else {
            Ok(Handle::Collection { path })
        }
    }

    /// The document path, collection path, or queried collection path.
    ///
    /// Collection-group queries have an empty path.
    pub fn path(&self) -> &str {
        match self {
            Handle::Document { path } | Handle::Collection { path } => path,
            Handle::Query(query) => &query.path,
        }
    }

    pub fn is_document(&self) -> bool {
        matches!(self, Handle::Document { .. })
    }

    pub fn key(&self) -> CacheKey {
        key_of(self)
    }
}

/// A query normalized from its constraint list.
///
/// Filters keep construction order. For limits and cursors the last
/// constraint of each kind wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "QueryParts", into = "QueryParts")]
pub struct Query {
    path: String,
    collection_group: Option<String>,
    constraints: Vec<Constraint>,
    filters: Vec<Filter>,
    order_by: Vec<OrderBy>,
    limit: Option<Limit>,
    start: Option<Bound>,
    end: Option<Bound>,
}

/// Serialized form of a [`Query`]; the normalized fields are rebuilt on
/// deserialization.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryParts {
    path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    collection_group: Option<String>,
    constraints: Vec<Constraint>,
}

impl TryFrom<QueryParts> for Query {
    type Error = BuildError;

    fn try_from(parts: QueryParts) -> Result<Self, Self::Error> {
        Query::build(parts.path, parts.collection_group, parts.constraints)
    }
}

impl From<Query> for QueryParts {
    fn from(query: Query) -> Self {
        QueryParts {
            path: query.path,
            collection_group: query.collection_group,
            constraints: query.constraints,
        }
    }
}

impl Query {
    fn build(
        path: String,
        collection_group: Option<String>,
        constraints: Vec<Constraint>,
    ) -> Result<Self, BuildError> {
        let mut query = Query {
            path,
            collection_group,
            constraints: Vec::new(),
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            start: None,
            end: None,
        };
        for constraint in constraints {
            query.apply(constraint)?;
        }
        Ok(query)
    }

    fn apply(&mut self, constraint: Constraint) -> Result<(), BuildError> {
        match &constraint {
            Constraint::Where { field, op, value } => {
                if field.is_empty() {
                    return Err(BuildError::InvalidConstraint(
                        "where() requires a field".into(),
                    ));
                }
                let needs_array = matches!(
                    op,
                    FilterOp::In | FilterOp::NotIn | FilterOp::ArrayContainsAny
                );
                if needs_array && !matches!(value, FieldValue::Array(_)) {
                    return Err(BuildError::InvalidConstraint(format!(
                        "'{op}' filter on {field} requires an array value"
                    )));
                }
                self.filters.push(Filter {
                    field: field.clone(),
                    op: *op,
                    value: value.clone(),
                });
            }
            Constraint::OrderBy { field, direction } => {
                if field.is_empty() {
                    return Err(BuildError::InvalidConstraint(
                        "orderBy() requires a field".into(),
                    ));
                }
                self.order_by.push(OrderBy {
                    field: field.clone(),
                    direction: *direction,
                });
            }
            Constraint::Limit { count } | Constraint::LimitToLast { count } => {
                if *count == 0 {
                    return Err(BuildError::InvalidConstraint(
                        "limit must be greater than zero".into(),
                    ));
                }
                let kind = if matches!(constraint, Constraint::Limit { .. }) {
                    LimitKind::First
                } else {
                    LimitKind::Last
                };
                self.limit = Some(Limit {
                    count: *count,
                    kind,
                });
            }
            Constraint::StartAt { values } | Constraint::StartAfter { values } => {
                self.start = Some(Bound {
                    values: values.clone(),
                    inclusive: matches!(constraint, Constraint::StartAt { .. }),
                });
            }
            Constraint::EndAt { values } | Constraint::EndBefore { values } => {
                self.end = Some(Bound {
                    values: values.clone(),
                    inclusive: matches!(constraint, Constraint::EndAt { .. }),
                });
            }
        }
        self.constraints.push(constraint);
        Ok(())
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn collection_group(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    /// The constraints this query was built from, in order.
    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn order_by(&self) -> &[OrderBy] {
        &self.order_by
    }

    pub fn limit(&self) -> Option<Limit> {
        self.limit
    }

    pub fn start(&self) -> Option<&Bound> {
        self.start.as_ref()
    }

    pub fn end(&self) -> Option<&Bound> {
        self.end.as_ref()
    }

    /// Whether a document at `doc_path` lives in a collection this query
    /// reads from.
    pub fn covers(&self, doc_path: &str) -> bool {
        let parent = crate::path::parent(doc_path);
        match &self.collection_group {
            Some(group) => crate::path::doc_id(parent) == group,
            None => parent == self.path,
        }
    }
}
