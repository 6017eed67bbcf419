//! Query constraints.
//!
//! Constraints are inert data until a query handle is built from them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{BuildError, FieldValue};

/// Comparison operator of a `where` filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "==")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = "<=")]
    LessThanOrEqual,
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = ">=")]
    GreaterThanOrEqual,
    #[serde(rename = "array-contains")]
    ArrayContains,
    #[serde(rename = "array-contains-any")]
    ArrayContainsAny,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not-in")]
    NotIn,
}

impl FilterOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOp::Equal => "==",
            FilterOp::NotEqual => "!=",
            FilterOp::LessThan => "<",
            FilterOp::LessThanOrEqual => "<=",
            FilterOp::GreaterThan => ">",
            FilterOp::GreaterThanOrEqual => ">=",
            FilterOp::ArrayContains => "array-contains",
            FilterOp::ArrayContainsAny => "array-contains-any",
            FilterOp::In => "in",
            FilterOp::NotIn => "not-in",
        }
    }
}

impl fmt::Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilterOp {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "==" => FilterOp::Equal,
            "!=" => FilterOp::NotEqual,
            "<" => FilterOp::LessThan,
            "<=" => FilterOp::LessThanOrEqual,
            ">" => FilterOp::GreaterThan,
            ">=" => FilterOp::GreaterThanOrEqual,
            "array-contains" => FilterOp::ArrayContains,
            "array-contains-any" => FilterOp::ArrayContainsAny,
            "in" => FilterOp::In,
            "not-in" => FilterOp::NotIn,
            other => {
                return Err(BuildError::InvalidConstraint(format!(
                    "unknown filter operator: {other}"
                )));
            }
        })
    }
}

/// Sort direction of an `orderBy` constraint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Asc => f.write_str("asc"),
            Direction::Desc => f.write_str("desc"),
        }
    }
}

impl FromStr for Direction {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "asc" => Ok(Direction::Asc),
            "desc" => Ok(Direction::Desc),
            other => Err(BuildError::InvalidConstraint(format!(
                "unknown order direction: {other}"
            ))),
        }
    }
}

/// A single query constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Constraint {
    Where {
        field: String,
        op: FilterOp,
        value: FieldValue,
    },
    OrderBy {
        field: String,
        direction: Direction,
    },
    Limit { count: u32 },
    LimitToLast { count: u32 },
    StartAt { values: Vec<FieldValue> },
    StartAfter { values: Vec<FieldValue> },
    EndAt { values: Vec<FieldValue> },
    EndBefore { values: Vec<FieldValue> },
}

pub fn where_(field: impl Into<String>, op: FilterOp, value: impl Into<FieldValue>) -> Constraint {
    Constraint::Where {
        field: field.into(),
        op,
        value: value.into(),
    }
}

pub fn order_by(field: impl Into<String>, direction: Direction) -> Constraint {
    Constraint::OrderBy {
        field: field.into(),
        direction,
    }
}

pub fn limit(count: u32) -> Constraint {
    Constraint::Limit { count }
}

pub fn limit_to_last(count: u32) -> Constraint {
    Constraint::LimitToLast { count }
}

pub fn start_at(values: Vec<FieldValue>) -> Constraint {
    Constraint::StartAt { values }
}

pub fn start_after(values: Vec<FieldValue>) -> Constraint {
    Constraint::StartAfter { values }
}

pub fn end_at(values: Vec<FieldValue>) -> Constraint {
    Constraint::EndAt { values }
}

pub fn end_before(values: Vec<FieldValue>) -> Constraint {
    Constraint::EndBefore { values }
}

/// A normalized `where` filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: FieldValue,
}

/// A normalized `orderBy`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

/// Which end of the ordered result a limit applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LimitKind {
    First,
    Last,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limit {
    pub count: u32,
    pub kind: LimitKind,
}

/// A cursor position over the order-by fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    pub values: Vec<FieldValue>,
    /// Whether documents exactly at the position are included.
    pub inclusive: bool,
}
