//! Engine-agnostic database connection contract.
//!
//! The engine never talks to a concrete driver. Hosts supply an
//! implementation of [`Connection`] for their database; the executor owns
//! the transactional scope through the explicit `begin`/`commit`/`rollback`
//! triple.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::DatabaseEngine;

/// Engine-agnostic scalar value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// Boolean value.
    Boolean(bool),
    /// 64-bit integer.
    Integer(i64),
    /// 64-bit float.
    Float(f64),
    /// Text value.
    Text(String),
    /// Structured JSON value (arrays, objects).
    Json(serde_json::Value),
}

impl Value {
    /// Whether this value is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Text content, if this is a text value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric content widened to f64, if numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Render the value as display text (used by text transforms).
    pub fn coerce_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Boolean(b) => b.to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Text(s) => s.clone(),
            Value::Json(v) => v.to_string(),
        }
    }

    /// Render the value as a SQL literal.
    ///
    /// Text is single-quoted with embedded quotes doubled.
    pub fn to_sql_literal(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Boolean(true) => "TRUE".to_string(),
            Value::Boolean(false) => "FALSE".to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
            Value::Json(v) => format!("'{}'", v.to_string().replace('\'', "''")),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

/// A single result row: ordered column/value pairs with by-name access.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<(String, Value)>,
}

impl Row {
    /// Create an empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a row from column/value pairs.
    pub fn from_pairs(pairs: Vec<(String, Value)>) -> Self {
        Self { columns: pairs }
    }

    /// Get a value by column name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(col, _)| col == name)
            .map(|(_, value)| value)
    }

    /// Append a column, replacing any existing column of the same name.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        if let Some(slot) = self.columns.iter_mut().find(|(col, _)| *col == name) {
            slot.1 = value;
        } else {
            self.columns.push((name, value));
        }
    }

    /// Ordered column/value pairs.
    pub fn columns(&self) -> &[(String, Value)] {
        &self.columns
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Whether the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

// Rows travel inside backup snapshots and portable packages as plain JSON
// objects. Column order is not semantic; the wire form is sorted by name so
// package checksums survive a decode/re-encode round trip.
impl Serialize for Row {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut sorted: Vec<&(String, Value)> = self.columns.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));

        let mut map = serializer.serialize_map(Some(sorted.len()))?;
        for (name, value) in sorted {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Row {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = std::collections::BTreeMap::<String, Value>::deserialize(deserializer)?;
        Ok(Row {
            columns: map.into_iter().collect(),
        })
    }
}

/// Errors from a connection implementation.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// A query failed.
    #[error("query failed: {0}")]
    Query(String),

    /// A statement failed to execute.
    #[error("statement failed: {0}")]
    Execute(String),

    /// A transaction control operation failed.
    #[error("transaction error: {0}")]
    Transaction(String),
}

/// Engine-agnostic database connection.
///
/// `query` returns rows; `execute` returns the affected row count. The
/// transaction scope belongs to the caller: the executor brackets each
/// transactional step with `begin`/`commit` and issues `rollback` on
/// failure. Implementations are not required to support nested
/// transactions.
#[async_trait]
pub trait Connection: Send + Sync {
    /// The engine this connection talks to (drives dialect selection).
    fn engine(&self) -> DatabaseEngine;

    /// Run a query and return its rows. `?` placeholders bind `params`
    /// positionally.
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, ConnectionError>;

    /// Execute a statement and return the affected row count.
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64, ConnectionError>;

    /// Open a transaction.
    async fn begin(&self) -> Result<(), ConnectionError>;

    /// Commit the open transaction.
    async fn commit(&self) -> Result<(), ConnectionError>;

    /// Roll back the open transaction.
    async fn rollback(&self) -> Result<(), ConnectionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_sql_literal() {
        assert_eq!(Value::Null.to_sql_literal(), "NULL");
        assert_eq!(Value::Integer(42).to_sql_literal(), "42");
        assert_eq!(Value::Text("it's".into()).to_sql_literal(), "'it''s'");
        assert_eq!(Value::Boolean(true).to_sql_literal(), "TRUE");
    }

    #[test]
    fn test_value_untagged_serde() {
        let v: Value = serde_json::from_str("3.5").unwrap();
        assert_eq!(v, Value::Float(3.5));
        let v: Value = serde_json::from_str("null").unwrap();
        assert!(v.is_null());
        let v: Value = serde_json::from_str("[1,2]").unwrap();
        assert!(matches!(v, Value::Json(_)));
    }

    #[test]
    fn test_row_access() {
        let mut row = Row::new();
        row.set("id", Value::Integer(1));
        row.set("name", Value::Text("alpha".into()));
        row.set("name", Value::Text("beta".into()));

        assert_eq!(row.len(), 2);
        assert_eq!(row.get("name"), Some(&Value::Text("beta".into())));
        assert_eq!(row.get("missing"), None);
    }

    #[test]
    fn test_row_serializes_as_object() {
        let row = Row::from_pairs(vec![
            ("id".to_string(), Value::Integer(7)),
            ("name".to_string(), Value::Text("x".into())),
        ]);
        let json = serde_json::to_string(&row).unwrap();
        assert_eq!(json, r#"{"id":7,"name":"x"}"#);

        let back: Row = serde_json::from_str(&json).unwrap();
        assert_eq!(back.get("id"), Some(&Value::Integer(7)));
    }
}
