//! SQLite backend for the plugin migration engine.
//!
//! Implements the engine-agnostic connection contract over bundled
//! `rusqlite`. Statements run synchronously on the caller's task; SQLite is
//! an embedded engine and its statement latency does not warrant a thread
//! hop.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::Path;

use plugmig_core::{Connection, ConnectionError, DatabaseEngine, Row, Value};

/// A [`Connection`] over a rusqlite handle.
pub struct SqliteConnection {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteConnection {
    /// Open a database file, creating it if absent.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ConnectionError> {
        let conn = rusqlite::Connection::open(path)
            .map_err(|e| ConnectionError::Transaction(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database.
    pub fn open_in_memory() -> Result<Self, ConnectionError> {
        let conn = rusqlite::Connection::open_in_memory()
            .map_err(|e| ConnectionError::Transaction(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn to_sql_value(value: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match value {
        Value::Null => Sql::Null,
        Value::Boolean(b) => Sql::Integer(i64::from(*b)),
        Value::Integer(i) => Sql::Integer(*i),
        Value::Float(f) => Sql::Real(*f),
        Value::Text(s) => Sql::Text(s.clone()),
        Value::Json(v) => Sql::Text(v.to_string()),
    }
}

fn from_sql_value(value: rusqlite::types::Value) -> Value {
    use rusqlite::types::Value as Sql;
    match value {
        Sql::Null => Value::Null,
        Sql::Integer(i) => Value::Integer(i),
        Sql::Real(f) => Value::Float(f),
        Sql::Text(s) => Value::Text(s),
        Sql::Blob(bytes) => Value::Text(hex::encode(bytes)),
    }
}

#[async_trait]
impl Connection for SqliteConnection {
    fn engine(&self) -> DatabaseEngine {
        DatabaseEngine::Sqlite
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, ConnectionError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| ConnectionError::Query(e.to_string()))?;
        let column_names: Vec<String> = stmt
            .column_names()
            .iter()
            .map(|name| name.to_string())
            .collect();

        let mut rows = stmt
            .query(rusqlite::params_from_iter(params.iter().map(to_sql_value)))
            .map_err(|e| ConnectionError::Query(e.to_string()))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .map_err(|e| ConnectionError::Query(e.to_string()))?
        {
            let mut pairs = Vec::with_capacity(column_names.len());
            for (index, name) in column_names.iter().enumerate() {
                let value: rusqlite::types::Value = row
                    .get(index)
                    .map_err(|e| ConnectionError::Query(e.to_string()))?;
                pairs.push((name.clone(), from_sql_value(value)));
            }
            out.push(Row::from_pairs(pairs));
        }
        Ok(out)
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64, ConnectionError> {
        let conn = self.conn.lock();
        let affected = conn
            .execute(sql, rusqlite::params_from_iter(params.iter().map(to_sql_value)))
            .map_err(|e| ConnectionError::Execute(e.to_string()))?;
        Ok(affected as u64)
    }

    async fn begin(&self) -> Result<(), ConnectionError> {
        self.conn
            .lock()
            .execute_batch("BEGIN")
            .map_err(|e| ConnectionError::Transaction(e.to_string()))
    }

    async fn commit(&self) -> Result<(), ConnectionError> {
        self.conn
            .lock()
            .execute_batch("COMMIT")
            .map_err(|e| ConnectionError::Transaction(e.to_string()))
    }

    async fn rollback(&self) -> Result<(), ConnectionError> {
        self.conn
            .lock()
            .execute_batch("ROLLBACK")
            .map_err(|e| ConnectionError::Transaction(e.to_string()))
    }
}
