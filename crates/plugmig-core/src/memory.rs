//! In-memory [`Connection`] implementation.
//!
//! Understands exactly the statement shapes the engine emits (simple DDL,
//! multi-row inserts, paged selects with conjunctive filters) plus scripted
//! query responses for validation predicates. Used by the test suites and
//! by dry-run tooling; production hosts supply a real driver.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

use async_trait::async_trait;

use crate::connection::{Connection, ConnectionError, Row, Value};
use crate::engine::DatabaseEngine;

#[derive(Debug, Default, Clone)]
struct State {
    tables: HashMap<String, Vec<Row>>,
    indexes: HashSet<String>,
}

#[derive(Debug, Default)]
struct Inner {
    state: State,
    snapshot: Option<State>,
    scripted: Vec<(String, Vec<Row>)>,
    statements: Vec<String>,
}

/// In-memory connection over named tables of rows.
#[derive(Debug)]
pub struct MemoryConnection {
    engine: DatabaseEngine,
    inner: Mutex<Inner>,
}

impl Default for MemoryConnection {
    fn default() -> Self {
        Self::new(DatabaseEngine::Postgres)
    }
}

impl MemoryConnection {
    /// Create an empty connection reporting the given engine.
    pub fn new(engine: DatabaseEngine) -> Self {
        Self {
            engine,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Seed a table with rows.
    pub fn with_table(self, name: impl Into<String>, rows: Vec<Row>) -> Self {
        self.inner.lock().state.tables.insert(name.into(), rows);
        self
    }

    /// Script a response for queries containing `fragment`. Scripted
    /// responses are checked before table reads, first match wins.
    pub fn script_query(&self, fragment: impl Into<String>, rows: Vec<Row>) {
        self.inner.lock().scripted.push((fragment.into(), rows));
    }

    /// Rows currently in a table.
    pub fn table(&self, name: &str) -> Vec<Row> {
        self.inner
            .lock()
            .state
            .tables
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Table names currently present.
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().state.tables.keys().cloned().collect();
        names.sort();
        names
    }

    /// Every statement seen by `query` and `execute`, after parameter
    /// substitution.
    pub fn statements(&self) -> Vec<String> {
        self.inner.lock().statements.clone()
    }

    fn render(sql: &str, params: &[Value]) -> String {
        let mut out = String::with_capacity(sql.len());
        let mut params = params.iter();
        let mut in_quote = false;
        for c in sql.chars() {
            if c == '\'' {
                in_quote = !in_quote;
                out.push(c);
            } else if c == '?' && !in_quote {
                match params.next() {
                    Some(value) => out.push_str(&value.to_sql_literal()),
                    None => out.push(c),
                }
            } else {
                out.push(c);
            }
        }
        out
    }
}

/// One parsed `col op value` condition.
#[derive(Debug)]
struct Condition {
    column: String,
    op: String,
    values: Vec<Value>,
}

impl Condition {
    fn matches(&self, row: &Row) -> bool {
        let actual = row.get(&self.column).cloned().unwrap_or(Value::Null);
        match self.op.as_str() {
            "IN" => self.values.iter().any(|v| values_equal(&actual, v)),
            "=" => values_equal(&actual, &self.values[0]),
            "!=" | "<>" => !values_equal(&actual, &self.values[0]),
            ">" | "<" | ">=" | "<=" => {
                let ord = compare_values(&actual, &self.values[0]);
                match self.op.as_str() {
                    ">" => ord == std::cmp::Ordering::Greater,
                    "<" => ord == std::cmp::Ordering::Less,
                    ">=" => ord != std::cmp::Ordering::Less,
                    "<=" => ord != std::cmp::Ordering::Greater,
                    _ => unreachable!(),
                }
            }
            _ => false,
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a.coerce_text() == b.coerce_text(),
    }
}

fn compare_values(a: &Value, b: &Value) -> std::cmp::Ordering {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
        _ => a.coerce_text().cmp(&b.coerce_text()),
    }
}

fn parse_literal(text: &str) -> Value {
    let text = text.trim();
    if text.eq_ignore_ascii_case("null") {
        Value::Null
    } else if text.eq_ignore_ascii_case("true") {
        Value::Boolean(true)
    } else if text.eq_ignore_ascii_case("false") {
        Value::Boolean(false)
    } else if let Some(stripped) = text.strip_prefix('\'') {
        Value::Text(
            stripped
                .strip_suffix('\'')
                .unwrap_or(stripped)
                .replace("''", "'"),
        )
    } else if let Ok(i) = text.parse::<i64>() {
        Value::Integer(i)
    } else if let Ok(f) = text.parse::<f64>() {
        Value::Float(f)
    } else {
        Value::Text(text.to_string())
    }
}

fn parse_conditions(clause: &str) -> Vec<Condition> {
    split_case_insensitive(clause, " AND ")
        .into_iter()
        .filter_map(|part| {
            let part = part.trim();
            let upper = part.to_uppercase();
            if let Some(at) = upper.find(" IN ") {
                let column = part[..at].trim().to_string();
                let list = part[at + 4..].trim();
                let list = list.strip_prefix('(')?.strip_suffix(')')?;
                let values = split_top_level_commas(list)
                    .into_iter()
                    .map(|v| parse_literal(&v))
                    .collect();
                return Some(Condition {
                    column,
                    op: "IN".to_string(),
                    values,
                });
            }
            for op in ["!=", "<>", ">=", "<=", "=", ">", "<"] {
                if let Some(at) = part.find(op) {
                    return Some(Condition {
                        column: part[..at].trim().to_string(),
                        op: op.to_string(),
                        values: vec![parse_literal(&part[at + op.len()..])],
                    });
                }
            }
            None
        })
        .collect()
}

fn split_case_insensitive(text: &str, separator: &str) -> Vec<String> {
    let upper = text.to_uppercase();
    let sep = separator.to_uppercase();
    let mut parts = Vec::new();
    let mut pos = 0;
    while let Some(found) = upper[pos..].find(&sep) {
        parts.push(text[pos..pos + found].to_string());
        pos += found + sep.len();
    }
    parts.push(text[pos..].to_string());
    parts
}

/// Split on commas outside quotes and parentheses.
fn split_top_level_commas(text: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut in_quote = false;
    let mut current = String::new();
    for c in text.chars() {
        match c {
            '\'' => {
                in_quote = !in_quote;
                current.push(c);
            }
            '(' if !in_quote => {
                depth += 1;
                current.push(c);
            }
            ')' if !in_quote => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if !in_quote && depth == 0 => {
                parts.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

/// Clause boundaries of a select statement tail.
fn find_keyword(upper: &str, keyword: &str) -> Option<usize> {
    upper.find(keyword)
}

impl MemoryConnection {
    fn run_select(&self, sql: &str) -> Result<Vec<Row>, ConnectionError> {
        let upper = sql.to_uppercase();
        let Some(from_at) = find_keyword(&upper, " FROM ") else {
            // Bare SELECT expression: one synthetic row (validation
            // predicates use this as an unconditional pass).
            return Ok(vec![Row::from_pairs(vec![(
                "result".to_string(),
                Value::Integer(1),
            )])]);
        };

        let tail = &sql[from_at + " FROM ".len()..];
        let tail_upper = &upper[from_at + " FROM ".len()..];

        let mut table_end = tail.len();
        for keyword in [" WHERE ", " ORDER BY ", " LIMIT ", " OFFSET "] {
            if let Some(at) = find_keyword(tail_upper, keyword) {
                table_end = table_end.min(at);
            }
        }
        let table = tail[..table_end].trim().to_string();

        let where_clause = find_keyword(tail_upper, " WHERE ").map(|at| {
            let rest = &tail[at + " WHERE ".len()..];
            let rest_upper = &tail_upper[at + " WHERE ".len()..];
            let mut end = rest.len();
            for keyword in [" ORDER BY ", " LIMIT ", " OFFSET "] {
                if let Some(found) = find_keyword(rest_upper, keyword) {
                    end = end.min(found);
                }
            }
            rest[..end].trim().to_string()
        });

        let order_by = find_keyword(tail_upper, " ORDER BY ").map(|at| {
            let rest = &tail[at + " ORDER BY ".len()..];
            let rest_upper = &tail_upper[at + " ORDER BY ".len()..];
            let mut end = rest.len();
            for keyword in [" LIMIT ", " OFFSET "] {
                if let Some(found) = find_keyword(rest_upper, keyword) {
                    end = end.min(found);
                }
            }
            rest[..end].trim().trim_end_matches(" ASC").to_string()
        });

        let limit = find_keyword(tail_upper, " LIMIT ").and_then(|at| {
            tail[at + " LIMIT ".len()..]
                .split_whitespace()
                .next()?
                .parse::<usize>()
                .ok()
        });
        let offset = find_keyword(tail_upper, " OFFSET ").and_then(|at| {
            tail[at + " OFFSET ".len()..]
                .split_whitespace()
                .next()?
                .parse::<usize>()
                .ok()
        });

        let inner = self.inner.lock();
        let Some(rows) = inner.state.tables.get(&table) else {
            return Err(ConnectionError::Query(format!("no such table: {table}")));
        };

        let conditions = where_clause.as_deref().map(parse_conditions).unwrap_or_default();
        let mut matched: Vec<Row> = rows
            .iter()
            .filter(|row| conditions.iter().all(|c| c.matches(row)))
            .cloned()
            .collect();

        if let Some(column) = order_by {
            matched.sort_by(|a, b| {
                let left = a.get(&column).cloned().unwrap_or(Value::Null);
                let right = b.get(&column).cloned().unwrap_or(Value::Null);
                compare_values(&left, &right)
            });
        }

        let start = offset.unwrap_or(0).min(matched.len());
        let end = limit.map(|l| (start + l).min(matched.len())).unwrap_or(matched.len());
        Ok(matched[start..end].to_vec())
    }

    fn run_statement(&self, sql: &str) -> Result<u64, ConnectionError> {
        let trimmed = sql.trim();
        let upper = trimmed.to_uppercase();
        let mut inner = self.inner.lock();

        if let Some(rest) = strip_prefix_ci(trimmed, "CREATE TABLE ") {
            let (if_not_exists, rest) = match strip_prefix_ci(rest, "IF NOT EXISTS ") {
                Some(rest) => (true, rest),
                None => (false, rest),
            };
            let name = leading_identifier(rest);
            if inner.state.tables.contains_key(&name) {
                if if_not_exists {
                    return Ok(0);
                }
                return Err(ConnectionError::Execute(format!(
                    "table {name} already exists"
                )));
            }
            inner.state.tables.insert(name, Vec::new());
            return Ok(0);
        }

        if let Some(rest) = strip_prefix_ci(trimmed, "DROP TABLE ") {
            let (if_exists, rest) = match strip_prefix_ci(rest, "IF EXISTS ") {
                Some(rest) => (true, rest),
                None => (false, rest),
            };
            let name = leading_identifier(rest);
            if inner.state.tables.remove(&name).is_none() && !if_exists {
                return Err(ConnectionError::Execute(format!("no such table: {name}")));
            }
            return Ok(0);
        }

        if upper.starts_with("CREATE INDEX") || upper.starts_with("CREATE UNIQUE INDEX") {
            let rest = trimmed[trimmed.to_uppercase().find("INDEX").unwrap() + "INDEX".len()..]
                .trim_start();
            let (if_not_exists, rest) = match strip_prefix_ci(rest, "IF NOT EXISTS ") {
                Some(rest) => (true, rest),
                None => (false, rest),
            };
            let name = leading_identifier(rest);
            if inner.state.indexes.contains(&name) {
                if if_not_exists {
                    return Ok(0);
                }
                return Err(ConnectionError::Execute(format!(
                    "index {name} already exists"
                )));
            }
            inner.state.indexes.insert(name);
            return Ok(0);
        }

        if let Some(rest) = strip_prefix_ci(trimmed, "DROP INDEX ") {
            let (if_exists, rest) = match strip_prefix_ci(rest, "IF EXISTS ") {
                Some(rest) => (true, rest),
                None => (false, rest),
            };
            let name = leading_identifier(rest);
            if !inner.state.indexes.remove(&name) && !if_exists {
                return Err(ConnectionError::Execute(format!("no such index: {name}")));
            }
            return Ok(0);
        }

        if let Some(rest) = strip_prefix_ci(trimmed, "ALTER TABLE ") {
            let name = leading_identifier(rest);
            if !inner.state.tables.contains_key(&name) {
                return Err(ConnectionError::Execute(format!("no such table: {name}")));
            }
            return Ok(0);
        }

        if let Some(rest) = strip_prefix_ci(trimmed, "DELETE FROM ") {
            let name = leading_identifier(rest);
            let where_clause = rest
                .to_uppercase()
                .find(" WHERE ")
                .map(|at| rest[at + " WHERE ".len()..].trim().to_string());
            let Some(rows) = inner.state.tables.get_mut(&name) else {
                return Err(ConnectionError::Execute(format!("no such table: {name}")));
            };
            let before = rows.len();
            match where_clause {
                Some(clause) => {
                    let conditions = parse_conditions(&clause);
                    rows.retain(|row| !conditions.iter().all(|c| c.matches(row)));
                }
                None => rows.clear(),
            }
            return Ok((before - inner.state.tables[&name].len()) as u64);
        }

        if let Some(rest) = strip_prefix_ci(trimmed, "INSERT INTO ") {
            return insert_rows(&mut inner.state, rest);
        }

        // Anything else (grants, comments, vendor DDL) is accepted as a
        // no-op so dialect output can be exercised without modeling it.
        Ok(0)
    }
}

fn strip_prefix_ci<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    if text.len() >= prefix.len() && text[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&text[prefix.len()..])
    } else {
        None
    }
}

fn leading_identifier(text: &str) -> String {
    text.trim_start()
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == '.')
        .collect()
}

fn insert_rows(state: &mut State, rest: &str) -> Result<u64, ConnectionError> {
    let table = leading_identifier(rest);
    let after_table = &rest[rest.find(&table).unwrap_or(0) + table.len()..];

    let open = after_table
        .find('(')
        .ok_or_else(|| ConnectionError::Execute("insert missing column list".to_string()))?;
    let close = after_table[open..]
        .find(')')
        .map(|c| open + c)
        .ok_or_else(|| ConnectionError::Execute("insert missing column list".to_string()))?;
    let columns: Vec<String> = after_table[open + 1..close]
        .split(',')
        .map(|c| c.trim().to_string())
        .collect();

    let after_cols = &after_table[close + 1..];
    let values_at = after_cols
        .to_uppercase()
        .find("VALUES")
        .ok_or_else(|| ConnectionError::Execute("insert missing VALUES".to_string()))?;
    let tuples_text = after_cols[values_at + "VALUES".len()..].trim();

    let mut new_rows = Vec::new();
    for tuple in split_top_level_commas(tuples_text) {
        let tuple = tuple.trim();
        let inner_text = tuple
            .strip_prefix('(')
            .and_then(|t| t.strip_suffix(')'))
            .ok_or_else(|| ConnectionError::Execute("malformed insert tuple".to_string()))?;
        let values: Vec<Value> = split_top_level_commas(inner_text)
            .into_iter()
            .map(|v| parse_literal(&v))
            .collect();
        if values.len() != columns.len() {
            return Err(ConnectionError::Execute(format!(
                "insert arity mismatch: {} columns, {} values",
                columns.len(),
                values.len()
            )));
        }
        new_rows.push(Row::from_pairs(
            columns.iter().cloned().zip(values).collect(),
        ));
    }

    let Some(rows) = state.tables.get_mut(&table) else {
        return Err(ConnectionError::Execute(format!("no such table: {table}")));
    };
    let count = new_rows.len() as u64;
    rows.extend(new_rows);
    Ok(count)
}

#[async_trait]
impl Connection for MemoryConnection {
    fn engine(&self) -> DatabaseEngine {
        self.engine
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, ConnectionError> {
        let rendered = Self::render(sql, params);
        {
            let mut inner = self.inner.lock();
            inner.statements.push(rendered.clone());
            if let Some((_, rows)) = inner
                .scripted
                .iter()
                .find(|(fragment, _)| rendered.contains(fragment.as_str()))
            {
                return Ok(rows.clone());
            }
        }
        self.run_select(&rendered)
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64, ConnectionError> {
        let rendered = Self::render(sql, params);
        self.inner.lock().statements.push(rendered.clone());
        self.run_statement(&rendered)
    }

    async fn begin(&self) -> Result<(), ConnectionError> {
        let mut inner = self.inner.lock();
        if inner.snapshot.is_some() {
            return Err(ConnectionError::Transaction(
                "transaction already open".to_string(),
            ));
        }
        inner.snapshot = Some(inner.state.clone());
        Ok(())
    }

    async fn commit(&self) -> Result<(), ConnectionError> {
        let mut inner = self.inner.lock();
        inner
            .snapshot
            .take()
            .ok_or_else(|| ConnectionError::Transaction("no open transaction".to_string()))?;
        Ok(())
    }

    async fn rollback(&self) -> Result<(), ConnectionError> {
        let mut inner = self.inner.lock();
        let snapshot = inner
            .snapshot
            .take()
            .ok_or_else(|| ConnectionError::Transaction("no open transaction".to_string()))?;
        inner.state = snapshot;
        Ok(())
    }
}
