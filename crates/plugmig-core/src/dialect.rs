//! SQL dialect adaptation.
//!
//! Steps carry their SQL as per-engine variants with a `universal` fallback
//! in canonical PostgreSQL-compatible syntax. When only the fallback is
//! available, a table of documented substitutions rewrites it for the
//! active engine. Unrecognized constructs pass through verbatim: the
//! adapter does not attempt full automatic translation.

use thiserror::Error;

use crate::engine::DatabaseEngine;
use crate::model::StepSql;

/// Dialect errors.
#[derive(Debug, Error)]
pub enum DialectError {
    /// No SQL variant or rewrite covers the requested engine.
    #[error("no SQL available for engine {engine}")]
    UnsupportedEngine {
        /// The uncovered engine.
        engine: DatabaseEngine,
    },
}

/// One documented substitution applied to universal SQL.
#[derive(Debug, Clone)]
struct RewriteRule {
    engine: DatabaseEngine,
    from: &'static str,
    to: &'static str,
}

/// Renders step SQL for a target engine.
#[derive(Debug)]
pub struct DialectAdapter {
    rules: Vec<RewriteRule>,
}

impl Default for DialectAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl DialectAdapter {
    /// Adapter with the standard rewrite table.
    pub fn new() -> Self {
        use DatabaseEngine::*;

        let mut rules = Vec::new();
        let mut rule = |engine, from, to| rules.push(RewriteRule { engine, from, to });

        // UUID generation.
        rule(MySql, "gen_random_uuid()", "UUID()");
        rule(Sqlite, "gen_random_uuid()", "(lower(hex(randomblob(16))))");
        rule(SqlServer, "gen_random_uuid()", "NEWID()");
        rule(Oracle, "gen_random_uuid()", "SYS_GUID()");

        // Current timestamp.
        rule(MySql, "now()", "CURRENT_TIMESTAMP");
        rule(Sqlite, "now()", "CURRENT_TIMESTAMP");
        rule(SqlServer, "now()", "SYSUTCDATETIME()");
        rule(Oracle, "now()", "SYSTIMESTAMP");

        // JSON column storage.
        rule(MySql, "JSONB", "JSON");
        rule(Sqlite, "JSONB", "TEXT");
        rule(SqlServer, "JSONB", "NVARCHAR(MAX)");
        rule(Oracle, "JSONB", "CLOB");

        // Boolean column storage.
        rule(MySql, "BOOLEAN", "TINYINT(1)");
        rule(Sqlite, "BOOLEAN", "INTEGER");
        rule(SqlServer, "BOOLEAN", "BIT");
        rule(Oracle, "BOOLEAN", "NUMBER(1)");

        Self { rules }
    }

    /// Render the statement for `engine`.
    ///
    /// Lookup order: exact engine override, then the universal fallback
    /// (rewritten for non-PostgreSQL engines), then failure.
    pub fn render(&self, sql: &StepSql, engine: DatabaseEngine) -> Result<String, DialectError> {
        if let Some(exact) = sql.overrides.get(&engine) {
            return Ok(exact.clone());
        }

        match &sql.universal {
            Some(universal) if engine == DatabaseEngine::Postgres => Ok(universal.clone()),
            Some(universal) => Ok(self.rewrite(universal, engine)),
            None => Err(DialectError::UnsupportedEngine { engine }),
        }
    }

    /// Apply the substitution table plus vector-type handling.
    fn rewrite(&self, sql: &str, engine: DatabaseEngine) -> String {
        let mut out = sql.to_string();
        for rule in self.rules.iter().filter(|r| r.engine == engine) {
            out = out.replace(rule.from, rule.to);
        }
        rewrite_vector_types(&out, engine)
    }

    /// Cosine-similarity expression between a vector column and a `?`
    /// parameter. PostgreSQL uses native vector operators; other engines
    /// fall back to their JSON/array functions over the JSON-encoded
    /// representation.
    pub fn cosine_similarity_sql(&self, engine: DatabaseEngine, column: &str) -> String {
        match engine {
            DatabaseEngine::Postgres => format!("1 - ({column} <=> ?::vector)"),
            DatabaseEngine::MySql => {
                format!("vector_cosine_distance(CAST({column} AS JSON), CAST(? AS JSON))")
            }
            DatabaseEngine::Sqlite => format!("vector_cosine(json({column}), json(?))"),
            DatabaseEngine::SqlServer => {
                format!("dbo.cosine_similarity(JSON_QUERY({column}), JSON_QUERY(?))")
            }
            DatabaseEngine::Oracle => {
                format!("cosine_similarity(JSON_VALUE({column}, '$'), JSON_VALUE(?, '$'))")
            }
        }
    }
}

/// Rewrite `vector(n)` column types for engines without native vector
/// support. PostgreSQL keeps the native type; everyone else stores a
/// JSON-encoded array in its JSON/text column type.
fn rewrite_vector_types(sql: &str, engine: DatabaseEngine) -> String {
    if engine == DatabaseEngine::Postgres {
        return sql.to_string();
    }

    let fallback = match engine {
        DatabaseEngine::MySql => "JSON",
        DatabaseEngine::Sqlite => "TEXT",
        DatabaseEngine::SqlServer => "NVARCHAR(MAX)",
        DatabaseEngine::Oracle => "CLOB",
        DatabaseEngine::Postgres => unreachable!(),
    };

    let lower = sql.to_lowercase();
    let mut out = String::with_capacity(sql.len());
    let mut pos = 0;
    while let Some(found) = lower[pos..].find("vector(") {
        let start = pos + found;
        let after_paren = start + "vector(".len();
        let close = match lower[after_paren..].find(')') {
            Some(c) => after_paren + c,
            None => break,
        };
        // Only a bare dimension counts as a vector type; anything else is
        // somebody's function call and passes through.
        let dims = &sql[after_paren..close];
        if !dims.trim().is_empty() && dims.trim().chars().all(|c| c.is_ascii_digit()) {
            out.push_str(&sql[pos..start]);
            out.push_str(fallback);
            pos = close + 1;
        } else {
            out.push_str(&sql[pos..close + 1]);
            pos = close + 1;
        }
    }
    out.push_str(&sql[pos..]);
    out
}
