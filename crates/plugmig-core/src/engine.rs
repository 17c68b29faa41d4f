//! Target database engines.

use serde::{Deserialize, Serialize};

/// Database engine a migration step can target.
///
/// The set is closed on purpose: per-engine SQL is keyed by this enum rather
/// than by free-form strings, so an unsupported-engine typo is caught when a
/// migration is loaded, not when it executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseEngine {
    /// PostgreSQL. Its syntax is also the canonical form for `universal` SQL.
    Postgres,
    /// MySQL / MariaDB.
    #[serde(rename = "mysql")]
    MySql,
    /// SQLite.
    Sqlite,
    /// Microsoft SQL Server.
    #[serde(rename = "sqlserver")]
    SqlServer,
    /// Oracle Database.
    Oracle,
}

impl DatabaseEngine {
    /// All supported engines.
    pub const ALL: [DatabaseEngine; 5] = [
        DatabaseEngine::Postgres,
        DatabaseEngine::MySql,
        DatabaseEngine::Sqlite,
        DatabaseEngine::SqlServer,
        DatabaseEngine::Oracle,
    ];

    /// Stable lowercase name, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseEngine::Postgres => "postgres",
            DatabaseEngine::MySql => "mysql",
            DatabaseEngine::Sqlite => "sqlite",
            DatabaseEngine::SqlServer => "sqlserver",
            DatabaseEngine::Oracle => "oracle",
        }
    }
}

impl std::fmt::Display for DatabaseEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
