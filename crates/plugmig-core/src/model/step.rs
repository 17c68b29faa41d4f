//! Executable migration steps.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::DatabaseEngine;
use crate::model::mapping::TransformSpec;

/// What kind of change a step makes. Mirrors the migration-level type set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    /// DDL against tables/columns.
    Schema,
    /// Data movement or transformation.
    Data,
    /// Index creation or removal.
    Index,
    /// Stored function definition.
    Function,
    /// Trigger definition.
    Trigger,
    /// View definition.
    View,
    /// Database extension management.
    Extension,
    /// Grants and permissions.
    Permission,
}

impl StepKind {
    /// Data steps with a transform attached are routed to the transform
    /// engine; everything else goes through the dialect adapter.
    pub fn is_data(&self) -> bool {
        matches!(self, StepKind::Data)
    }
}

/// Per-engine SQL variants for one step.
///
/// Keyed by the closed [`DatabaseEngine`] enum, never by open strings. A
/// step must carry either a `universal` statement (canonical
/// PostgreSQL-compatible syntax) or an override for every engine its parent
/// migration declares; [`crate::model::Migration::validate`] enforces this.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepSql {
    /// Canonical fallback statement, assumed PostgreSQL-compatible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub universal: Option<String>,
    /// Engine-specific overrides.
    #[serde(flatten)]
    pub overrides: BTreeMap<DatabaseEngine, String>,
}

impl StepSql {
    /// A statement in canonical universal syntax.
    pub fn universal(sql: impl Into<String>) -> Self {
        Self {
            universal: Some(sql.into()),
            overrides: BTreeMap::new(),
        }
    }

    /// Add an engine-specific override.
    pub fn with_override(mut self, engine: DatabaseEngine, sql: impl Into<String>) -> Self {
        self.overrides.insert(engine, sql.into());
        self
    }

    /// Whether no statement is present at all (pure-transform steps).
    pub fn is_empty(&self) -> bool {
        self.universal.is_none() && self.overrides.is_empty()
    }

    /// Whether the step can be rendered for `engine`.
    pub fn covers(&self, engine: DatabaseEngine) -> bool {
        self.universal.is_some() || self.overrides.contains_key(&engine)
    }
}

/// Post-execution sanity expectations. Mismatches are logged, never fatal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedChanges {
    /// Expected affected row count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u64>,
    /// Expected number of tables touched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tables: Option<u64>,
    /// Expected number of indexes touched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexes: Option<u64>,
}

/// One executable unit inside a migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Step id, unique within the migration. `down` steps reuse the id of
    /// the `up` step they invert.
    pub id: String,
    /// Step kind, used for routing.
    #[serde(rename = "type")]
    pub kind: StepKind,
    /// Human-readable name.
    pub name: String,
    /// Per-engine SQL.
    #[serde(default, skip_serializing_if = "StepSql::is_empty")]
    pub sql: StepSql,
    /// Batched data transform, for data steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<TransformSpec>,
    /// Whether the step runs inside a transaction. Non-transactional steps
    /// cannot be undone by rollback; the executor surfaces a warning.
    #[serde(default = "default_true")]
    pub transactional: bool,
    /// Whether a semantically inverse `down` step exists.
    #[serde(default)]
    pub rollback_supported: bool,
    /// On failure, log and continue instead of rolling back the migration.
    #[serde(default)]
    pub skip_on_error: bool,
    /// Per-step timeout in milliseconds.
    #[serde(rename = "timeout", default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Ids of sibling steps that must run first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    /// SQL predicate evaluated before execution; a non-empty result passes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_validation: Option<String>,
    /// SQL predicate evaluated after execution; a non-empty result passes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_validation: Option<String>,
    /// Post-execution sanity expectations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_changes: Option<ExpectedChanges>,
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl Step {
    /// Create a step with defaults: transactional, 30s timeout, no rollback.
    pub fn new(id: impl Into<String>, kind: StepKind, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            name: name.into(),
            sql: StepSql::default(),
            transform: None,
            transactional: true,
            rollback_supported: false,
            skip_on_error: false,
            timeout_ms: default_timeout_ms(),
            dependencies: Vec::new(),
            pre_validation: None,
            post_validation: None,
            expected_changes: None,
        }
    }

    /// Set the SQL variants.
    pub fn with_sql(mut self, sql: StepSql) -> Self {
        self.sql = sql;
        self
    }

    /// Attach a data transform.
    pub fn with_transform(mut self, transform: TransformSpec) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Mark rollback as supported (a matching `down` step must exist).
    pub fn with_rollback(mut self) -> Self {
        self.rollback_supported = true;
        self
    }

    /// Declare sibling steps that must run first.
    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    /// Mark the step non-transactional.
    pub fn non_transactional(mut self) -> Self {
        self.transactional = false;
        self
    }

    /// Continue past failures of this step.
    pub fn skip_on_error(mut self) -> Self {
        self.skip_on_error = true;
        self
    }

    /// Set the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the pre-execution validation predicate.
    pub fn with_pre_validation(mut self, sql: impl Into<String>) -> Self {
        self.pre_validation = Some(sql.into());
        self
    }

    /// Set the post-execution validation predicate.
    pub fn with_post_validation(mut self, sql: impl Into<String>) -> Self {
        self.post_validation = Some(sql.into());
        self
    }

    /// The step timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_defaults() {
        let step = Step::new("s1", StepKind::Schema, "create table");
        assert!(step.transactional);
        assert!(!step.rollback_supported);
        assert_eq!(step.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_step_sql_coverage() {
        let sql = StepSql::universal("CREATE TABLE t (id TEXT)");
        assert!(sql.covers(DatabaseEngine::Oracle));

        let sql = StepSql::default().with_override(DatabaseEngine::MySql, "SELECT 1");
        assert!(sql.covers(DatabaseEngine::MySql));
        assert!(!sql.covers(DatabaseEngine::Sqlite));
    }

    #[test]
    fn test_step_sql_serde_flattens_engines() {
        let sql = StepSql::universal("SELECT 1").with_override(DatabaseEngine::MySql, "SELECT 2");
        let json = serde_json::to_value(&sql).unwrap();
        assert_eq!(json["universal"], "SELECT 1");
        assert_eq!(json["mysql"], "SELECT 2");

        let back: StepSql = serde_json::from_value(json).unwrap();
        assert_eq!(back, sql);
    }

    #[test]
    fn test_step_serde_round_trip() {
        let step = Step::new("s1", StepKind::Index, "add index")
            .with_sql(StepSql::universal("CREATE INDEX IF NOT EXISTS i ON t (c)"))
            .with_rollback()
            .with_timeout(Duration::from_secs(5));
        let json = serde_json::to_string(&step).unwrap();
        assert!(json.contains("\"type\":\"index\""));
        assert!(json.contains("\"timeout\":5000"));

        let back: Step = serde_json::from_str(&json).unwrap();
        assert_eq!(back, step);
    }
}
