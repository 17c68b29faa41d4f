//! Migration definitions and authoring validation.

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::DatabaseEngine;
use crate::model::step::Step;

/// What a migration changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationType {
    /// Table/column DDL.
    Schema,
    /// Data movement or transformation.
    Data,
    /// Index management.
    Index,
    /// Stored functions.
    Function,
    /// Triggers.
    Trigger,
    /// Views.
    View,
    /// Database extensions.
    Extension,
    /// Grants and permissions.
    Permission,
}

/// Why a migration exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationCategory {
    /// First-time install.
    Install,
    /// Version upgrade.
    Upgrade,
    /// Bug-fix patch.
    Patch,
    /// New feature.
    Feature,
    /// Performance work.
    Performance,
    /// Security fix.
    Security,
    /// Housekeeping.
    Maintenance,
    /// Data migration between installations.
    Migration,
}

/// Risk classification of a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Additive, reversible change.
    Low,
    /// Touches existing data or structures.
    Medium,
    /// Destructive or hard to reverse.
    High,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
        }
    }
}

/// Forward and reverse step sequences.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepSequences {
    /// Steps applied to move forward.
    #[serde(default)]
    pub up: Vec<Step>,
    /// Steps applied to revert; each inverts the `up` step sharing its id.
    #[serde(default)]
    pub down: Vec<Step>,
}

/// Authoring errors detected when a migration is loaded.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// The migration declares no target engines.
    #[error("migration {migration}: no database engines declared")]
    NoEngines {
        /// Offending migration id.
        migration: String,
    },

    /// A step has neither universal SQL nor full engine coverage.
    #[error("migration {migration}: step {step} has no SQL for engine {engine}")]
    MissingSql {
        /// Offending migration id.
        migration: String,
        /// Offending step id.
        step: String,
        /// Engine without coverage.
        engine: DatabaseEngine,
    },

    /// Two steps share an id.
    #[error("migration {migration}: duplicate step id {step}")]
    DuplicateStepId {
        /// Offending migration id.
        migration: String,
        /// Duplicated step id.
        step: String,
    },

    /// A step depends on an id that names no sibling step.
    #[error("migration {migration}: step {step} depends on unknown step {dependency}")]
    UnknownStepDependency {
        /// Offending migration id.
        migration: String,
        /// Offending step id.
        step: String,
        /// Unknown dependency id.
        dependency: String,
    },

    /// A rollback-supported up step has no matching down step.
    #[error("migration {migration}: step {step} supports rollback but has no down step")]
    MissingDownStep {
        /// Offending migration id.
        migration: String,
        /// Offending step id.
        step: String,
    },

    /// A non-transactional step claims rollback support.
    #[error(
        "migration {migration}: step {step} is non-transactional and cannot support rollback"
    )]
    UnsafeStepFlags {
        /// Offending migration id.
        migration: String,
        /// Offending step id.
        step: String,
    },

    /// A migration depends on or conflicts with itself.
    #[error("migration {migration}: references itself in dependencies or conflicts")]
    SelfReference {
        /// Offending migration id.
        migration: String,
    },

    /// Step dependencies form a cycle.
    #[error("migration {migration}: step dependency cycle: {}", cycle.join(" -> "))]
    StepCycle {
        /// Offending migration id.
        migration: String,
        /// Members of the cycle.
        cycle: Vec<String>,
    },

    /// A data step carries neither SQL nor a transform.
    #[error("migration {migration}: data step {step} has neither SQL nor a transform")]
    EmptyDataStep {
        /// Offending migration id.
        migration: String,
        /// Offending step id.
        step: String,
    },
}

/// An immutable, versioned unit of change for one plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Migration {
    /// Globally unique id within the plugin.
    pub id: String,
    /// Owning plugin.
    pub plugin_id: String,
    /// Semantic version this migration belongs to.
    pub version: Version,
    /// Human-readable name.
    pub name: String,
    /// Longer description.
    #[serde(default)]
    pub description: String,
    /// What the migration changes.
    #[serde(rename = "type")]
    pub migration_type: MigrationType,
    /// Why the migration exists.
    pub category: MigrationCategory,
    /// Ids of migrations that must be applied first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    /// Ids of migrations this one cannot coexist with.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<String>,
    /// Risk classification.
    pub risk_level: RiskLevel,
    /// Whether a verified backup must exist before execution.
    #[serde(default)]
    pub requires_backup: bool,
    /// Engines the migration supports.
    pub database_engines: Vec<DatabaseEngine>,
    /// Rough duration estimate, surfaced in dry runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration: Option<String>,
    /// Tables this migration touches; drives the backup scope.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub affected_tables: Vec<String>,
    /// Forward and reverse step sequences.
    pub steps: StepSequences,
    /// Authoring timestamp.
    pub created_at: DateTime<Utc>,
    /// Last-modified timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Migration {
    /// Create a migration with defaults (schema/upgrade, low risk, all
    /// engines).
    pub fn new(id: impl Into<String>, plugin_id: impl Into<String>, version: Version) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            plugin_id: plugin_id.into(),
            version,
            name: String::new(),
            description: String::new(),
            migration_type: MigrationType::Schema,
            category: MigrationCategory::Upgrade,
            dependencies: Vec::new(),
            conflicts: Vec::new(),
            risk_level: RiskLevel::Low,
            requires_backup: false,
            database_engines: DatabaseEngine::ALL.to_vec(),
            estimated_duration: None,
            affected_tables: Vec::new(),
            steps: StepSequences::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set type and category.
    pub fn with_kind(mut self, migration_type: MigrationType, category: MigrationCategory) -> Self {
        self.migration_type = migration_type;
        self.category = category;
        self
    }

    /// Declare dependencies.
    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    /// Declare conflicts.
    pub fn with_conflicts(mut self, conflicts: Vec<String>) -> Self {
        self.conflicts = conflicts;
        self
    }

    /// Set the risk level; high risk without a backup gate logs a warning at
    /// validation time.
    pub fn with_risk(mut self, risk: RiskLevel, requires_backup: bool) -> Self {
        self.risk_level = risk;
        self.requires_backup = requires_backup;
        self
    }

    /// Restrict supported engines.
    pub fn with_engines(mut self, engines: Vec<DatabaseEngine>) -> Self {
        self.database_engines = engines;
        self
    }

    /// Declare the tables the migration touches.
    pub fn with_affected_tables(mut self, tables: Vec<String>) -> Self {
        self.affected_tables = tables;
        self
    }

    /// Append an up step.
    pub fn with_up_step(mut self, step: Step) -> Self {
        self.steps.up.push(step);
        self
    }

    /// Append a down step.
    pub fn with_down_step(mut self, step: Step) -> Self {
        self.steps.down.push(step);
        self
    }

    /// Tables the backup manager should snapshot before this migration:
    /// the declared affected tables plus any transform source/target.
    pub fn backup_scope(&self) -> Vec<String> {
        let mut scope = self.affected_tables.clone();
        for step in &self.steps.up {
            if let Some(transform) = &step.transform {
                scope.push(transform.source_table.clone());
                scope.push(transform.target_table.clone());
            }
        }
        scope.sort();
        scope.dedup();
        scope
    }

    /// Find the down step inverting the given up step id.
    pub fn down_step(&self, step_id: &str) -> Option<&Step> {
        self.steps.down.iter().find(|s| s.id == step_id)
    }

    /// Authoring validation, run once when the migration is loaded.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.database_engines.is_empty() {
            return Err(ValidationError::NoEngines {
                migration: self.id.clone(),
            });
        }

        if self.dependencies.contains(&self.id) || self.conflicts.contains(&self.id) {
            return Err(ValidationError::SelfReference {
                migration: self.id.clone(),
            });
        }

        let mut seen = std::collections::HashSet::new();
        for step in &self.steps.up {
            if !seen.insert(step.id.as_str()) {
                return Err(ValidationError::DuplicateStepId {
                    migration: self.id.clone(),
                    step: step.id.clone(),
                });
            }
        }

        for step in &self.steps.up {
            for dep in &step.dependencies {
                if !seen.contains(dep.as_str()) {
                    return Err(ValidationError::UnknownStepDependency {
                        migration: self.id.clone(),
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }

            if step.kind.is_data() && step.sql.is_empty() && step.transform.is_none() {
                return Err(ValidationError::EmptyDataStep {
                    migration: self.id.clone(),
                    step: step.id.clone(),
                });
            }

            if !step.sql.is_empty() || step.transform.is_none() {
                for engine in &self.database_engines {
                    if !step.sql.covers(*engine) {
                        return Err(ValidationError::MissingSql {
                            migration: self.id.clone(),
                            step: step.id.clone(),
                            engine: *engine,
                        });
                    }
                }
            }

            // A non-transactional step cannot be cleanly rolled back; the
            // combination is an authoring error, not a runtime guess.
            if !step.transactional && step.rollback_supported {
                return Err(ValidationError::UnsafeStepFlags {
                    migration: self.id.clone(),
                    step: step.id.clone(),
                });
            }

            if step.rollback_supported && self.down_step(&step.id).is_none() {
                return Err(ValidationError::MissingDownStep {
                    migration: self.id.clone(),
                    step: step.id.clone(),
                });
            }
        }

        let nodes: Vec<(String, Vec<String>)> = self
            .steps
            .up
            .iter()
            .map(|s| (s.id.clone(), s.dependencies.clone()))
            .collect();
        if let Err(cycle) = crate::graph::DependencyGraph::new(&nodes).topo_sort() {
            return Err(ValidationError::StepCycle {
                migration: self.id.clone(),
                cycle,
            });
        }

        if self.risk_level == RiskLevel::High && !self.requires_backup {
            tracing::warn!(
                migration = %self.id,
                "high-risk migration does not require a backup"
            );
        }

        Ok(())
    }
}
