//! Dependency resolution and conflict detection.
//!
//! Resolution operates on an immutable snapshot of applied migrations and
//! never touches the database: every error here is returned synchronously
//! with no side effects.

use chrono::Utc;
use semver::Version;
use thiserror::Error;

use crate::graph::DependencyGraph;
use crate::model::Migration;
use crate::plan::{MigrationPlan, PlanDirection};
use crate::registry::AppliedMigration;

/// Resolution failures.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// Two migrations selected for the same plan conflict.
    #[error("conflicting migrations: {first} and {second}")]
    Conflict {
        /// One side of the conflict.
        first: String,
        /// The other side.
        second: String,
    },

    /// A dependency names a migration that is neither applied nor available.
    #[error("migration {migration} depends on unknown migration {dependency}")]
    MissingDependency {
        /// The migration carrying the dependency.
        migration: String,
        /// The unresolvable dependency id.
        dependency: String,
    },

    /// The dependency graph contains a cycle.
    #[error("cyclic migration dependencies: {}", cycle.join(" -> "))]
    CyclicDependency {
        /// Members of the cycle, in edge order.
        cycle: Vec<String>,
    },

    /// An applied migration has no loaded definition (downgrade path).
    #[error("no definition loaded for applied migration {migration}")]
    MissingDefinition {
        /// The applied migration id.
        migration: String,
    },
}

/// Computes ordered plans from migration metadata.
pub struct DependencyResolver;

impl DependencyResolver {
    /// Resolve a plan for `plugin_id` from its applied snapshot toward
    /// `target`.
    ///
    /// A target below the installed version selects the reverse path: all
    /// applied migrations above the target, in descending applied order.
    pub fn resolve(
        plugin_id: &str,
        current_version: Option<&Version>,
        applied: &[AppliedMigration],
        available: &[Migration],
        target: &Version,
    ) -> Result<MigrationPlan, ResolveError> {
        let applied_snapshot: Vec<String> =
            applied.iter().map(|a| a.migration_id.clone()).collect();

        if let Some(current) = current_version {
            if target < current {
                return Self::resolve_down(
                    plugin_id,
                    current_version,
                    applied,
                    available,
                    target,
                    applied_snapshot,
                );
            }
        }

        Self::resolve_up(
            plugin_id,
            current_version,
            applied,
            available,
            target,
            applied_snapshot,
        )
    }

    fn resolve_up(
        plugin_id: &str,
        current_version: Option<&Version>,
        applied: &[AppliedMigration],
        available: &[Migration],
        target: &Version,
        applied_snapshot: Vec<String>,
    ) -> Result<MigrationPlan, ResolveError> {
        let applied_ids: std::collections::HashSet<&str> =
            applied.iter().map(|a| a.migration_id.as_str()).collect();

        // Window: not yet applied, at or below the target version.
        let mut selected: Vec<&Migration> = available
            .iter()
            .filter(|m| !applied_ids.contains(m.id.as_str()) && m.version <= *target)
            .collect();

        // Pull in transitive dependencies; dependency edges dominate the
        // version window.
        let mut cursor = 0;
        while cursor < selected.len() {
            let deps = selected[cursor].dependencies.clone();
            let from = selected[cursor].id.clone();
            cursor += 1;
            for dep in deps {
                if applied_ids.contains(dep.as_str())
                    || selected.iter().any(|m| m.id == dep)
                {
                    continue;
                }
                match available.iter().find(|m| m.id == dep) {
                    Some(found) => selected.push(found),
                    None => {
                        return Err(ResolveError::MissingDependency {
                            migration: from,
                            dependency: dep,
                        })
                    }
                }
            }
        }

        // Conflicts are symmetric: either side naming the other is fatal.
        for (i, a) in selected.iter().enumerate() {
            for b in &selected[i + 1..] {
                if a.conflicts.contains(&b.id) || b.conflicts.contains(&a.id) {
                    return Err(ResolveError::Conflict {
                        first: a.id.clone(),
                        second: b.id.clone(),
                    });
                }
            }
        }

        // Tie-break for unconstrained migrations: ascending semver, then id.
        selected.sort_by(|a, b| a.version.cmp(&b.version).then_with(|| a.id.cmp(&b.id)));

        let nodes: Vec<(String, Vec<String>)> = selected
            .iter()
            .map(|m| (m.id.clone(), m.dependencies.clone()))
            .collect();
        let order = DependencyGraph::new(&nodes)
            .topo_sort()
            .map_err(|cycle| ResolveError::CyclicDependency { cycle })?;

        let migrations = order
            .iter()
            .map(|id| {
                selected
                    .iter()
                    .find(|m| &m.id == id)
                    .map(|m| (*m).clone())
                    .expect("ordered id missing from selection")
            })
            .collect();

        Ok(MigrationPlan {
            plugin_id: plugin_id.to_string(),
            direction: PlanDirection::Up,
            migrations,
            current_version: current_version.cloned(),
            target_version: target.clone(),
            applied_snapshot,
            created_at: Utc::now(),
        })
    }

    fn resolve_down(
        plugin_id: &str,
        current_version: Option<&Version>,
        applied: &[AppliedMigration],
        available: &[Migration],
        target: &Version,
        applied_snapshot: Vec<String>,
    ) -> Result<MigrationPlan, ResolveError> {
        let mut entries: Vec<&AppliedMigration> =
            applied.iter().filter(|a| a.version > *target).collect();
        entries.sort_by(|a, b| b.applied_at.cmp(&a.applied_at));

        let mut migrations = Vec::with_capacity(entries.len());
        for entry in entries {
            let definition = available
                .iter()
                .find(|m| m.id == entry.migration_id)
                .ok_or_else(|| ResolveError::MissingDefinition {
                    migration: entry.migration_id.clone(),
                })?;
            migrations.push(definition.clone());
        }

        Ok(MigrationPlan {
            plugin_id: plugin_id.to_string(),
            direction: PlanDirection::Down,
            migrations,
            current_version: current_version.cloned(),
            target_version: target.clone(),
            applied_snapshot,
            created_at: Utc::now(),
        })
    }

    /// Pairwise conflicts among a set of migrations, without building a
    /// plan. Used by the conflict-report operation.
    pub fn detect_conflicts(migrations: &[Migration]) -> Vec<(String, String)> {
        let mut found = Vec::new();
        for (i, a) in migrations.iter().enumerate() {
            for b in &migrations[i + 1..] {
                if a.conflicts.contains(&b.id) || b.conflicts.contains(&a.id) {
                    found.push((a.id.clone(), b.id.clone()));
                }
            }
        }
        found
    }
}
