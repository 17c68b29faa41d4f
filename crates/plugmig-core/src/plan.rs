//! Migration plans and the plan builder.
//!
//! A plan is transient: computed per request from an immutable snapshot of
//! the registry, executed, and discarded. It is never persisted beyond the
//! audit trail the executor produces.

use chrono::{DateTime, Utc};
use semver::Version;
use thiserror::Error;

use crate::library::MigrationLibrary;
use crate::model::Migration;
use crate::registry::{PluginRegistry, RegistryError};
use crate::resolver::{DependencyResolver, ResolveError};

/// Whether a plan applies or reverts migrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanDirection {
    /// Apply `up` steps.
    Up,
    /// Apply `down` steps (downgrade).
    Down,
}

impl std::fmt::Display for PlanDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanDirection::Up => write!(f, "up"),
            PlanDirection::Down => write!(f, "down"),
        }
    }
}

/// An ordered, resolved list of migrations for one plugin.
#[derive(Debug, Clone)]
pub struct MigrationPlan {
    /// The plugin the plan belongs to.
    pub plugin_id: String,
    /// Apply or revert.
    pub direction: PlanDirection,
    /// Migrations in execution order.
    pub migrations: Vec<Migration>,
    /// Installed version when the plan was built.
    pub current_version: Option<Version>,
    /// Version the plan moves the plugin to.
    pub target_version: Version,
    /// Applied migration ids at build time; the executor re-validates
    /// against this snapshot before each migration.
    pub applied_snapshot: Vec<String>,
    /// When the plan was built.
    pub created_at: DateTime<Utc>,
}

impl MigrationPlan {
    /// Whether the plan has no migrations.
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    /// Migration ids in execution order.
    pub fn migration_ids(&self) -> Vec<&str> {
        self.migrations.iter().map(|m| m.id.as_str()).collect()
    }
}

/// Plan-building errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// Resolution failed.
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// Registry access failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Builds plans from the loaded library and a registry snapshot.
pub struct PlanBuilder<'a> {
    library: &'a MigrationLibrary,
    registry: &'a dyn PluginRegistry,
}

impl<'a> PlanBuilder<'a> {
    /// Create a builder over a library and registry.
    pub fn new(library: &'a MigrationLibrary, registry: &'a dyn PluginRegistry) -> Self {
        Self { library, registry }
    }

    /// Build a plan moving `plugin_id` from its installed version to
    /// `target`. Target below the installed version yields a downgrade
    /// plan.
    pub async fn build(
        &self,
        plugin_id: &str,
        target: &Version,
    ) -> Result<MigrationPlan, PlanError> {
        let current = self.registry.current_version(plugin_id).await?;
        let applied = self.registry.applied(plugin_id).await?;
        let available = self.library.for_plugin(plugin_id);

        let plan = DependencyResolver::resolve(
            plugin_id,
            current.as_ref(),
            &applied,
            &available,
            target,
        )?;

        tracing::info!(
            plugin = plugin_id,
            direction = %plan.direction,
            migrations = plan.migrations.len(),
            target = %target,
            "resolved migration plan"
        );

        Ok(plan)
    }
}
