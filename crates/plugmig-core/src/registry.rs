//! Plugin registry contract: applied migrations and installed versions.
//!
//! The registry is a collaborator owned by the host's plugin lifecycle
//! manager. The engine reads an immutable snapshot at plan-build time and
//! writes back applied/removed migrations as plans execute.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Record of one applied migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedMigration {
    /// The migration id.
    pub migration_id: String,
    /// Version the migration belongs to.
    pub version: Version,
    /// When it was applied; drives descending order for downgrades.
    pub applied_at: DateTime<Utc>,
    /// Backup taken before execution, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
}

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Backing-store failure.
    #[error("registry error: {0}")]
    Backend(String),
}

/// Applied-migration bookkeeping per plugin.
#[async_trait]
pub trait PluginRegistry: Send + Sync {
    /// Currently installed version of a plugin, if any.
    async fn current_version(&self, plugin_id: &str) -> Result<Option<Version>, RegistryError>;

    /// Applied migrations for a plugin, in applied order.
    async fn applied(&self, plugin_id: &str) -> Result<Vec<AppliedMigration>, RegistryError>;

    /// Record an applied migration.
    async fn record_applied(
        &self,
        plugin_id: &str,
        entry: AppliedMigration,
    ) -> Result<(), RegistryError>;

    /// Remove an applied migration (downgrade path).
    async fn remove_applied(
        &self,
        plugin_id: &str,
        migration_id: &str,
    ) -> Result<(), RegistryError>;

    /// Update the installed version after a successful plan.
    async fn set_current_version(
        &self,
        plugin_id: &str,
        version: Option<Version>,
    ) -> Result<(), RegistryError>;
}

#[derive(Debug, Default)]
struct PluginState {
    version: Option<Version>,
    applied: Vec<AppliedMigration>,
}

/// In-process registry implementation.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    plugins: RwLock<HashMap<String, PluginState>>,
}

impl MemoryRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PluginRegistry for MemoryRegistry {
    async fn current_version(&self, plugin_id: &str) -> Result<Option<Version>, RegistryError> {
        Ok(self
            .plugins
            .read()
            .get(plugin_id)
            .and_then(|state| state.version.clone()))
    }

    async fn applied(&self, plugin_id: &str) -> Result<Vec<AppliedMigration>, RegistryError> {
        Ok(self
            .plugins
            .read()
            .get(plugin_id)
            .map(|state| state.applied.clone())
            .unwrap_or_default())
    }

    async fn record_applied(
        &self,
        plugin_id: &str,
        entry: AppliedMigration,
    ) -> Result<(), RegistryError> {
        let mut plugins = self.plugins.write();
        let state = plugins.entry(plugin_id.to_string()).or_default();
        state.applied.retain(|a| a.migration_id != entry.migration_id);
        state.applied.push(entry);
        Ok(())
    }

    async fn remove_applied(
        &self,
        plugin_id: &str,
        migration_id: &str,
    ) -> Result<(), RegistryError> {
        let mut plugins = self.plugins.write();
        if let Some(state) = plugins.get_mut(plugin_id) {
            state.applied.retain(|a| a.migration_id != migration_id);
        }
        Ok(())
    }

    async fn set_current_version(
        &self,
        plugin_id: &str,
        version: Option<Version>,
    ) -> Result<(), RegistryError> {
        let mut plugins = self.plugins.write();
        plugins.entry(plugin_id.to_string()).or_default().version = version;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, version: Version) -> AppliedMigration {
        AppliedMigration {
            migration_id: id.to_string(),
            version,
            applied_at: Utc::now(),
            backup_id: None,
        }
    }

    #[tokio::test]
    async fn test_record_and_read_back() {
        let registry = MemoryRegistry::new();
        registry
            .record_applied("p", entry("m1", Version::new(1, 0, 0)))
            .await
            .unwrap();
        registry
            .set_current_version("p", Some(Version::new(1, 0, 0)))
            .await
            .unwrap();

        let applied = registry.applied("p").await.unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].migration_id, "m1");
        assert_eq!(
            registry.current_version("p").await.unwrap(),
            Some(Version::new(1, 0, 0))
        );
    }

    #[tokio::test]
    async fn test_remove_applied() {
        let registry = MemoryRegistry::new();
        registry
            .record_applied("p", entry("m1", Version::new(1, 0, 0)))
            .await
            .unwrap();
        registry.remove_applied("p", "m1").await.unwrap();
        assert!(registry.applied("p").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_plugin_is_empty() {
        let registry = MemoryRegistry::new();
        assert!(registry.applied("nope").await.unwrap().is_empty());
        assert_eq!(registry.current_version("nope").await.unwrap(), None);
    }
}
