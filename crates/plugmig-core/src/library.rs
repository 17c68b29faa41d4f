//! In-memory store of loaded migration definitions.

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::model::{Migration, ValidationError};

/// Loaded migration definitions, grouped by plugin.
///
/// Definitions are authored outside the runtime and registered here at load
/// time; registration runs authoring validation once, so the resolver and
/// executor can assume well-formed migrations.
#[derive(Debug, Default)]
pub struct MigrationLibrary {
    by_plugin: RwLock<HashMap<String, Vec<Migration>>>,
}

impl MigrationLibrary {
    /// Create an empty library.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a migration. Re-registering an id replaces the
    /// previous definition.
    pub fn register(&self, migration: Migration) -> Result<(), ValidationError> {
        migration.validate()?;
        let mut by_plugin = self.by_plugin.write();
        let list = by_plugin.entry(migration.plugin_id.clone()).or_default();
        list.retain(|m| m.id != migration.id);
        list.push(migration);
        Ok(())
    }

    /// All migrations available for a plugin.
    pub fn for_plugin(&self, plugin_id: &str) -> Vec<Migration> {
        self.by_plugin
            .read()
            .get(plugin_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Look up one migration by plugin and id.
    pub fn get(&self, plugin_id: &str, migration_id: &str) -> Option<Migration> {
        self.by_plugin
            .read()
            .get(plugin_id)?
            .iter()
            .find(|m| m.id == migration_id)
            .cloned()
    }

    /// Whether a migration id is registered for a plugin.
    pub fn contains(&self, plugin_id: &str, migration_id: &str) -> bool {
        self.get(plugin_id, migration_id).is_some()
    }
}
