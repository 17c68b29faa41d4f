//! Per-plugin execution locks.
//!
//! Structural changes to one plugin's schema must never interleave. The
//! registry hands out RAII guards keyed by plugin id; a second acquisition
//! is rejected, not queued. The guard releases on drop, so every exit path
//! (including panics) frees the lock.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;

/// Lock acquisition failure.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another plan is already executing for this plugin.
    #[error("a migration plan is already executing for plugin {plugin_id}")]
    AlreadyExecuting {
        /// The contested plugin.
        plugin_id: String,
    },
}

/// In-process lock registry keyed by plugin id.
#[derive(Debug, Default)]
pub struct PluginLockRegistry {
    held: DashMap<String, ()>,
}

impl PluginLockRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to acquire the lock for a plugin.
    pub fn try_acquire(self: &Arc<Self>, plugin_id: &str) -> Result<PluginLockGuard, LockError> {
        match self.held.entry(plugin_id.to_string()) {
            Entry::Occupied(_) => Err(LockError::AlreadyExecuting {
                plugin_id: plugin_id.to_string(),
            }),
            Entry::Vacant(vacant) => {
                vacant.insert(());
                Ok(PluginLockGuard {
                    registry: Arc::clone(self),
                    plugin_id: plugin_id.to_string(),
                })
            }
        }
    }

    /// Whether a plugin is currently locked.
    pub fn is_locked(&self, plugin_id: &str) -> bool {
        self.held.contains_key(plugin_id)
    }
}

/// Holds the per-plugin lock until dropped.
#[derive(Debug)]
pub struct PluginLockGuard {
    registry: Arc<PluginLockRegistry>,
    plugin_id: String,
}

impl PluginLockGuard {
    /// The locked plugin.
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }
}

impl Drop for PluginLockGuard {
    fn drop(&mut self) {
        self.registry.held.remove(&self.plugin_id);
    }
}
