//! Backup manager: create, verify, restore, prune.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use plugmig_core::{BackupGate, BackupGateError, Connection};

use crate::error::BackupError;
use crate::snapshot::{self, SnapshotPayload};

/// How long backups are kept, independent of migration history.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    /// Keep at most N verified backups per plugin. None means unlimited.
    pub max_backups_per_plugin: Option<usize>,
    /// Drop backups older than this. None means keep forever.
    pub max_age: Option<Duration>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_backups_per_plugin: Some(10), // Keep the last 10 per plugin
            max_age: None,                    // Keep forever by default
        }
    }
}

impl RetentionPolicy {
    /// Keep every backup forever.
    pub fn keep_all() -> Self {
        Self {
            max_backups_per_plugin: None,
            max_age: None,
        }
    }

    /// Set the per-plugin cap.
    pub fn max_backups(mut self, max: usize) -> Self {
        self.max_backups_per_plugin = Some(max);
        self
    }

    /// Set the maximum age.
    pub fn max_age(mut self, age: Duration) -> Self {
        self.max_age = Some(age);
        self
    }
}

/// A verified snapshot reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    /// Backup id.
    pub id: String,
    /// The plugin the backup covers.
    pub plugin_id: String,
    /// Tables included in the snapshot.
    pub scope: Vec<String>,
    /// When the backup was taken.
    pub created_at: DateTime<Utc>,
    /// Object-store location of the payload.
    pub storage_location: String,
    /// Whether verification succeeded; only restorable backups satisfy the
    /// gate.
    pub restorable: bool,
    /// SHA-256 checksum of the stored payload.
    pub checksum: String,
    /// Row counts per table at snapshot time.
    pub row_counts: BTreeMap<String, u64>,
}

/// Snapshots tables before gated migrations and restores them on demand.
///
/// Storage is append-only per backup id: once verified, neither the payload
/// nor the manifest is rewritten.
pub struct BackupManager {
    store: Arc<dyn ObjectStore>,
    prefix: Path,
    page_size: usize,
    policy: RetentionPolicy,
    index: DashMap<String, Backup>,
}

impl BackupManager {
    /// Manager over an object store with the default retention policy.
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            prefix: Path::from("backups"),
            page_size: 1000,
            policy: RetentionPolicy::default(),
            index: DashMap::new(),
        }
    }

    /// Set the retention policy.
    pub fn with_policy(mut self, policy: RetentionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the key prefix inside the store.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Path::from(prefix.into());
        self
    }

    fn payload_path(&self, plugin_id: &str, backup_id: &str) -> Path {
        self.prefix
            .child(plugin_id)
            .child(backup_id)
            .child("data.gz")
    }

    fn manifest_path(&self, plugin_id: &str, backup_id: &str) -> Path {
        self.prefix
            .child(plugin_id)
            .child(backup_id)
            .child("manifest.json")
    }

    /// Snapshot `scope`, store it, and verify the stored bytes. The backup
    /// is only usable once verification passes; callers gate destructive
    /// steps on the returned record.
    pub async fn create_backup(
        &self,
        conn: &dyn Connection,
        plugin_id: &str,
        scope: &[String],
    ) -> Result<Backup, BackupError> {
        let backup_id = generate_backup_id();
        let payload = SnapshotPayload::dump(conn, plugin_id, scope, self.page_size).await?;
        let row_counts = payload.row_counts();
        let (bytes, checksum) = snapshot::encode(&payload)?;

        let payload_path = self.payload_path(plugin_id, &backup_id);
        self.store
            .put(&payload_path, PutPayload::from(bytes))
            .await?;

        let mut backup = Backup {
            id: backup_id.clone(),
            plugin_id: plugin_id.to_string(),
            scope: scope.to_vec(),
            created_at: Utc::now(),
            storage_location: payload_path.to_string(),
            restorable: false,
            checksum,
            row_counts,
        };

        // Read back and verify before anything is allowed to depend on it.
        self.verify(&backup).await?;
        backup.restorable = true;

        let manifest = serde_json::to_vec(&backup)
            .map_err(|e| BackupError::Serialization(e.to_string()))?;
        self.store
            .put(
                &self.manifest_path(plugin_id, &backup_id),
                PutPayload::from(manifest),
            )
            .await?;

        tracing::info!(
            plugin = plugin_id,
            backup = %backup.id,
            tables = backup.scope.len(),
            "backup created and verified"
        );

        self.index.insert(backup.id.clone(), backup.clone());
        self.prune(plugin_id).await?;
        Ok(backup)
    }

    /// Re-read the stored payload and check checksum and row counts.
    pub async fn verify(&self, backup: &Backup) -> Result<(), BackupError> {
        let path = Path::from(backup.storage_location.clone());
        let stored = self.store.get(&path).await?.bytes().await?;

        if snapshot::checksum(&stored) != backup.checksum {
            return Err(BackupError::VerificationFailed {
                backup_id: backup.id.clone(),
                reason: "checksum mismatch".to_string(),
            });
        }

        let payload = snapshot::decode(&stored).map_err(|e| BackupError::VerificationFailed {
            backup_id: backup.id.clone(),
            reason: e.to_string(),
        })?;
        if payload.row_counts() != backup.row_counts {
            return Err(BackupError::VerificationFailed {
                backup_id: backup.id.clone(),
                reason: "row counts changed".to_string(),
            });
        }

        Ok(())
    }

    /// Restore a backup's tables through the connection.
    pub async fn restore(&self, conn: &dyn Connection, backup_id: &str) -> Result<(), BackupError> {
        let backup = self.get(backup_id).ok_or_else(|| BackupError::NotFound {
            backup_id: backup_id.to_string(),
        })?;
        if !backup.restorable {
            return Err(BackupError::NotRestorable {
                backup_id: backup_id.to_string(),
            });
        }

        self.verify(&backup).await?;
        let stored = self
            .store
            .get(&Path::from(backup.storage_location.clone()))
            .await?
            .bytes()
            .await?;
        let payload = snapshot::decode(&stored)?;
        payload.restore(conn).await?;

        tracing::info!(backup = backup_id, "backup restored");
        Ok(())
    }

    /// A known backup by id.
    pub fn get(&self, backup_id: &str) -> Option<Backup> {
        self.index.get(backup_id).map(|b| b.clone())
    }

    /// Known backups for a plugin, newest first.
    pub fn list(&self, plugin_id: &str) -> Vec<Backup> {
        let mut backups: Vec<Backup> = self
            .index
            .iter()
            .filter(|entry| entry.plugin_id == plugin_id)
            .map(|entry| entry.clone())
            .collect();
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        backups
    }

    /// Apply the retention policy for a plugin, deleting expired backups
    /// oldest first. Returns the removed ids.
    pub async fn prune(&self, plugin_id: &str) -> Result<Vec<String>, BackupError> {
        let backups = self.list(plugin_id);
        let mut expired: Vec<&Backup> = Vec::new();

        if let Some(max) = self.policy.max_backups_per_plugin {
            expired.extend(backups.iter().skip(max));
        }
        if let Some(max_age) = self.policy.max_age {
            let cutoff = Utc::now() - max_age;
            expired.extend(backups.iter().filter(|b| b.created_at < cutoff));
        }

        let mut removed = Vec::new();
        for backup in expired {
            if removed.contains(&backup.id) {
                continue;
            }
            self.store
                .delete(&self.payload_path(&backup.plugin_id, &backup.id))
                .await?;
            self.store
                .delete(&self.manifest_path(&backup.plugin_id, &backup.id))
                .await?;
            self.index.remove(&backup.id);
            removed.push(backup.id.clone());
        }

        if !removed.is_empty() {
            tracing::debug!(plugin = plugin_id, count = removed.len(), "pruned backups");
        }
        Ok(removed)
    }

    /// Rebuild the in-memory index from stored manifests. Used on startup.
    pub async fn reload_index(&self) -> Result<usize, BackupError> {
        let mut listing = self.store.list(Some(&self.prefix));
        let mut loaded = 0usize;
        while let Some(meta) = listing.try_next().await? {
            if !meta.location.to_string().ends_with("manifest.json") {
                continue;
            }
            let bytes = self.store.get(&meta.location).await?.bytes().await?;
            let backup: Backup = serde_json::from_slice(&bytes)
                .map_err(|e| BackupError::Serialization(e.to_string()))?;
            self.index.insert(backup.id.clone(), backup);
            loaded += 1;
        }
        Ok(loaded)
    }
}

/// Timestamp-derived backup id with a process-local sequence to keep ids
/// unique under rapid creation.
fn generate_backup_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static SEQUENCE: AtomicU64 = AtomicU64::new(0);

    let micros = Utc::now().timestamp_micros() as u64;
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("bkp-{micros:016x}-{seq:04x}")
}

#[async_trait]
impl BackupGate for BackupManager {
    async fn create_verified_backup(
        &self,
        conn: &dyn Connection,
        plugin_id: &str,
        scope: &[String],
    ) -> Result<String, BackupGateError> {
        self.create_backup(conn, plugin_id, scope)
            .await
            .map(|backup| backup.id)
            .map_err(|e| BackupGateError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use plugmig_core::{MemoryConnection, Row, Value};

    fn row(pairs: &[(&str, Value)]) -> Row {
        Row::from_pairs(
            pairs
                .iter()
                .map(|(name, value)| (name.to_string(), value.clone()))
                .collect(),
        )
    }

    fn seeded() -> MemoryConnection {
        MemoryConnection::default().with_table(
            "users",
            vec![
                row(&[("id", Value::Integer(1)), ("name", Value::Text("a".into()))]),
                row(&[("id", Value::Integer(2)), ("name", Value::Text("b".into()))]),
            ],
        )
    }

    fn manager() -> BackupManager {
        BackupManager::new(Arc::new(InMemory::new()))
    }

    #[tokio::test]
    async fn test_create_verify_restore() {
        let conn = seeded();
        let manager = manager();

        let backup = manager
            .create_backup(&conn, "p", &["users".to_string()])
            .await
            .unwrap();
        assert!(backup.restorable);
        assert_eq!(backup.row_counts.get("users"), Some(&2));

        conn.execute("DELETE FROM users", &[]).await.unwrap();
        assert!(conn.table("users").is_empty());

        manager.restore(&conn, &backup.id).await.unwrap();
        assert_eq!(conn.table("users").len(), 2);
    }

    #[tokio::test]
    async fn test_tampered_payload_fails_verification() {
        let conn = seeded();
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let manager = BackupManager::new(Arc::clone(&store));

        let backup = manager
            .create_backup(&conn, "p", &["users".to_string()])
            .await
            .unwrap();

        store
            .put(
                &Path::from(backup.storage_location.clone()),
                PutPayload::from(b"garbage".to_vec()),
            )
            .await
            .unwrap();

        assert!(matches!(
            manager.verify(&backup).await,
            Err(BackupError::VerificationFailed { .. })
        ));
        assert!(matches!(
            manager.restore(&conn, &backup.id).await,
            Err(BackupError::VerificationFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_restore_unknown_backup() {
        let conn = seeded();
        assert!(matches!(
            manager().restore(&conn, "nope").await,
            Err(BackupError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_retention_prunes_oldest() {
        let conn = seeded();
        let manager = manager().with_policy(RetentionPolicy::default().max_backups(1));

        let first = manager
            .create_backup(&conn, "p", &["users".to_string()])
            .await
            .unwrap();
        let second = manager
            .create_backup(&conn, "p", &["users".to_string()])
            .await
            .unwrap();

        let remaining = manager.list("p");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, second.id);
        assert!(manager.get(&first.id).is_none());
    }

    #[tokio::test]
    async fn test_reload_index_from_manifests() {
        let conn = seeded();
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());

        let backup = {
            let manager = BackupManager::new(Arc::clone(&store));
            manager
                .create_backup(&conn, "p", &["users".to_string()])
                .await
                .unwrap()
        };

        let fresh = BackupManager::new(store);
        assert!(fresh.get(&backup.id).is_none());
        assert_eq!(fresh.reload_index().await.unwrap(), 1);
        assert!(fresh.get(&backup.id).is_some());
    }

    #[tokio::test]
    async fn test_local_filesystem_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = object_store::local::LocalFileSystem::new_with_prefix(dir.path()).unwrap();
        let conn = seeded();
        let manager = BackupManager::new(Arc::new(store));

        let backup = manager
            .create_backup(&conn, "p", &["users".to_string()])
            .await
            .unwrap();
        conn.execute("DELETE FROM users", &[]).await.unwrap();
        manager.restore(&conn, &backup.id).await.unwrap();
        assert_eq!(conn.table("users").len(), 2);
    }

    #[tokio::test]
    async fn test_empty_scope_is_allowed() {
        let conn = seeded();
        let backup = manager().create_backup(&conn, "p", &[]).await.unwrap();
        assert!(backup.restorable);
        assert!(backup.row_counts.is_empty());
    }
}
