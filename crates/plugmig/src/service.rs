//! The migration service facade.
//!
//! Wires the resolver, executor, backup manager, and portable packaging
//! into the surface the host's HTTP/CLI layer consumes. The service owns
//! the per-plugin lock registry: the lock is taken before a plan is built
//! and released when execution finishes, on every exit path.

use std::sync::Arc;

use semver::Version;
use thiserror::Error;

use plugmig_backup::{Backup, BackupError, BackupManager};
use plugmig_core::{
    AppliedMigration, BackupGate, Connection, DependencyResolver, ExecuteError, ExecuteOptions,
    ExecutionResult, LockError, Migration, MigrationExecutor, MigrationLibrary, MigrationPlan,
    PlanBuilder, PlanError, PluginLockRegistry, PluginRegistry, RegistryError, TransformEngine,
    TransformOptions, TransformRegistry, ValidationError,
};
use plugmig_portable::{
    export_package, import_package, ExportOptions, ImportOptions, ImportResult, PortableError,
};

/// Facade errors.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Plan building failed.
    #[error(transparent)]
    Plan(#[from] PlanError),

    /// Execution failed fatally (stale plan, failed rollback).
    #[error(transparent)]
    Execute(#[from] ExecuteError),

    /// The plugin is already executing a plan.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Export/import failed.
    #[error(transparent)]
    Portable(#[from] PortableError),

    /// Backup access failed.
    #[error(transparent)]
    Backup(#[from] BackupError),

    /// Registry access failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A migration failed authoring validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// An operation needing the backup manager ran without one configured.
    #[error("no backup manager configured")]
    NoBackupManager,
}

/// A detected conflict between two registered migrations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    /// One side of the conflict.
    pub first: String,
    /// The other side.
    pub second: String,
}

/// Applied and pending migrations for one plugin.
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    /// Installed version, if any.
    pub current_version: Option<Version>,
    /// Applied migrations, in applied order.
    pub applied: Vec<AppliedMigration>,
    /// Registered-but-unapplied migration ids, ascending by version then id.
    pub pending: Vec<String>,
}

/// Import behavior beyond the package-level options.
#[derive(Debug, Clone, Default)]
pub struct ImportServiceOptions {
    /// Package-level options (overwrite, error handling, batching).
    pub package: PackageImportOptions,
    /// Execute the registered migrations through the normal plan path
    /// before importing data rows.
    pub apply_migrations: bool,
    /// Execution options used when applying.
    pub execute: ExecuteOptions,
}

/// Package-level import options the service exposes.
#[derive(Debug, Clone)]
pub struct PackageImportOptions {
    /// Clear target tables before writing.
    pub overwrite: bool,
    /// Record failures and continue.
    pub skip_errors: bool,
    /// Rows per write batch.
    pub batch_size: usize,
}

impl Default for PackageImportOptions {
    fn default() -> Self {
        Self {
            overwrite: false,
            skip_errors: false,
            batch_size: 1000,
        }
    }
}

/// Outcome of an import, including any executed migrations.
#[derive(Debug)]
pub struct ImportReport {
    /// Registration and row accounting.
    pub result: ImportResult,
    /// Execution results, when migrations were applied.
    pub execution: Vec<ExecutionResult>,
}

/// The engine's service surface.
pub struct MigrationService {
    conn: Arc<dyn Connection>,
    library: Arc<MigrationLibrary>,
    registry: Arc<dyn PluginRegistry>,
    locks: Arc<PluginLockRegistry>,
    backups: Option<Arc<BackupManager>>,
    transform_registry: TransformRegistry,
    transform_options: TransformOptions,
}

impl MigrationService {
    /// Service over a connection, migration library, and plugin registry.
    pub fn new(
        conn: Arc<dyn Connection>,
        library: Arc<MigrationLibrary>,
        registry: Arc<dyn PluginRegistry>,
    ) -> Self {
        Self {
            conn,
            library,
            registry,
            locks: Arc::new(PluginLockRegistry::new()),
            backups: None,
            transform_registry: TransformRegistry::new(),
            transform_options: TransformOptions::default(),
        }
    }

    /// Wire in the backup manager; backup-gated migrations fail without
    /// one.
    pub fn with_backups(mut self, backups: Arc<BackupManager>) -> Self {
        self.backups = Some(backups);
        self
    }

    /// Custom transforms available to data steps.
    pub fn with_transform_registry(mut self, registry: TransformRegistry) -> Self {
        self.transform_registry = registry;
        self
    }

    /// Tune the transform engine.
    pub fn with_transform_options(mut self, options: TransformOptions) -> Self {
        self.transform_options = options;
        self
    }

    /// Register a migration definition.
    pub fn register_migration(&self, migration: Migration) -> Result<(), ServiceError> {
        self.library.register(migration)?;
        Ok(())
    }

    fn executor(&self) -> MigrationExecutor {
        let mut executor = MigrationExecutor::new(Arc::clone(&self.registry))
            .with_transform_engine(TransformEngine::new(
                self.transform_registry.clone(),
                self.transform_options.clone(),
            ));
        if let Some(backups) = &self.backups {
            executor = executor.with_backup_gate(Arc::clone(backups) as Arc<dyn BackupGate>);
        }
        executor
    }

    /// Build a plan moving a plugin to `target_version`.
    pub async fn create_plan(
        &self,
        plugin_id: &str,
        target_version: &Version,
    ) -> Result<MigrationPlan, ServiceError> {
        let builder = PlanBuilder::new(&self.library, self.registry.as_ref());
        Ok(builder.build(plugin_id, target_version).await?)
    }

    /// Execute a previously built plan under the plugin lock.
    pub async fn execute_plan(
        &self,
        plan: &MigrationPlan,
        options: &ExecuteOptions,
    ) -> Result<Vec<ExecutionResult>, ServiceError> {
        let _guard = self.locks.try_acquire(&plan.plugin_id)?;
        let results = self
            .executor()
            .execute(plan, self.conn.as_ref(), options)
            .await?;
        Ok(results)
    }

    /// Plan and execute an upgrade in one locked scope.
    pub async fn upgrade_plugin(
        &self,
        plugin_id: &str,
        target_version: &Version,
        options: &ExecuteOptions,
    ) -> Result<Vec<ExecutionResult>, ServiceError> {
        let _guard = self.locks.try_acquire(plugin_id)?;
        let builder = PlanBuilder::new(&self.library, self.registry.as_ref());
        let plan = builder.build(plugin_id, target_version).await?;
        let results = self
            .executor()
            .execute(&plan, self.conn.as_ref(), options)
            .await?;
        Ok(results)
    }

    /// Revert a plugin to an earlier version by running `down` steps of the
    /// applied migrations above it.
    pub async fn rollback_plugin(
        &self,
        plugin_id: &str,
        to_version: &Version,
    ) -> Result<Vec<ExecutionResult>, ServiceError> {
        self.upgrade_plugin(plugin_id, to_version, &ExecuteOptions::default())
            .await
    }

    /// Pairwise conflicts among the plugin's unapplied migrations.
    pub async fn detect_conflicts(&self, plugin_id: &str) -> Result<Vec<Conflict>, ServiceError> {
        let applied: std::collections::HashSet<String> = self
            .registry
            .applied(plugin_id)
            .await?
            .into_iter()
            .map(|a| a.migration_id)
            .collect();
        let pending: Vec<Migration> = self
            .library
            .for_plugin(plugin_id)
            .into_iter()
            .filter(|m| !applied.contains(&m.id))
            .collect();

        Ok(DependencyResolver::detect_conflicts(&pending)
            .into_iter()
            .map(|(first, second)| Conflict { first, second })
            .collect())
    }

    /// Applied and pending migrations for a plugin.
    pub async fn get_migration_status(
        &self,
        plugin_id: &str,
    ) -> Result<MigrationStatus, ServiceError> {
        let current_version = self.registry.current_version(plugin_id).await?;
        let applied = self.registry.applied(plugin_id).await?;
        let applied_ids: std::collections::HashSet<&str> =
            applied.iter().map(|a| a.migration_id.as_str()).collect();

        let mut pending: Vec<Migration> = self
            .library
            .for_plugin(plugin_id)
            .into_iter()
            .filter(|m| !applied_ids.contains(m.id.as_str()))
            .collect();
        pending.sort_by(|a, b| a.version.cmp(&b.version).then_with(|| a.id.cmp(&b.id)));

        Ok(MigrationStatus {
            current_version,
            applied,
            pending: pending.into_iter().map(|m| m.id).collect(),
        })
    }

    /// Export a plugin's migrations and (optionally) data as a portable
    /// package.
    pub async fn export_plugin_data(
        &self,
        plugin_id: &str,
        options: &ExportOptions,
    ) -> Result<Vec<u8>, ServiceError> {
        Ok(export_package(
            &self.library,
            self.registry.as_ref(),
            self.conn.as_ref(),
            plugin_id,
            options,
        )
        .await?)
    }

    /// Import a portable package: register its migrations, optionally apply
    /// them through the normal plan path, then import its data rows.
    pub async fn import_plugin_data(
        &self,
        bytes: &[u8],
        plugin_id: Option<&str>,
        options: &ImportServiceOptions,
    ) -> Result<ImportReport, ServiceError> {
        let base = ImportOptions {
            overwrite: options.package.overwrite,
            skip_errors: options.package.skip_errors,
            batch_size: options.package.batch_size,
            register_migrations: true,
            import_data: !options.apply_migrations,
        };

        let mut result = import_package(
            bytes,
            plugin_id,
            &self.library,
            self.conn.as_ref(),
            &base,
        )
        .await?;

        let mut execution = Vec::new();
        if options.apply_migrations {
            // Schema first: apply the registered migrations, then write
            // data into the tables they created.
            let target = result
                .migrations_registered
                .iter()
                .filter_map(|id| self.library.get(&result.plugin_id, id))
                .map(|m| m.version)
                .max();

            if let Some(target) = target {
                execution = self
                    .upgrade_plugin(&result.plugin_id, &target, &options.execute)
                    .await?;
            }

            let data_pass = ImportOptions {
                register_migrations: false,
                import_data: true,
                ..base
            };
            let data_result = import_package(
                bytes,
                plugin_id,
                &self.library,
                self.conn.as_ref(),
                &data_pass,
            )
            .await?;
            result.rows_imported = data_result.rows_imported;
            result.rows_failed = data_result.rows_failed;
            result.errors.extend(data_result.errors);
        }

        Ok(ImportReport { result, execution })
    }

    /// Restore a verified backup into the live database.
    pub async fn restore_backup(&self, backup_id: &str) -> Result<(), ServiceError> {
        let backups = self.backups.as_ref().ok_or(ServiceError::NoBackupManager)?;
        backups.restore(self.conn.as_ref(), backup_id).await?;
        Ok(())
    }

    /// Known backups for a plugin, newest first.
    pub fn list_backups(&self, plugin_id: &str) -> Result<Vec<Backup>, ServiceError> {
        let backups = self.backups.as_ref().ok_or(ServiceError::NoBackupManager)?;
        Ok(backups.list(plugin_id))
    }
}
