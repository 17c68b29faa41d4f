//! Plugmig - portable plugin migration engine.
//!
//! Facade crate: wires the core engine, backup manager, and portable
//! packaging into [`MigrationService`], the surface a host's HTTP or CLI
//! layer consumes.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use plugmig::{MigrationService, ExecuteOptions};
//! use plugmig_core::{MemoryRegistry, MigrationLibrary};
//! use plugmig_sqlite::SqliteConnection;
//!
//! let conn = Arc::new(SqliteConnection::open("plugin.db")?);
//! let service = MigrationService::new(
//!     conn,
//!     Arc::new(MigrationLibrary::new()),
//!     Arc::new(MemoryRegistry::new()),
//! );
//!
//! let results = service
//!     .upgrade_plugin("docs-plugin", &"1.2.0".parse()?, &ExecuteOptions::default())
//!     .await?;
//! ```

pub mod service;

pub use service::{
    Conflict, ImportReport, ImportServiceOptions, MigrationService, MigrationStatus,
    PackageImportOptions, ServiceError,
};

// Re-export the pieces hosts compose with the service.
pub use plugmig_backup::{Backup, BackupManager, RetentionPolicy};
pub use plugmig_core::{
    AppliedMigration, CancelToken, Connection, DatabaseEngine, ExecuteOptions, ExecutionResult,
    MemoryRegistry, Migration, MigrationCategory, MigrationLibrary, MigrationOutcome,
    MigrationPlan, MigrationType, PlanDirection, PluginRegistry, RiskLevel, Step, StepKind,
    StepSql, TransformOptions, TransformRegistry, TransformSpec,
};
pub use plugmig_portable::{DataFilter, DateRangeFilter, ExportOptions, ImportResult, ScopeFilter};
