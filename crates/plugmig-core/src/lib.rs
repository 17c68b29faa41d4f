//! Plugmig core - portable plugin migration engine.
//!
//! Safely evolves a plugin's persisted schema and data across heterogeneous
//! database engines: declarative migration metadata (dependencies,
//! conflicts, risk) resolved into ordered plans, executed step by step with
//! per-step transactions, dialect adaptation, batched data transforms,
//! backup gating, and rollback via authored `down` steps.

pub mod connection;
pub mod dialect;
pub mod engine;
pub mod executor;
pub mod graph;
pub mod library;
pub mod lock;
pub mod memory;
pub mod model;
pub mod plan;
pub mod registry;
pub mod resolver;
pub mod transform;

pub use connection::{Connection, ConnectionError, Row, Value};
pub use dialect::{DialectAdapter, DialectError};
pub use engine::DatabaseEngine;
pub use executor::{
    BackupGate, BackupGateError, CancelToken, ExecuteError, ExecuteOptions, ExecutionResult,
    MigrationExecutor, MigrationOutcome, StepResult, StepStatus,
};
pub use graph::DependencyGraph;
pub use library::MigrationLibrary;
pub use lock::{LockError, PluginLockGuard, PluginLockRegistry};
pub use memory::MemoryConnection;
pub use model::{
    BuiltinFunction, ExpectedChanges, FieldMapping, FieldTransform, LookupSource, Migration,
    MigrationCategory, MigrationType, RiskLevel, Severity, Step, StepKind, StepSequences, StepSql,
    TransformSpec, ValidationError, ValidationRule, ValuePredicate,
};
pub use plan::{MigrationPlan, PlanBuilder, PlanDirection, PlanError};
pub use registry::{AppliedMigration, MemoryRegistry, PluginRegistry, RegistryError};
pub use resolver::{DependencyResolver, ResolveError};
pub use transform::{
    RowError, TransformEngine, TransformError, TransformOptions, TransformRegistry,
    TransformReport,
};
