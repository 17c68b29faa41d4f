//! Migration data model.
//!
//! Migrations are authored and versioned outside the runtime; this module
//! defines the loaded representation and the authoring validation applied
//! once at load time.

pub mod mapping;
pub mod migration;
pub mod step;

pub use mapping::{
    BuiltinFunction, FieldMapping, FieldTransform, LookupSource, Severity, TransformSpec,
    ValidationRule, ValuePredicate,
};
pub use migration::{
    Migration, MigrationCategory, MigrationType, RiskLevel, StepSequences, ValidationError,
};
pub use step::{ExpectedChanges, Step, StepKind, StepSql};
