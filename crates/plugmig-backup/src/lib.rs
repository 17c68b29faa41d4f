//! Backup manager for the plugin migration engine.
//!
//! Logical table snapshots taken before high-risk migrations: paged dumps,
//! gzip compression, SHA-256 verification against the stored bytes, restore
//! into the live connection, and retention independent of migration
//! history. Storage is any [`object_store::ObjectStore`].

pub mod error;
pub mod manager;
pub mod snapshot;

pub use error::BackupError;
pub use manager::{Backup, BackupManager, RetentionPolicy};
pub use snapshot::{SnapshotPayload, TableSnapshot};
