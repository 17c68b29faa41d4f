//! Backup error types.

use thiserror::Error;

/// Backup and restore failures.
#[derive(Debug, Error)]
pub enum BackupError {
    /// Verification of a written backup failed; the gated step must not
    /// proceed.
    #[error("backup {backup_id} failed verification: {reason}")]
    VerificationFailed {
        /// The unverifiable backup.
        backup_id: String,
        /// What did not check out.
        reason: String,
    },

    /// No backup with this id is known.
    #[error("backup not found: {backup_id}")]
    NotFound {
        /// The missing backup id.
        backup_id: String,
    },

    /// The backup exists but was never verified as restorable.
    #[error("backup {backup_id} is not restorable")]
    NotRestorable {
        /// The unusable backup id.
        backup_id: String,
    },

    /// Object-store access failed.
    #[error("storage error: {0}")]
    Storage(#[from] object_store::Error),

    /// Database access failed.
    #[error(transparent)]
    Connection(#[from] plugmig_core::ConnectionError),

    /// Snapshot payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}
