//! Portable-package error types.

use thiserror::Error;

/// Export/import failures.
#[derive(Debug, Error)]
pub enum PortableError {
    /// The package declares a format this engine does not understand.
    /// Unknown formats are rejected, never coerced.
    #[error("unsupported package format: {found}")]
    UnsupportedFormat {
        /// The declared format value.
        found: String,
    },

    /// The manifest checksum does not match the package contents.
    #[error("package checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch {
        /// Checksum recorded in the manifest.
        expected: String,
        /// Checksum computed over the received contents.
        actual: String,
    },

    /// The package belongs to a different plugin than requested.
    #[error("package is for plugin {found}, not {expected}")]
    PluginMismatch {
        /// The plugin the caller asked for.
        expected: String,
        /// The plugin named in the manifest.
        found: String,
    },

    /// Package bytes could not be parsed.
    #[error("package serialization error: {0}")]
    Serialization(String),

    /// A packaged migration failed authoring validation.
    #[error(transparent)]
    InvalidMigration(#[from] plugmig_core::ValidationError),

    /// Database access failed.
    #[error(transparent)]
    Connection(#[from] plugmig_core::ConnectionError),

    /// Registry access failed.
    #[error(transparent)]
    Registry(#[from] plugmig_core::RegistryError),
}
