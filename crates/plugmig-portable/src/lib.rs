//! Portable migration packages.
//!
//! Serializes a plugin's migrations plus (optionally) its data into a
//! versioned `portable-migration-v1` package, and reconstructs plugin
//! state from such a package on another installation. Packages carry a
//! checksummed manifest; unknown formats and tampered contents are
//! rejected before anything is registered or written.

pub mod error;
pub mod export;
pub mod import;
pub mod package;

pub use error::PortableError;
pub use export::{export_package, DataFilter, DateRangeFilter, ExportOptions, ScopeFilter};
pub use import::{import_package, ImportOptions, ImportResult};
pub use package::{MigrationDocument, PackageManifest, PortablePackage, FORMAT_VERSION};
