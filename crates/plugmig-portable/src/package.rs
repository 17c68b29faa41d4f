//! The `portable-migration-v1` package format.
//!
//! A package is a gzip-compressed JSON envelope: a manifest (plugin id,
//! source version, checksum), the migration documents, and optionally
//! serialized table data. The checksum covers the canonical serialization
//! of migrations plus data, so a tampered or truncated package is rejected
//! before anything is registered or written.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use semver::Version;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use plugmig_core::{Migration, Row};

use crate::error::PortableError;

/// The one package format this engine reads and writes.
pub const FORMAT_VERSION: &str = "portable-migration-v1";

/// One migration definition, wrapped with its format tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationDocument {
    /// Format tag; must equal [`FORMAT_VERSION`].
    pub format: String,
    /// The migration definition.
    pub migration: Migration,
}

impl MigrationDocument {
    /// Wrap a migration in the current format.
    pub fn new(migration: Migration) -> Self {
        Self {
            format: FORMAT_VERSION.to_string(),
            migration,
        }
    }
}

/// Package metadata and integrity information.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifest {
    /// Format tag; must equal [`FORMAT_VERSION`].
    pub format_version: String,
    /// The plugin the package describes.
    pub plugin_id: String,
    /// Installed version on the exporting side, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_version: Option<Version>,
    /// When the package was exported.
    pub created_at: DateTime<Utc>,
    /// SHA-256 over the canonical serialization of migrations and data.
    pub checksum: String,
    /// Number of packaged migrations.
    pub migration_count: usize,
    /// Number of packaged data rows, across all tables.
    pub row_count: u64,
}

/// A decoded package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortablePackage {
    /// Package metadata.
    pub manifest: PackageManifest,
    /// Migration definitions.
    pub migrations: Vec<MigrationDocument>,
    /// Optional table data, keyed by table name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<BTreeMap<String, Vec<Row>>>,
}

impl PortablePackage {
    /// Assemble a package, computing the manifest from its contents.
    pub fn assemble(
        plugin_id: &str,
        source_version: Option<Version>,
        migrations: Vec<Migration>,
        data: Option<BTreeMap<String, Vec<Row>>>,
    ) -> Result<Self, PortableError> {
        let migrations: Vec<MigrationDocument> =
            migrations.into_iter().map(MigrationDocument::new).collect();
        let checksum = content_checksum(&migrations, &data)?;
        let row_count = data
            .as_ref()
            .map(|tables| tables.values().map(|rows| rows.len() as u64).sum())
            .unwrap_or(0);

        Ok(Self {
            manifest: PackageManifest {
                format_version: FORMAT_VERSION.to_string(),
                plugin_id: plugin_id.to_string(),
                source_version,
                created_at: Utc::now(),
                checksum,
                migration_count: migrations.len(),
                row_count,
            },
            migrations,
            data,
        })
    }

    /// Serialize and compress to package bytes.
    pub fn encode(&self) -> Result<Vec<u8>, PortableError> {
        let json =
            serde_json::to_vec(self).map_err(|e| PortableError::Serialization(e.to_string()))?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&json)
            .and_then(|_| encoder.finish())
            .map_err(|e| PortableError::Serialization(e.to_string()))
    }

    /// Decompress, parse, and validate package bytes: format tags first,
    /// then the manifest checksum against the received contents.
    pub fn decode(bytes: &[u8]) -> Result<Self, PortableError> {
        let mut decoder = GzDecoder::new(bytes);
        let mut json = Vec::new();
        decoder
            .read_to_end(&mut json)
            .map_err(|e| PortableError::Serialization(e.to_string()))?;
        let package: PortablePackage =
            serde_json::from_slice(&json).map_err(|e| PortableError::Serialization(e.to_string()))?;

        if package.manifest.format_version != FORMAT_VERSION {
            return Err(PortableError::UnsupportedFormat {
                found: package.manifest.format_version.clone(),
            });
        }
        for document in &package.migrations {
            if document.format != FORMAT_VERSION {
                return Err(PortableError::UnsupportedFormat {
                    found: document.format.clone(),
                });
            }
        }

        let actual = content_checksum(&package.migrations, &package.data)?;
        if actual != package.manifest.checksum {
            return Err(PortableError::ChecksumMismatch {
                expected: package.manifest.checksum.clone(),
                actual,
            });
        }

        Ok(package)
    }
}

/// SHA-256 over the canonical serialization of migrations and data.
fn content_checksum(
    migrations: &[MigrationDocument],
    data: &Option<BTreeMap<String, Vec<Row>>>,
) -> Result<String, PortableError> {
    let canonical = serde_json::to_vec(&(migrations, data))
        .map_err(|e| PortableError::Serialization(e.to_string()))?;
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugmig_core::{Step, StepKind, StepSql, Value};

    fn migration(id: &str) -> Migration {
        Migration::new(id, "p", Version::new(1, 0, 0)).with_up_step(
            Step::new("s1", StepKind::Schema, "create")
                .with_sql(StepSql::universal("CREATE TABLE IF NOT EXISTS t (id TEXT)")),
        )
    }

    #[test]
    fn test_round_trip() {
        let mut data = BTreeMap::new();
        data.insert(
            "t".to_string(),
            vec![Row::from_pairs(vec![("id".to_string(), Value::Integer(1))])],
        );

        let package = PortablePackage::assemble(
            "p",
            Some(Version::new(1, 0, 0)),
            vec![migration("m1")],
            Some(data),
        )
        .unwrap();
        let bytes = package.encode().unwrap();
        let decoded = PortablePackage::decode(&bytes).unwrap();

        assert_eq!(decoded.manifest.plugin_id, "p");
        assert_eq!(decoded.manifest.migration_count, 1);
        assert_eq!(decoded.manifest.row_count, 1);
        assert_eq!(decoded.migrations[0].migration.id, "m1");
    }

    #[test]
    fn test_unknown_format_rejected() {
        let mut package =
            PortablePackage::assemble("p", None, vec![migration("m1")], None).unwrap();
        package.manifest.format_version = "portable-migration-v9".to_string();
        let bytes = package.encode().unwrap();

        assert!(matches!(
            PortablePackage::decode(&bytes),
            Err(PortableError::UnsupportedFormat { found }) if found == "portable-migration-v9"
        ));
    }

    #[test]
    fn test_tampered_contents_rejected() {
        let mut package =
            PortablePackage::assemble("p", None, vec![migration("m1")], None).unwrap();
        package.migrations[0].migration.name = "tampered".to_string();
        let bytes = package.encode().unwrap();

        assert!(matches!(
            PortablePackage::decode(&bytes),
            Err(PortableError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_checksum_survives_unsorted_row_columns() {
        let mut data = BTreeMap::new();
        data.insert(
            "t".to_string(),
            vec![Row::from_pairs(vec![
                ("owner".to_string(), Value::Text("a".into())),
                ("id".to_string(), Value::Integer(1)),
            ])],
        );

        let bytes = PortablePackage::assemble("p", None, vec![migration("m1")], Some(data))
            .unwrap()
            .encode()
            .unwrap();
        assert!(PortablePackage::decode(&bytes).is_ok());
    }

    #[test]
    fn test_migration_document_shape() {
        let document = MigrationDocument::new(migration("m1"));
        let json = serde_json::to_value(&document).unwrap();
        assert_eq!(json["format"], FORMAT_VERSION);
        assert_eq!(json["migration"]["pluginId"], "p");
        assert_eq!(json["migration"]["version"], "1.0.0");
    }
}
