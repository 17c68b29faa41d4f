//! Package import.

use plugmig_core::{Connection, MigrationLibrary, Row, Value};

use crate::error::PortableError;
use crate::package::PortablePackage;

/// Import options.
#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// Clear each target table before writing its rows.
    pub overwrite: bool,
    /// Record batch failures and continue instead of aborting.
    pub skip_errors: bool,
    /// Rows per write batch.
    pub batch_size: usize,
    /// Register the packaged migrations into the library.
    pub register_migrations: bool,
    /// Write the packaged data rows. Hosts that execute the registered
    /// migrations first import in two passes: schema, then data.
    pub import_data: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            overwrite: false,
            skip_errors: false,
            batch_size: 1000,
            register_migrations: true,
            import_data: true,
        }
    }
}

/// Outcome of an import.
#[derive(Debug, Clone, Default)]
pub struct ImportResult {
    /// The plugin the package belongs to.
    pub plugin_id: String,
    /// Migration ids registered into the library.
    pub migrations_registered: Vec<String>,
    /// Data rows written.
    pub rows_imported: u64,
    /// Data rows dropped by batch failures.
    pub rows_failed: u64,
    /// Failure messages, when `skip_errors` is set.
    pub errors: Vec<String>,
}

/// Validate package bytes and import their contents.
///
/// `expected_plugin` guards against applying a package to the wrong
/// plugin. Migration registration and data import happen here; executing
/// the registered migrations is the caller's choice, through the normal
/// plan/executor path.
pub async fn import_package(
    bytes: &[u8],
    expected_plugin: Option<&str>,
    library: &MigrationLibrary,
    conn: &dyn Connection,
    options: &ImportOptions,
) -> Result<ImportResult, PortableError> {
    let package = PortablePackage::decode(bytes)?;

    if let Some(expected) = expected_plugin {
        if package.manifest.plugin_id != expected {
            return Err(PortableError::PluginMismatch {
                expected: expected.to_string(),
                found: package.manifest.plugin_id.clone(),
            });
        }
    }

    let mut result = ImportResult {
        plugin_id: package.manifest.plugin_id.clone(),
        ..Default::default()
    };

    if options.register_migrations {
        for document in &package.migrations {
            match library.register(document.migration.clone()) {
                Ok(()) => result.migrations_registered.push(document.migration.id.clone()),
                Err(e) if options.skip_errors => {
                    result.errors.push(format!(
                        "migration {} rejected: {e}",
                        document.migration.id
                    ));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    if options.import_data {
        if let Some(data) = &package.data {
            for (table, rows) in data {
                import_table(conn, table, rows, options, &mut result).await?;
            }
        }
    }

    tracing::info!(
        plugin = %result.plugin_id,
        migrations = result.migrations_registered.len(),
        rows = result.rows_imported,
        failed = result.rows_failed,
        "imported portable package"
    );

    Ok(result)
}

async fn import_table(
    conn: &dyn Connection,
    table: &str,
    rows: &[Row],
    options: &ImportOptions,
    result: &mut ImportResult,
) -> Result<(), PortableError> {
    if options.overwrite {
        match conn.execute(&format!("DELETE FROM {table}"), &[]).await {
            Ok(_) => {}
            Err(e) if options.skip_errors => {
                result.errors.push(format!("failed to clear {table}: {e}"));
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
    }

    // Batches must share one column list; rows are grouped by their column
    // signature within each size-bounded chunk.
    let mut index = 0;
    while index < rows.len() {
        let columns: Vec<String> = rows[index]
            .columns()
            .iter()
            .map(|(name, _)| name.clone())
            .collect();
        let mut end = index + 1;
        while end < rows.len()
            && end - index < options.batch_size
            && rows[end].columns().iter().map(|(name, _)| name).eq(columns.iter())
        {
            end += 1;
        }
        let batch = &rows[index..end];

        let tuple = format!(
            "({})",
            columns.iter().map(|_| "?").collect::<Vec<_>>().join(", ")
        );
        let sql = format!(
            "INSERT INTO {table} ({}) VALUES {}",
            columns.join(", "),
            vec![tuple; batch.len()].join(", ")
        );
        let params: Vec<Value> = batch
            .iter()
            .flat_map(|row| row.columns().iter().map(|(_, value)| value.clone()))
            .collect();

        match conn.execute(&sql, &params).await {
            Ok(_) => result.rows_imported += batch.len() as u64,
            Err(e) if options.skip_errors => {
                result.rows_failed += batch.len() as u64;
                result.errors.push(format!("batch insert into {table} failed: {e}"));
            }
            Err(e) => return Err(e.into()),
        }

        index = end;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::PortablePackage;
    use plugmig_core::{MemoryConnection, Migration, Step, StepKind, StepSql};
    use semver::Version;
    use std::collections::BTreeMap;

    fn row(pairs: &[(&str, Value)]) -> Row {
        Row::from_pairs(
            pairs
                .iter()
                .map(|(name, value)| (name.to_string(), value.clone()))
                .collect(),
        )
    }

    fn migration(id: &str) -> Migration {
        Migration::new(id, "p", Version::new(1, 0, 0)).with_up_step(
            Step::new("s1", StepKind::Schema, "create")
                .with_sql(StepSql::universal("CREATE TABLE IF NOT EXISTS events (id TEXT)")),
        )
    }

    fn package_with_data() -> Vec<u8> {
        let mut data = BTreeMap::new();
        data.insert(
            "events".to_string(),
            vec![
                row(&[("id", Value::Integer(1))]),
                row(&[("id", Value::Integer(2))]),
            ],
        );
        PortablePackage::assemble("p", None, vec![migration("m1")], Some(data))
            .unwrap()
            .encode()
            .unwrap()
    }

    #[tokio::test]
    async fn test_import_registers_and_writes() {
        let library = MigrationLibrary::new();
        let conn = MemoryConnection::default().with_table("events", Vec::new());

        let result = import_package(
            &package_with_data(),
            Some("p"),
            &library,
            &conn,
            &ImportOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(result.migrations_registered, vec!["m1"]);
        assert_eq!(result.rows_imported, 2);
        assert!(library.contains("p", "m1"));
        assert_eq!(conn.table("events").len(), 2);
    }

    #[tokio::test]
    async fn test_import_overwrite_clears_table() {
        let library = MigrationLibrary::new();
        let conn = MemoryConnection::default()
            .with_table("events", vec![row(&[("id", Value::Integer(99))])]);

        let options = ImportOptions {
            overwrite: true,
            ..Default::default()
        };
        import_package(&package_with_data(), Some("p"), &library, &conn, &options)
            .await
            .unwrap();

        let rows = conn.table("events");
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.get("id") != Some(&Value::Integer(99))));
    }

    #[tokio::test]
    async fn test_import_plugin_mismatch() {
        let library = MigrationLibrary::new();
        let conn = MemoryConnection::default();

        assert!(matches!(
            import_package(
                &package_with_data(),
                Some("other-plugin"),
                &library,
                &conn,
                &ImportOptions::default(),
            )
            .await,
            Err(PortableError::PluginMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_import_missing_table_skip_errors() {
        let library = MigrationLibrary::new();
        // No "events" table exists on the target.
        let conn = MemoryConnection::default();

        let options = ImportOptions {
            skip_errors: true,
            ..Default::default()
        };
        let result =
            import_package(&package_with_data(), Some("p"), &library, &conn, &options)
                .await
                .unwrap();

        assert_eq!(result.rows_imported, 0);
        assert_eq!(result.rows_failed, 2);
        assert!(!result.errors.is_empty());
    }

    #[tokio::test]
    async fn test_import_missing_table_strict_fails() {
        let library = MigrationLibrary::new();
        let conn = MemoryConnection::default();

        assert!(import_package(
            &package_with_data(),
            Some("p"),
            &library,
            &conn,
            &ImportOptions::default(),
        )
        .await
        .is_err());
    }
}
