//! Service-level tests: the full export/import round trip, backup gating,
//! conflict reporting, and status queries.

use std::sync::Arc;

use semver::Version;

use object_store::memory::InMemory;
use plugmig::{
    BackupManager, Connection, DataFilter, ExecuteOptions, ExportOptions, ImportServiceOptions,
    MemoryRegistry, MigrationLibrary, MigrationOutcome, MigrationService, RiskLevel, ScopeFilter,
    Step, StepKind, StepSql,
};
use plugmig_core::{FieldMapping, MemoryConnection, Migration, Row, TransformSpec, Value};

fn row(pairs: &[(&str, Value)]) -> Row {
    Row::from_pairs(
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect(),
    )
}

fn schema_migration(id: &str, version: Version, table: &str) -> Migration {
    Migration::new(id, "notes-plugin", version)
        .with_name(format!("create {table}"))
        .with_affected_tables(vec![table.to_string()])
        .with_up_step(
            Step::new("create", StepKind::Schema, format!("create {table}"))
                .with_sql(StepSql::universal(format!(
                    "CREATE TABLE IF NOT EXISTS {table} (id TEXT)"
                )))
                .with_rollback(),
        )
        .with_down_step(
            Step::new("create", StepKind::Schema, format!("drop {table}"))
                .with_sql(StepSql::universal(format!("DROP TABLE IF EXISTS {table}"))),
        )
}

fn service_over(conn: Arc<MemoryConnection>) -> MigrationService {
    MigrationService::new(
        conn,
        Arc::new(MigrationLibrary::new()),
        Arc::new(MemoryRegistry::new()),
    )
}

/// Export two migrations plus data scoped to users A and B, import into a
/// fresh instance, and confirm both migrations apply and only the scoped
/// rows arrive.
#[tokio::test]
async fn test_export_import_round_trip_with_scoped_data() {
    // Source instance.
    let source_conn = Arc::new(MemoryConnection::default());
    let source = service_over(Arc::clone(&source_conn));
    source
        .register_migration(schema_migration("m1", Version::new(1, 0, 0), "notes"))
        .unwrap();
    source
        .register_migration(
            schema_migration("m2", Version::new(1, 1, 0), "tags")
                .with_dependencies(vec!["m1".to_string()]),
        )
        .unwrap();
    source
        .upgrade_plugin(
            "notes-plugin",
            &Version::new(1, 1, 0),
            &ExecuteOptions::default(),
        )
        .await
        .unwrap();

    for (id, user) in [(1, "a"), (2, "b"), (3, "c")] {
        source_conn
            .execute(
                "INSERT INTO notes (id, owner) VALUES (?, ?)",
                &[Value::Integer(id), Value::Text(user.into())],
            )
            .await
            .unwrap();
    }

    let bytes = source
        .export_plugin_data(
            "notes-plugin",
            &ExportOptions {
                include_data: true,
                filter: Some(DataFilter {
                    tables: vec!["notes".to_string()],
                    date_range: None,
                    scope: Some(ScopeFilter {
                        column: "owner".to_string(),
                        values: vec![Value::Text("a".into()), Value::Text("b".into())],
                    }),
                }),
            },
        )
        .await
        .unwrap();

    // Fresh instance.
    let target_conn = Arc::new(MemoryConnection::default());
    let target = service_over(Arc::clone(&target_conn));

    let report = target
        .import_plugin_data(
            &bytes,
            Some("notes-plugin"),
            &ImportServiceOptions {
                apply_migrations: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(report.result.migrations_registered.len(), 2);
    assert!(report
        .execution
        .iter()
        .all(|r| r.status == MigrationOutcome::Succeeded));
    assert_eq!(report.result.rows_imported, 2);

    let status = target.get_migration_status("notes-plugin").await.unwrap();
    assert_eq!(status.applied.len(), 2);
    assert!(status.pending.is_empty());
    assert_eq!(status.current_version, Some(Version::new(1, 1, 0)));

    let rows = target_conn.table("notes");
    assert_eq!(rows.len(), 2);
    assert!(rows
        .iter()
        .all(|r| r.get("owner") != Some(&Value::Text("c".into()))));
}

/// A backup-gated migration snapshots its affected tables before running,
/// and the backup can restore them afterwards.
#[tokio::test]
async fn test_backup_gated_migration_snapshots_scope() {
    let conn = Arc::new(
        MemoryConnection::default()
            .with_table("notes", vec![row(&[("id", Value::Integer(1))])]),
    );
    let backups = Arc::new(BackupManager::new(Arc::new(InMemory::new())));
    let service = MigrationService::new(
        Arc::clone(&conn) as Arc<dyn plugmig::Connection>,
        Arc::new(MigrationLibrary::new()),
        Arc::new(MemoryRegistry::new()),
    )
    .with_backups(Arc::clone(&backups));

    service
        .register_migration(
            Migration::new("m1", "notes-plugin", Version::new(2, 0, 0))
                .with_name("destructive cleanup")
                .with_risk(RiskLevel::High, true)
                .with_affected_tables(vec!["notes".to_string()])
                .with_up_step(
                    Step::new("clear", StepKind::Data, "clear notes")
                        .with_sql(StepSql::universal("DELETE FROM notes")),
                ),
        )
        .unwrap();

    let results = service
        .upgrade_plugin(
            "notes-plugin",
            &Version::new(2, 0, 0),
            &ExecuteOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(results[0].status, MigrationOutcome::Succeeded);
    let backup_id = results[0].backup_id.clone().unwrap();
    assert!(conn.table("notes").is_empty());

    // Operator recovery path: restore the pre-migration snapshot.
    service.restore_backup(&backup_id).await.unwrap();
    assert_eq!(conn.table("notes").len(), 1);

    let listed = service.list_backups("notes-plugin").unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, backup_id);
}

/// Conflicting pending migrations are reported by id pair, and resolution
/// refuses to put both in one plan.
#[tokio::test]
async fn test_conflict_detection_and_plan_refusal() {
    let service = service_over(Arc::new(MemoryConnection::default()));
    service
        .register_migration(schema_migration("m2", Version::new(1, 0, 0), "alpha"))
        .unwrap();
    service
        .register_migration(
            schema_migration("m3", Version::new(1, 0, 0), "beta")
                .with_conflicts(vec!["m2".to_string()]),
        )
        .unwrap();

    let conflicts = service.detect_conflicts("notes-plugin").await.unwrap();
    assert_eq!(conflicts.len(), 1);
    let pair = [conflicts[0].first.as_str(), conflicts[0].second.as_str()];
    assert!(pair.contains(&"m2") && pair.contains(&"m3"));

    let err = service
        .create_plan("notes-plugin", &Version::new(1, 0, 0))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("conflicting migrations"));
}

/// The plugin lock is released on every exit path, so sequential upgrades
/// are accepted back to back.
#[tokio::test]
async fn test_lock_released_between_executions() {
    let service = Arc::new(service_over(Arc::new(MemoryConnection::default())));
    service
        .register_migration(schema_migration("m1", Version::new(1, 0, 0), "notes"))
        .unwrap();

    // First upgrade succeeds and releases the lock on completion.
    service
        .upgrade_plugin(
            "notes-plugin",
            &Version::new(1, 0, 0),
            &ExecuteOptions::default(),
        )
        .await
        .unwrap();

    // The lock was released; a follow-up (empty) plan is accepted again.
    let results = service
        .upgrade_plugin(
            "notes-plugin",
            &Version::new(1, 0, 0),
            &ExecuteOptions::default(),
        )
        .await
        .unwrap();
    assert!(results.is_empty());
}

/// Dry-run upgrades report rendered statements without touching the
/// database or the registry.
#[tokio::test]
async fn test_dry_run_upgrade_reports_only() {
    let conn = Arc::new(MemoryConnection::default());
    let service = service_over(Arc::clone(&conn));
    service
        .register_migration(schema_migration("m1", Version::new(1, 0, 0), "notes"))
        .unwrap();

    let results = service
        .upgrade_plugin(
            "notes-plugin",
            &Version::new(1, 0, 0),
            &ExecuteOptions {
                dry_run: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(results[0].status, MigrationOutcome::Succeeded);
    assert!(results[0].step_results[0]
        .statement
        .as_deref()
        .unwrap()
        .contains("CREATE TABLE"));
    assert!(conn.table_names().is_empty());

    let status = service.get_migration_status("notes-plugin").await.unwrap();
    assert!(status.applied.is_empty());
    assert_eq!(status.pending, vec!["m1".to_string()]);
}

/// The service drives a real SQLite database end to end.
#[tokio::test]
async fn test_upgrade_against_sqlite() {
    use plugmig_sqlite::SqliteConnection;

    let conn = Arc::new(SqliteConnection::open_in_memory().unwrap());
    let service = MigrationService::new(
        Arc::clone(&conn) as Arc<dyn plugmig::Connection>,
        Arc::new(MigrationLibrary::new()),
        Arc::new(MemoryRegistry::new()),
    );

    service
        .register_migration(schema_migration("m1", Version::new(1, 0, 0), "notes"))
        .unwrap();

    let results = service
        .upgrade_plugin(
            "notes-plugin",
            &Version::new(1, 0, 0),
            &ExecuteOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(results[0].status, MigrationOutcome::Succeeded);

    let tables = conn
        .query(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'notes'",
            &[],
        )
        .await
        .unwrap();
    assert_eq!(tables.len(), 1);
}

/// Data-step transforms run through the service with the author's custom
/// transform registry.
#[tokio::test]
async fn test_upgrade_with_data_transform() {
    let conn = Arc::new(
        MemoryConnection::default()
            .with_table(
                "legacy_notes",
                vec![
                    row(&[("id", Value::Integer(1)), ("body", Value::Text("x".into()))]),
                    row(&[("id", Value::Integer(2)), ("body", Value::Text("y".into()))]),
                ],
            )
            .with_table("notes", Vec::new()),
    );
    let service = service_over(Arc::clone(&conn));

    service
        .register_migration(
            Migration::new("move", "notes-plugin", Version::new(1, 0, 0))
                .with_kind(
                    plugmig::MigrationType::Data,
                    plugmig::MigrationCategory::Migration,
                )
                .with_up_step(
                    Step::new("copy", StepKind::Data, "move notes").with_transform(
                        TransformSpec::new("legacy_notes", "notes")
                            .with_mapping(FieldMapping::copy("id", "id").required())
                            .with_mapping(FieldMapping::copy("body", "body")),
                    ),
                ),
        )
        .unwrap();

    let results = service
        .upgrade_plugin(
            "notes-plugin",
            &Version::new(1, 0, 0),
            &ExecuteOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(results[0].status, MigrationOutcome::Succeeded);
    assert_eq!(conn.table("notes").len(), 2);
}
