//! Executor and dialect adapter against a real SQLite database.

use std::sync::Arc;

use semver::Version;

use plugmig_core::{
    Connection, ExecuteOptions, FieldMapping, MemoryRegistry, Migration, MigrationExecutor,
    MigrationLibrary,
    MigrationOutcome, PlanBuilder, PluginRegistry, Step, StepKind, StepSql, TransformSpec, Value,
};
use plugmig_sqlite::SqliteConnection;

/// Universal DDL with PostgreSQL-isms lands on SQLite through the rewrite
/// table and actually executes.
#[tokio::test]
async fn test_universal_ddl_rewrites_and_runs() {
    let library = MigrationLibrary::new();
    library
        .register(
            Migration::new("m1", "p", Version::new(1, 0, 0))
                .with_name("documents schema")
                .with_up_step(
                    Step::new("create", StepKind::Schema, "create documents")
                        .with_sql(StepSql::universal(
                            "CREATE TABLE IF NOT EXISTS documents (id TEXT, meta JSONB, active BOOLEAN, embedding vector(3))",
                        ))
                        .with_rollback(),
                )
                .with_down_step(
                    Step::new("create", StepKind::Schema, "drop documents")
                        .with_sql(StepSql::universal("DROP TABLE IF EXISTS documents")),
                ),
        )
        .unwrap();

    let registry = Arc::new(MemoryRegistry::new());
    let executor = MigrationExecutor::new(Arc::clone(&registry) as Arc<dyn PluginRegistry>);
    let conn = SqliteConnection::open_in_memory().unwrap();

    let builder = PlanBuilder::new(&library, registry.as_ref());
    let plan = builder.build("p", &Version::new(1, 0, 0)).await.unwrap();

    let results = executor
        .execute(&plan, &conn, &ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(results[0].status, MigrationOutcome::Succeeded);

    // The rewritten column types are accepted by SQLite and usable.
    conn.execute(
        "INSERT INTO documents (id, meta, active, embedding) VALUES (?, ?, ?, ?)",
        &[
            Value::Text("d1".into()),
            Value::Text("{}".into()),
            Value::Integer(1),
            Value::Text("[0.1,0.2,0.3]".into()),
        ],
    )
    .await
    .unwrap();

    let rows = conn
        .query("SELECT * FROM documents", &[])
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
}

/// A failing step rolls the migration back on a real database; the
/// completed DDL is reverted by its down step.
#[tokio::test]
async fn test_failure_rolls_back_on_sqlite() {
    let library = MigrationLibrary::new();
    library
        .register(
            Migration::new("m1", "p", Version::new(1, 0, 0))
                .with_up_step(
                    Step::new("create", StepKind::Schema, "create")
                        .with_sql(StepSql::universal("CREATE TABLE IF NOT EXISTS t1 (id TEXT)"))
                        .with_rollback(),
                )
                .with_up_step(
                    Step::new("break", StepKind::Schema, "broken insert")
                        .with_sql(StepSql::universal("INSERT INTO missing (id) VALUES ('x')")),
                )
                .with_down_step(
                    Step::new("create", StepKind::Schema, "drop")
                        .with_sql(StepSql::universal("DROP TABLE IF EXISTS t1")),
                ),
        )
        .unwrap();

    let registry = Arc::new(MemoryRegistry::new());
    let executor = MigrationExecutor::new(Arc::clone(&registry) as Arc<dyn PluginRegistry>);
    let conn = SqliteConnection::open_in_memory().unwrap();

    let builder = PlanBuilder::new(&library, registry.as_ref());
    let plan = builder.build("p", &Version::new(1, 0, 0)).await.unwrap();
    let results = executor
        .execute(&plan, &conn, &ExecuteOptions::default())
        .await
        .unwrap();

    assert_eq!(results[0].status, MigrationOutcome::RolledBack);
    assert!(registry.applied("p").await.unwrap().is_empty());

    // t1 is gone again.
    let tables = conn
        .query(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 't1'",
            &[],
        )
        .await
        .unwrap();
    assert!(tables.is_empty());
}

/// The transform engine's paging and batched writes work against SQLite.
#[tokio::test]
async fn test_transform_moves_rows() {
    let conn = SqliteConnection::open_in_memory().unwrap();
    conn.execute("CREATE TABLE legacy (id INTEGER, name TEXT)", &[])
        .await
        .unwrap();
    conn.execute("CREATE TABLE users (id INTEGER, name TEXT)", &[])
        .await
        .unwrap();
    for i in 0..25i64 {
        conn.execute(
            "INSERT INTO legacy (id, name) VALUES (?, ?)",
            &[Value::Integer(i), Value::Text(format!("user{i}"))],
        )
        .await
        .unwrap();
    }

    let library = MigrationLibrary::new();
    library
        .register(
            Migration::new("move", "p", Version::new(1, 0, 0))
                .with_kind(
                    plugmig_core::MigrationType::Data,
                    plugmig_core::MigrationCategory::Migration,
                )
                .with_up_step(
                    Step::new("copy", StepKind::Data, "copy rows").with_transform(
                        TransformSpec::new("legacy", "users")
                            .with_mapping(FieldMapping::copy("id", "id").required())
                            .with_mapping(FieldMapping::copy("name", "name"))
                            .with_batch_size(10),
                    ),
                ),
        )
        .unwrap();

    let registry = Arc::new(MemoryRegistry::new());
    let executor = MigrationExecutor::new(Arc::clone(&registry) as Arc<dyn PluginRegistry>);
    let builder = PlanBuilder::new(&library, registry.as_ref());
    let plan = builder.build("p", &Version::new(1, 0, 0)).await.unwrap();

    let results = executor
        .execute(&plan, &conn, &ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(results[0].status, MigrationOutcome::Succeeded);

    let rows = conn.query("SELECT * FROM users", &[]).await.unwrap();
    assert_eq!(rows.len(), 25);
}
