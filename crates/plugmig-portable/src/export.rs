//! Package export.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use plugmig_core::{Connection, MigrationLibrary, PluginRegistry, Row, Value};

use crate::error::PortableError;
use crate::package::PortablePackage;

const EXPORT_PAGE_SIZE: usize = 1000;

/// Restrict exported rows to a timestamp window on one column.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateRangeFilter {
    /// The timestamp column.
    pub column: String,
    /// Inclusive lower bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<DateTime<Utc>>,
}

/// Restrict exported rows to listed values of one column (user scoping).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeFilter {
    /// The scoping column.
    pub column: String,
    /// Allowed values.
    pub values: Vec<Value>,
}

/// What data to include in a package.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataFilter {
    /// Tables to export. Empty means every table the plugin's migrations
    /// touch.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tables: Vec<String>,
    /// Timestamp window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_range: Option<DateRangeFilter>,
    /// Value scoping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<ScopeFilter>,
}

/// Export options.
#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    /// Include table data alongside the migration definitions.
    pub include_data: bool,
    /// Data restriction, when data is included.
    pub filter: Option<DataFilter>,
}

/// Build a portable package for one plugin.
pub async fn export_package(
    library: &MigrationLibrary,
    registry: &dyn PluginRegistry,
    conn: &dyn Connection,
    plugin_id: &str,
    options: &ExportOptions,
) -> Result<Vec<u8>, PortableError> {
    let migrations = library.for_plugin(plugin_id);
    let source_version = registry.current_version(plugin_id).await?;

    let data = if options.include_data {
        let filter = options.filter.clone().unwrap_or_default();
        let tables = if filter.tables.is_empty() {
            let mut tables: Vec<String> = migrations
                .iter()
                .flat_map(|m| m.backup_scope())
                .collect();
            tables.sort();
            tables.dedup();
            tables
        } else {
            filter.tables.clone()
        };

        let mut exported = BTreeMap::new();
        for table in tables {
            let rows = read_filtered(conn, &table, &filter).await?;
            exported.insert(table, rows);
        }
        Some(exported)
    } else {
        None
    };

    let package = PortablePackage::assemble(plugin_id, source_version, migrations, data)?;
    tracing::info!(
        plugin = plugin_id,
        migrations = package.manifest.migration_count,
        rows = package.manifest.row_count,
        "exported portable package"
    );
    package.encode()
}

async fn read_filtered(
    conn: &dyn Connection,
    table: &str,
    filter: &DataFilter,
) -> Result<Vec<Row>, PortableError> {
    let mut clauses = Vec::new();
    if let Some(range) = &filter.date_range {
        if let Some(from) = &range.from {
            clauses.push(format!("{} >= '{}'", range.column, from.to_rfc3339()));
        }
        if let Some(to) = &range.to {
            clauses.push(format!("{} <= '{}'", range.column, to.to_rfc3339()));
        }
    }
    if let Some(scope) = &filter.scope {
        let values: Vec<String> = scope.values.iter().map(Value::to_sql_literal).collect();
        clauses.push(format!("{} IN ({})", scope.column, values.join(", ")));
    }

    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };

    let mut rows = Vec::new();
    let mut offset = 0usize;
    loop {
        let sql = format!(
            "SELECT * FROM {table}{where_clause} LIMIT {EXPORT_PAGE_SIZE} OFFSET {offset}"
        );
        let page = conn.query(&sql, &[]).await?;
        let page_len = page.len();
        rows.extend(page);
        if page_len < EXPORT_PAGE_SIZE {
            break;
        }
        offset += page_len;
    }
    Ok(rows)
}
