//! Logical table snapshots.
//!
//! A snapshot is a paged `SELECT *` dump of each in-scope table, serialized
//! as JSON, gzip-compressed, and checksummed with SHA-256 over the stored
//! bytes. Restore replaces table contents inside one transaction per table.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use plugmig_core::{Connection, Row, Value};

use crate::error::BackupError;

/// All rows of one table at snapshot time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSnapshot {
    /// The table name.
    pub table: String,
    /// Its rows.
    pub rows: Vec<Row>,
}

/// A full snapshot payload for one plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotPayload {
    /// The plugin the snapshot belongs to.
    pub plugin_id: String,
    /// Snapshotted tables.
    pub tables: Vec<TableSnapshot>,
}

impl SnapshotPayload {
    /// Dump the in-scope tables through the connection, paging by
    /// `page_size` rows.
    pub async fn dump(
        conn: &dyn Connection,
        plugin_id: &str,
        scope: &[String],
        page_size: usize,
    ) -> Result<Self, BackupError> {
        let mut tables = Vec::with_capacity(scope.len());
        for table in scope {
            let mut rows = Vec::new();
            let mut offset = 0usize;
            loop {
                let sql = format!("SELECT * FROM {table} LIMIT {page_size} OFFSET {offset}");
                let page = conn.query(&sql, &[]).await?;
                let page_len = page.len();
                rows.extend(page);
                if page_len < page_size {
                    break;
                }
                offset += page_len;
            }
            tables.push(TableSnapshot {
                table: table.clone(),
                rows,
            });
        }

        Ok(Self {
            plugin_id: plugin_id.to_string(),
            tables,
        })
    }

    /// Row counts per table, compared during verification.
    pub fn row_counts(&self) -> BTreeMap<String, u64> {
        self.tables
            .iter()
            .map(|t| (t.table.clone(), t.rows.len() as u64))
            .collect()
    }

    /// Replace the contents of every snapshotted table with the snapshot
    /// rows, one transaction per table.
    pub async fn restore(&self, conn: &dyn Connection) -> Result<(), BackupError> {
        for table in &self.tables {
            conn.begin().await?;
            let outcome = restore_table(conn, table).await;
            match outcome {
                Ok(()) => conn.commit().await?,
                Err(e) => {
                    let _ = conn.rollback().await;
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

async fn restore_table(conn: &dyn Connection, snapshot: &TableSnapshot) -> Result<(), BackupError> {
    conn.execute(&format!("DELETE FROM {}", snapshot.table), &[])
        .await?;

    // Multi-row inserts, grouped by runs of identical column sets.
    let mut index = 0;
    while index < snapshot.rows.len() {
        let columns: Vec<String> = snapshot.rows[index]
            .columns()
            .iter()
            .map(|(name, _)| name.clone())
            .collect();
        let mut end = index + 1;
        while end < snapshot.rows.len()
            && snapshot.rows[end]
                .columns()
                .iter()
                .map(|(name, _)| name)
                .eq(columns.iter())
        {
            end += 1;
        }
        let batch = &snapshot.rows[index..end.min(index + 500)];

        let tuple = format!(
            "({})",
            columns.iter().map(|_| "?").collect::<Vec<_>>().join(", ")
        );
        let sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            snapshot.table,
            columns.join(", "),
            vec![tuple; batch.len()].join(", ")
        );
        let params: Vec<Value> = batch
            .iter()
            .flat_map(|row| row.columns().iter().map(|(_, value)| value.clone()))
            .collect();

        conn.execute(&sql, &params).await?;
        index += batch.len();
    }

    Ok(())
}

/// Serialize and compress a payload; returns the stored bytes and their
/// checksum.
pub fn encode(payload: &SnapshotPayload) -> Result<(Vec<u8>, String), BackupError> {
    let json = serde_json::to_vec(payload).map_err(|e| BackupError::Serialization(e.to_string()))?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&json)
        .and_then(|_| encoder.finish())
        .map_err(|e| BackupError::Serialization(e.to_string()))
        .map(|bytes| {
            let checksum = checksum(&bytes);
            (bytes, checksum)
        })
}

/// Decompress and parse stored backup bytes.
pub fn decode(bytes: &[u8]) -> Result<SnapshotPayload, BackupError> {
    let mut decoder = GzDecoder::new(bytes);
    let mut json = Vec::new();
    decoder
        .read_to_end(&mut json)
        .map_err(|e| BackupError::Serialization(e.to_string()))?;
    serde_json::from_slice(&json).map_err(|e| BackupError::Serialization(e.to_string()))
}

/// SHA-256 checksum of stored bytes, hex-encoded.
pub fn checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
