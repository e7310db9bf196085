//! SQLite record store
//!
//! Persistent storage using SQLite with WAL mode for crash safety. All
//! calls go through `spawn_blocking` so the async runtime never blocks on
//! database I/O.

use super::RecordStore;
use crate::error::{Error, Result};
use crate::types::{DownloadId, DownloadRecord, DownloadStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;

/// SQLite-backed store for download records
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a store at the given path
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    Error::Database(format!("failed to create database directory: {}", e))
                })?;
            }
        }

        let path = path.to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = Connection::open(&path)?;

            // WAL mode for better concurrency and crash safety
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;

            migrate(&conn)?;

            Ok(conn)
        })
        .await
        .map_err(|e| Error::Database(format!("failed to initialize database: {}", e)))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing)
    pub async fn in_memory() -> Result<Self> {
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = Connection::open_in_memory()?;
            migrate(&conn)?;
            Ok(conn)
        })
        .await
        .map_err(|e| Error::Database(format!("failed to create in-memory database: {}", e)))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

/// Current schema version — bump when adding migrations
const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Database schema v1
const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS downloads (
    id TEXT PRIMARY KEY,
    source_reference TEXT NOT NULL,
    info_hash TEXT,
    display_name TEXT NOT NULL,
    size_bytes INTEGER,
    status TEXT NOT NULL,
    save_path TEXT,
    error TEXT,
    started_at TEXT,
    completed_at TEXT,
    created_at TEXT NOT NULL,
    owner_id TEXT NOT NULL,
    media_id TEXT,
    origin TEXT,
    quality TEXT,
    language TEXT
);

-- One record per distinct source reference (idempotent start)
CREATE UNIQUE INDEX IF NOT EXISTS idx_downloads_source ON downloads(source_reference);
CREATE INDEX IF NOT EXISTS idx_downloads_status ON downloads(status);
CREATE INDEX IF NOT EXISTS idx_downloads_owner ON downloads(owner_id);
"#;

/// Run schema migrations to bring the database up to `CURRENT_SCHEMA_VERSION`.
///
/// Uses `PRAGMA user_version` to track the current version; the function is
/// idempotent, so calling it on an already-current database is a no-op.
fn migrate(conn: &Connection) -> std::result::Result<(), rusqlite::Error> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if version < 1 {
        conn.execute_batch(SCHEMA_V1)?;
        conn.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)?;
    }

    Ok(())
}

const RECORD_COLUMNS: &str = "id, source_reference, info_hash, display_name, size_bytes, status, \
     save_path, error, started_at, completed_at, created_at, owner_id, \
     media_id, origin, quality, language";

#[async_trait]
impl RecordStore for SqliteStore {
    async fn insert(&self, record: &DownloadRecord) -> Result<()> {
        let conn = self.conn.clone();
        let record = record.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn.blocking_lock();
            conn.execute(
                &format!(
                    "INSERT INTO downloads ({}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                    RECORD_COLUMNS
                ),
                record_params(&record),
            )?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Database(format!("failed to insert record: {}", e)))?
    }

    async fn update(&self, record: &DownloadRecord) -> Result<()> {
        let conn = self.conn.clone();
        let record = record.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn.blocking_lock();
            let changed = conn.execute(
                "UPDATE downloads SET
                    source_reference = ?2, info_hash = ?3, display_name = ?4,
                    size_bytes = ?5, status = ?6, save_path = ?7, error = ?8,
                    started_at = ?9, completed_at = ?10, created_at = ?11,
                    owner_id = ?12, media_id = ?13, origin = ?14, quality = ?15,
                    language = ?16
                 WHERE id = ?1",
                record_params(&record),
            )?;
            if changed == 0 {
                return Err(Error::NotFound(record.id.to_string()));
            }
            Ok(())
        })
        .await
        .map_err(|e| Error::Database(format!("failed to update record: {}", e)))?
    }

    async fn get(&self, id: DownloadId) -> Result<Option<DownloadRecord>> {
        let conn = self.conn.clone();
        let id_str = id.to_string();

        tokio::task::spawn_blocking(move || -> Result<Option<DownloadRecord>> {
            let conn = conn.blocking_lock();
            let result = conn
                .query_row(
                    &format!("SELECT {} FROM downloads WHERE id = ?1", RECORD_COLUMNS),
                    params![id_str],
                    row_to_record,
                )
                .optional()?;
            Ok(result)
        })
        .await
        .map_err(|e| Error::Database(format!("failed to load record: {}", e)))?
    }

    async fn find_by_source(&self, reference: &str) -> Result<Option<DownloadRecord>> {
        let conn = self.conn.clone();
        let reference = reference.to_string();

        tokio::task::spawn_blocking(move || -> Result<Option<DownloadRecord>> {
            let conn = conn.blocking_lock();
            let result = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM downloads WHERE source_reference = ?1",
                        RECORD_COLUMNS
                    ),
                    params![reference],
                    row_to_record,
                )
                .optional()?;
            Ok(result)
        })
        .await
        .map_err(|e| Error::Database(format!("failed to look up record: {}", e)))?
    }

    async fn list(&self, owner_id: Option<&str>) -> Result<Vec<DownloadRecord>> {
        let conn = self.conn.clone();
        let owner = owner_id.map(|s| s.to_string());

        tokio::task::spawn_blocking(move || -> Result<Vec<DownloadRecord>> {
            let conn = conn.blocking_lock();
            let mut records = Vec::new();

            match owner {
                Some(owner) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {} FROM downloads WHERE owner_id = ?1 ORDER BY created_at DESC",
                        RECORD_COLUMNS
                    ))?;
                    let iter = stmt.query_map(params![owner], row_to_record)?;
                    for record in iter {
                        records.push(record?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {} FROM downloads ORDER BY created_at DESC",
                        RECORD_COLUMNS
                    ))?;
                    let iter = stmt.query_map([], row_to_record)?;
                    for record in iter {
                        records.push(record?);
                    }
                }
            }

            Ok(records)
        })
        .await
        .map_err(|e| Error::Database(format!("failed to list records: {}", e)))?
    }

    async fn load_all(&self) -> Result<Vec<DownloadRecord>> {
        self.list(None).await
    }

    async fn delete(&self, id: DownloadId) -> Result<()> {
        let conn = self.conn.clone();
        let id_str = id.to_string();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn.blocking_lock();
            conn.execute("DELETE FROM downloads WHERE id = ?1", params![id_str])?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Database(format!("failed to delete record: {}", e)))?
    }

    async fn health_check(&self) -> Result<()> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn.blocking_lock();
            let _: i64 = conn.query_row("SELECT 1", [], |row| row.get(0))?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Database(format!("health check failed: {}", e)))?
    }
}

fn record_params(record: &DownloadRecord) -> [Box<dyn rusqlite::ToSql>; 16] {
    [
        Box::new(record.id.to_string()),
        Box::new(record.source_reference.clone()),
        Box::new(record.info_hash.clone()),
        Box::new(record.display_name.clone()),
        Box::new(record.size_bytes.map(|s| s as i64)),
        Box::new(record.status.as_str()),
        Box::new(
            record
                .save_path
                .as_ref()
                .map(|p| p.to_string_lossy().to_string()),
        ),
        Box::new(record.error.clone()),
        Box::new(record.started_at.map(|t| t.to_rfc3339())),
        Box::new(record.completed_at.map(|t| t.to_rfc3339())),
        Box::new(record.created_at.to_rfc3339()),
        Box::new(record.owner_id.clone()),
        Box::new(record.media_id.clone()),
        Box::new(record.origin.clone()),
        Box::new(record.quality.clone()),
        Box::new(record.language.clone()),
    ]
}

/// Convert a database row to a DownloadRecord
fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<DownloadRecord> {
    let id_str: String = row.get(0)?;
    let source_reference: String = row.get(1)?;
    let info_hash: Option<String> = row.get(2)?;
    let display_name: String = row.get(3)?;
    let size_bytes: Option<i64> = row.get(4)?;
    let status_str: String = row.get(5)?;
    let save_path: Option<String> = row.get(6)?;
    let error: Option<String> = row.get(7)?;
    let started_at: Option<String> = row.get(8)?;
    let completed_at: Option<String> = row.get(9)?;
    let created_at: String = row.get(10)?;
    let owner_id: String = row.get(11)?;
    let media_id: Option<String> = row.get(12)?;
    let origin: Option<String> = row.get(13)?;
    let quality: Option<String> = row.get(14)?;
    let language: Option<String> = row.get(15)?;

    let id = DownloadId::parse(&id_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("invalid download id: {}", id_str).into(),
        )
    })?;

    // Unknown status values (schema drift, manual edits) fall back to Failed
    // so the record surfaces for user attention instead of silently running.
    let status = DownloadStatus::from_str(&status_str).unwrap_or_else(|_| {
        tracing::warn!("unknown status '{}' for download {}", status_str, id_str);
        DownloadStatus::Failed
    });

    Ok(DownloadRecord {
        id,
        source_reference,
        info_hash,
        display_name,
        size_bytes: size_bytes.map(|s| s as u64),
        status,
        save_path: save_path.map(PathBuf::from),
        error,
        started_at: started_at.as_deref().and_then(parse_timestamp),
        completed_at: completed_at.as_deref().and_then(parse_timestamp),
        created_at: parse_timestamp(&created_at).unwrap_or_else(Utc::now),
        owner_id,
        media_id,
        origin,
        quality,
        language,
    })
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
