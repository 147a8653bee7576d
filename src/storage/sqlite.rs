//! SQLite table backend
//!
//! One table per collection, composite primary key `(instrument_id, ts_us)`.
//! Upserts are `INSERT OR REPLACE`, so the table can never hold two rows for
//! the same key.

use super::{Collection, Row, StorageBackend};
use crate::error::StorageError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

const PRAGMAS_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;
"#;

fn table_sql(table: &str) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {table} (
    instrument_id TEXT NOT NULL,
    ts_us INTEGER NOT NULL,
    ts TEXT NOT NULL,
    body TEXT NOT NULL,
    PRIMARY KEY (instrument_id, ts_us)
) WITHOUT ROWID;
"#
    )
}

pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StorageError::Io {
                    path: parent.display().to_string(),
                    source: e,
                })?;
            }
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)?;
        let backend = Self::init(conn)?;

        let journal_mode: String = backend
            .conn
            .lock()
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }
        info!("📊 SQLite store initialized at: {}", path.display());
        Ok(backend)
    }

    /// Private in-memory database, mainly for tests.
    pub fn in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(PRAGMAS_SQL)?;
        for collection in Collection::all() {
            conn.execute_batch(&table_sql(collection.table()))?;
        }
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn upsert_sync(&self, collection: Collection, rows: &[Row]) -> Result<(), StorageError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let sql = format!(
                "INSERT OR REPLACE INTO {} (instrument_id, ts_us, ts, body) VALUES (?1, ?2, ?3, ?4)",
                collection.table()
            );
            let mut stmt = tx.prepare_cached(&sql)?;
            for row in rows {
                let body = serde_json::to_string(&row.body)?;
                stmt.execute(params![
                    row.instrument_id,
                    row.timestamp.timestamp_micros(),
                    row.timestamp.to_rfc3339(),
                    body,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn query_bodies(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Row>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(sql)?;
        let bodies = stmt
            .query_map(params, |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<String>, _>>()?;
        drop(stmt);
        drop(conn);

        bodies
            .iter()
            .map(|b| Row::from_body(serde_json::from_str(b)?))
            .collect()
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn upsert(&self, collection: Collection, rows: &[Row]) -> Result<(), StorageError> {
        self.upsert_sync(collection, rows)
    }

    async fn read_recent(
        &self,
        collection: Collection,
        instrument_id: &str,
        limit: usize,
    ) -> Result<Vec<Row>, StorageError> {
        let sql = format!(
            "SELECT body FROM {} WHERE instrument_id = ?1 ORDER BY ts_us DESC LIMIT ?2",
            collection.table()
        );
        let mut rows = self.query_bodies(&sql, params![instrument_id, limit as i64])?;
        rows.reverse();
        Ok(rows)
    }

    async fn read_since(
        &self,
        collection: Collection,
        instrument_id: &str,
        after: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Row>, StorageError> {
        let sql = format!(
            "SELECT body FROM {} WHERE instrument_id = ?1 AND ts_us > ?2 ORDER BY ts_us ASC LIMIT ?3",
            collection.table()
        );
        let after_us = after.map_or(i64::MIN, |t| t.timestamp_micros());
        self.query_bodies(&sql, params![instrument_id, after_us, limit as i64])
    }

    async fn latest_timestamp(
        &self,
        collection: Collection,
        instrument_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StorageError> {
        let sql = format!(
            "SELECT MAX(ts_us) FROM {} WHERE instrument_id = ?1",
            collection.table()
        );
        let conn = self.conn.lock();
        let max: Option<i64> = conn.query_row(&sql, params![instrument_id], |row| row.get(0))?;
        Ok(max.and_then(DateTime::<Utc>::from_timestamp_micros))
    }

    async fn instruments(&self, collection: Collection) -> Result<Vec<String>, StorageError> {
        let sql = format!(
            "SELECT DISTINCT instrument_id FROM {} ORDER BY instrument_id",
            collection.table()
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&sql)?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }
}
