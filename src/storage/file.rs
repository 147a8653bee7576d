//! Local JSON-file backend
//!
//! Layout under the data directory:
//! - `ticks/{instrument}.json`
//! - `features/{instrument}_features.json`
//! - `anomalies/anomalies.json` (all instruments)
//!
//! Each file is a JSON array. Writes are read-modify-write under one process
//! lock, merged by key and replaced via temp file + rename, so a write costs
//! O(rows already in the file). Anomaly writes from every instrument share one
//! file and queue on the lock. File I/O runs on tokio's blocking pool.

use super::{Collection, Row, StorageBackend};
use crate::error::StorageError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct FileBackend {
    inner: Arc<FileStore>,
}

struct FileStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileBackend {
    pub fn new(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        for dir in ["ticks", "features", "anomalies"] {
            let path = root.join(dir);
            std::fs::create_dir_all(&path).map_err(|e| io_err(&path, e))?;
        }
        Ok(Self {
            inner: Arc::new(FileStore {
                root,
                write_lock: Mutex::new(()),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Run `f` against the store on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&FileStore) -> Result<T, StorageError> + Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&store)).await?
    }
}

impl FileStore {
    fn path_for(&self, collection: Collection, instrument_id: &str) -> PathBuf {
        let safe = sanitize(instrument_id);
        match collection {
            Collection::Ticks => self.root.join("ticks").join(format!("{safe}.json")),
            Collection::Features => self
                .root
                .join("features")
                .join(format!("{safe}_features.json")),
            Collection::Anomalies => self.root.join("anomalies").join("anomalies.json"),
        }
    }

    fn collection_dir(&self, collection: Collection) -> PathBuf {
        match collection {
            Collection::Ticks => self.root.join("ticks"),
            Collection::Features => self.root.join("features"),
            Collection::Anomalies => self.root.join("anomalies"),
        }
    }

    fn load(path: &Path) -> Result<Vec<Row>, StorageError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let bytes = std::fs::read(path).map_err(|e| io_err(path, e))?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        let values: Vec<Value> = serde_json::from_slice(&bytes)?;
        let mut rows = Vec::with_capacity(values.len());
        for value in values {
            match Row::from_body(value) {
                Ok(row) => rows.push(row),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping malformed stored row"),
            }
        }
        Ok(rows)
    }

    fn store(path: &Path, rows: &[Row]) -> Result<(), StorageError> {
        let bodies: Vec<&Value> = rows.iter().map(|r| &r.body).collect();
        let json = serde_json::to_vec_pretty(&bodies)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| io_err(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| io_err(path, e))?;
        Ok(())
    }

    fn upsert_sync(&self, collection: Collection, rows: &[Row]) -> Result<(), StorageError> {
        let mut by_file: BTreeMap<PathBuf, Vec<&Row>> = BTreeMap::new();
        for row in rows {
            by_file
                .entry(self.path_for(collection, &row.instrument_id))
                .or_default()
                .push(row);
        }

        let _guard = self.write_lock.lock();
        for (path, incoming) in by_file {
            let mut merged: BTreeMap<(String, DateTime<Utc>), Row> = Self::load(&path)?
                .into_iter()
                .map(|r| (r.key(), r))
                .collect();
            let before = merged.len();
            for row in incoming {
                merged.insert(row.key(), row.clone());
            }
            let merged: Vec<Row> = merged.into_values().collect();
            Self::store(&path, &merged)?;
            debug!(
                path = %path.display(),
                existing = before,
                total = merged.len(),
                "Merged rows into local file"
            );
        }
        Ok(())
    }

    /// Rows for one instrument, ascending by timestamp.
    fn rows_for(&self, collection: Collection, instrument_id: &str) -> Result<Vec<Row>, StorageError> {
        let path = self.path_for(collection, instrument_id);
        let mut rows: Vec<Row> = Self::load(&path)?
            .into_iter()
            .filter(|r| r.instrument_id == instrument_id)
            .collect();
        rows.sort_by_key(|r| r.timestamp);
        Ok(rows)
    }

    fn instruments_sync(&self, collection: Collection) -> Result<Vec<String>, StorageError> {
        let mut ids = BTreeSet::new();
        let paths: Vec<PathBuf> = match collection {
            Collection::Anomalies => vec![self.path_for(collection, "")],
            _ => {
                let dir = self.collection_dir(collection);
                let entries = std::fs::read_dir(&dir).map_err(|e| io_err(&dir, e))?;
                entries
                    .filter_map(|e| e.ok().map(|e| e.path()))
                    .filter(|p| p.extension().map_or(false, |ext| ext == "json"))
                    .collect()
            }
        };
        for path in paths {
            for row in Self::load(&path)? {
                ids.insert(row.instrument_id);
            }
        }
        Ok(ids.into_iter().collect())
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    fn name(&self) -> &'static str {
        "local-file"
    }

    async fn upsert(&self, collection: Collection, rows: &[Row]) -> Result<(), StorageError> {
        if rows.is_empty() {
            return Ok(());
        }
        let rows = rows.to_vec();
        self.blocking(move |store| store.upsert_sync(collection, &rows))
            .await
    }

    async fn read_recent(
        &self,
        collection: Collection,
        instrument_id: &str,
        limit: usize,
    ) -> Result<Vec<Row>, StorageError> {
        let id = instrument_id.to_string();
        let rows = self
            .blocking(move |store| store.rows_for(collection, &id))
            .await?;
        let skip = rows.len().saturating_sub(limit);
        Ok(rows.into_iter().skip(skip).collect())
    }

    async fn read_since(
        &self,
        collection: Collection,
        instrument_id: &str,
        after: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Row>, StorageError> {
        let id = instrument_id.to_string();
        let rows = self
            .blocking(move |store| store.rows_for(collection, &id))
            .await?;
        Ok(rows
            .into_iter()
            .filter(|r| after.map_or(true, |t| r.timestamp > t))
            .take(limit)
            .collect())
    }

    async fn instruments(&self, collection: Collection) -> Result<Vec<String>, StorageError> {
        self.blocking(move |store| store.instruments_sync(collection))
            .await
    }
}

fn sanitize(instrument_id: &str) -> String {
    instrument_id
        .chars()
        .map(|c| if c == '/' || c == '\\' || c == ':' { '_' } else { c })
        .collect()
}

fn io_err(path: &Path, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn row(id: &str, day: i64, v: i64) -> Row {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(day);
        Row::from_body(json!({
            "instrument_id": id,
            "timestamp": ts.to_rfc3339(),
            "v": v,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_upsert_dedups_by_key() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path()).unwrap();

        backend
            .upsert(Collection::Ticks, &[row("X", 0, 1), row("X", 1, 1)])
            .await
            .unwrap();
        backend
            .upsert(Collection::Ticks, &[row("X", 1, 2)])
            .await
            .unwrap();

        let rows = backend.read_recent(Collection::Ticks, "X", 10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].body["v"], 2);
        assert!(dir.path().join("ticks").join("X.json").exists());
    }

    #[tokio::test]
    async fn test_anomalies_share_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path()).unwrap();
        backend
            .upsert(Collection::Anomalies, &[row("A", 0, 1), row("B", 0, 1)])
            .await
            .unwrap();

        assert_eq!(
            backend.read_recent(Collection::Anomalies, "A", 10).await.unwrap().len(),
            1
        );
        assert_eq!(
            backend.instruments(Collection::Anomalies).await.unwrap(),
            vec!["A".to_string(), "B".to_string()]
        );
        let entries = std::fs::read_dir(dir.path().join("anomalies")).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_anomaly_writes_all_land() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FileBackend::new(dir.path()).unwrap());

        let writers: Vec<_> = (0..8)
            .map(|n| {
                let backend = backend.clone();
                tokio::spawn(async move {
                    let id = format!("I{n}");
                    for day in 0..5 {
                        backend
                            .upsert(Collection::Anomalies, &[row(&id, day, n)])
                            .await
                            .unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        let ids = backend.instruments(Collection::Anomalies).await.unwrap();
        assert_eq!(ids.len(), 8);
        for id in ids {
            let rows = backend.read_recent(Collection::Anomalies, &id, 100).await.unwrap();
            assert_eq!(rows.len(), 5, "{id}");
        }
    }

    #[tokio::test]
    async fn test_read_windows() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path()).unwrap();
        let rows: Vec<Row> = (0..5).map(|d| row("X", d, d)).collect();
        backend.upsert(Collection::Features, &rows).await.unwrap();

        let recent = backend.read_recent(Collection::Features, "X", 2).await.unwrap();
        assert_eq!(recent, rows[3..].to_vec());

        let since = backend
            .read_since(Collection::Features, "X", Some(rows[1].timestamp), 2)
            .await
            .unwrap();
        assert_eq!(since, rows[2..4].to_vec());

        let latest = backend.latest_timestamp(Collection::Features, "X").await.unwrap();
        assert_eq!(latest, Some(rows[4].timestamp));
        assert!(backend
            .latest_timestamp(Collection::Features, "Y")
            .await
            .unwrap()
            .is_none());
    }
}
