//! Primary/fallback behaviour and key deduplication across backends.

mod common;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tick_sentinel::error::StorageError;
use tick_sentinel::models::Tick;
use tick_sentinel::storage::{
    Collection, FileBackend, Row, SqliteBackend, StorageBackend, Store, StorageSet, TickStore,
};

/// Primary that is always down.
#[derive(Default)]
struct FailingBackend {
    calls: AtomicUsize,
}

#[async_trait]
impl StorageBackend for FailingBackend {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn upsert(&self, _: Collection, _: &[Row]) -> Result<(), StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StorageError::Remote("connection refused".to_string()))
    }

    async fn read_recent(&self, _: Collection, _: &str, _: usize) -> Result<Vec<Row>, StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StorageError::Timeout(2))
    }

    async fn read_since(
        &self,
        _: Collection,
        _: &str,
        _: Option<DateTime<Utc>>,
        _: usize,
    ) -> Result<Vec<Row>, StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StorageError::Timeout(2))
    }

    async fn instruments(&self, _: Collection) -> Result<Vec<String>, StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StorageError::Remote("connection refused".to_string()))
    }
}

fn file_backend(dir: &std::path::Path) -> Arc<dyn StorageBackend> {
    Arc::new(FileBackend::new(dir).unwrap())
}

#[tokio::test]
async fn test_write_survives_primary_outage() {
    let dir = tempfile::tempdir().unwrap();
    let failing = Arc::new(FailingBackend::default());
    let primary: Arc<dyn StorageBackend> = failing.clone();
    let store: TickStore = Store::new(Some(primary), file_backend(dir.path()));
    assert_eq!(store.describe(), "failing -> local-file");

    let ticks = calm_ticks("X", 6);
    assert_eq!(store.write_batch(&ticks).await.unwrap(), 6);
    assert!(store.write(&ticks[0]).await);

    let back = store.read_recent("X", 100).await.unwrap();
    assert_eq!(back, ticks);
    assert_eq!(
        store.latest_timestamp("X").await.unwrap(),
        Some(ticks[5].timestamp)
    );
    assert_eq!(store.instruments().await.unwrap(), vec!["X".to_string()]);
    assert!(failing.calls.load(Ordering::SeqCst) >= 5);

    // The fallback alone sees the same rows.
    let local: TickStore = Store::local(file_backend(dir.path()));
    assert_eq!(local.read_recent("X", 100).await.unwrap().len(), 6);
}

#[tokio::test]
async fn test_storage_set_shares_fallback() {
    let dir = tempfile::tempdir().unwrap();
    let set = StorageSet::new(
        Some(Arc::new(FailingBackend::default())),
        file_backend(dir.path()),
    );
    set.ticks.write_batch(&spike_ticks("X")).await.unwrap();
    feature_job(&set).run("X").await.unwrap();
    assert_eq!(set.features.read_recent("X", 100).await.unwrap().len(), 16);
    assert!(set.describe().contains("local-file"));
}

async fn assert_dedups(store: TickStore) {
    let t = t0();
    let batch = vec![
        Tick::new("X", t, 10.0, 100),
        Tick::new("X", t + Duration::days(1), 11.0, 100),
        // Same key again in one batch: last one wins.
        Tick::new("X", t, 12.0, 300),
    ];
    assert_eq!(store.write_batch(&batch).await.unwrap(), 2);

    // Replaying overwrites instead of appending.
    assert_eq!(store.write_batch(&batch).await.unwrap(), 2);
    store
        .write_batch(&[Tick::new("X", t + Duration::days(1), 13.0, 50)])
        .await
        .unwrap();

    let rows = store.read_recent("X", 100).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].price, 12.0);
    assert_eq!(rows[0].volume, 300);
    assert_eq!(rows[1].price, 13.0);

    let since = store.read_since("X", Some(t), 100).await.unwrap();
    assert_eq!(since.len(), 1);
    assert_eq!(since[0].timestamp, t + Duration::days(1));
    assert!(store.write_batch(&[]).await.unwrap() == 0);
}

#[tokio::test]
async fn test_file_backend_dedups_by_key() {
    let dir = tempfile::tempdir().unwrap();
    assert_dedups(Store::local(file_backend(dir.path()))).await;
}

#[tokio::test]
async fn test_sqlite_backend_dedups_by_key() {
    let dir = tempfile::tempdir().unwrap();
    let sqlite: Arc<dyn StorageBackend> = Arc::new(SqliteBackend::in_memory().unwrap());
    let store: TickStore = Store::new(Some(sqlite), file_backend(dir.path()));
    assert_dedups(store).await;

    // Nothing reached the fallback while the primary was healthy.
    let local: TickStore = Store::local(file_backend(dir.path()));
    assert!(local.read_recent("X", 100).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_sqlite_file_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db").join("ticks.db");
    {
        let sqlite: Arc<dyn StorageBackend> = Arc::new(SqliteBackend::open(&path).unwrap());
        let store: TickStore = Store::new(Some(sqlite), file_backend(dir.path()));
        store.write_batch(&calm_ticks("RELIANCE.NS", 8)).await.unwrap();
    }
    let sqlite: Arc<dyn StorageBackend> = Arc::new(SqliteBackend::open(&path).unwrap());
    let store: TickStore = Store::new(Some(sqlite), file_backend(dir.path()));
    let recent = store.read_recent("RELIANCE.NS", 3).await.unwrap();
    assert_eq!(recent.len(), 3);
    assert_eq!(recent[2].timestamp, t0() + Duration::days(7));
    assert_eq!(recent[0].venue, "NSE");
}
