//! Tick, feature and anomaly persistence
//!
//! Every collection is keyed by `(instrument_id, timestamp)`. A [`Store`] writes
//! to an optional primary backend and falls back to the local file backend when
//! the primary fails; the failure is logged, never returned. Writes are upserts,
//! so replaying a batch cannot create duplicates.

mod file;
mod rest;
mod sqlite;

pub use file::FileBackend;
pub use rest::RestBackend;
pub use sqlite::SqliteBackend;

use crate::config::{PrimaryBackend, StorageConfig};
use crate::error::StorageError;
use crate::models::{AnomalyRecord, FeatureVector, Tick};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, warn};

/// Logical collection a row belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Ticks,
    Features,
    Anomalies,
}

impl Collection {
    /// Table name in remote and SQLite backends
    pub fn table(&self) -> &'static str {
        match self {
            Collection::Ticks => "market_ticks",
            Collection::Features => "market_features",
            Collection::Anomalies => "anomalies",
        }
    }

    pub fn all() -> [Collection; 3] {
        [Collection::Ticks, Collection::Features, Collection::Anomalies]
    }
}

/// A record as the backends see it: its key plus the serialized record.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub instrument_id: String,
    pub timestamp: DateTime<Utc>,
    pub body: Value,
}

impl Row {
    /// Build a row from any JSON object carrying `instrument_id` and `timestamp`.
    pub fn from_body(body: Value) -> Result<Self, StorageError> {
        let instrument_id = body
            .get("instrument_id")
            .and_then(Value::as_str)
            .ok_or_else(|| StorageError::MalformedRow("missing instrument_id".to_string()))?
            .to_string();
        let timestamp = body
            .get("timestamp")
            .and_then(Value::as_str)
            .ok_or_else(|| StorageError::MalformedRow("missing timestamp".to_string()))
            .and_then(|s| {
                DateTime::parse_from_rfc3339(s)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| StorageError::MalformedRow(format!("bad timestamp {s}: {e}")))
            })?;
        Ok(Self {
            instrument_id,
            timestamp,
            body,
        })
    }

    pub fn key(&self) -> (String, DateTime<Utc>) {
        (self.instrument_id.clone(), self.timestamp)
    }
}

/// Keep the last row per key; output is ordered by key.
pub fn dedup_rows(rows: impl IntoIterator<Item = Row>) -> Vec<Row> {
    let mut by_key: BTreeMap<(String, DateTime<Utc>), Row> = BTreeMap::new();
    for row in rows {
        by_key.insert(row.key(), row);
    }
    by_key.into_values().collect()
}

/// One concrete place rows can live.
///
/// Reads return rows in ascending timestamp order. `read_recent` returns the
/// newest `limit` rows (newest included); `read_since` returns the oldest
/// `limit` rows strictly after `after`.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn upsert(&self, collection: Collection, rows: &[Row]) -> Result<(), StorageError>;

    async fn read_recent(
        &self,
        collection: Collection,
        instrument_id: &str,
        limit: usize,
    ) -> Result<Vec<Row>, StorageError>;

    async fn read_since(
        &self,
        collection: Collection,
        instrument_id: &str,
        after: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Row>, StorageError>;

    async fn latest_timestamp(
        &self,
        collection: Collection,
        instrument_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StorageError> {
        let rows = self.read_recent(collection, instrument_id, 1).await?;
        Ok(rows.last().map(|r| r.timestamp))
    }

    /// Distinct instruments with at least one row, sorted
    async fn instruments(&self, collection: Collection) -> Result<Vec<String>, StorageError>;
}

/// A record type that can be persisted by a [`Store`]
pub trait StoredRecord: Serialize + DeserializeOwned + Send + Sync {
    const COLLECTION: Collection;

    fn instrument_id(&self) -> &str;
    fn timestamp(&self) -> DateTime<Utc>;
}

impl StoredRecord for Tick {
    const COLLECTION: Collection = Collection::Ticks;

    fn instrument_id(&self) -> &str {
        &self.instrument_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl StoredRecord for FeatureVector {
    const COLLECTION: Collection = Collection::Features;

    fn instrument_id(&self) -> &str {
        &self.instrument_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl StoredRecord for AnomalyRecord {
    const COLLECTION: Collection = Collection::Anomalies;

    fn instrument_id(&self) -> &str {
        &self.instrument_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

// ============================================================================
// Store - typed facade with primary/fallback policy
// ============================================================================

pub struct Store<T> {
    primary: Option<Arc<dyn StorageBackend>>,
    fallback: Arc<dyn StorageBackend>,
    _record: PhantomData<fn() -> T>,
}

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            primary: self.primary.clone(),
            fallback: self.fallback.clone(),
            _record: PhantomData,
        }
    }
}

pub type TickStore = Store<Tick>;
pub type FeatureStore = Store<FeatureVector>;
pub type AnomalyStore = Store<AnomalyRecord>;

impl<T: StoredRecord> Store<T> {
    pub fn new(primary: Option<Arc<dyn StorageBackend>>, fallback: Arc<dyn StorageBackend>) -> Self {
        Self {
            primary,
            fallback,
            _record: PhantomData,
        }
    }

    /// Store backed by the local backend only
    pub fn local(fallback: Arc<dyn StorageBackend>) -> Self {
        Self::new(None, fallback)
    }

    pub fn describe(&self) -> String {
        match &self.primary {
            Some(p) => format!("{} -> {}", p.name(), self.fallback.name()),
            None => self.fallback.name().to_string(),
        }
    }

    /// Best-effort single write.
    pub async fn write(&self, record: &T) -> bool {
        match self.write_batch(std::slice::from_ref(record)).await {
            Ok(_) => true,
            Err(e) => {
                warn!(
                    collection = T::COLLECTION.table(),
                    instrument = %record.instrument_id(),
                    error = %e,
                    "Write failed on every backend"
                );
                false
            }
        }
    }

    /// Upsert a batch, deduplicated by key (last one wins).
    ///
    /// Returns the number of distinct keys written. Only errors when the local
    /// fallback fails too.
    pub async fn write_batch(&self, records: &[T]) -> Result<usize, StorageError> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            rows.push(Row {
                instrument_id: record.instrument_id().to_string(),
                timestamp: record.timestamp(),
                body: serde_json::to_value(record)?,
            });
        }
        let rows = dedup_rows(rows);

        if let Some(primary) = &self.primary {
            match primary.upsert(T::COLLECTION, &rows).await {
                Ok(()) => {
                    debug!(
                        collection = T::COLLECTION.table(),
                        backend = primary.name(),
                        rows = rows.len(),
                        "Upserted rows"
                    );
                    return Ok(rows.len());
                }
                Err(e) => {
                    warn!(
                        collection = T::COLLECTION.table(),
                        backend = primary.name(),
                        error = %e,
                        "Primary store write failed, falling back to {}",
                        self.fallback.name()
                    );
                }
            }
        }

        self.fallback.upsert(T::COLLECTION, &rows).await?;
        Ok(rows.len())
    }

    pub async fn read_recent(&self, instrument_id: &str, limit: usize) -> Result<Vec<T>, StorageError> {
        if let Some(primary) = &self.primary {
            match primary.read_recent(T::COLLECTION, instrument_id, limit).await {
                Ok(rows) => return Ok(decode_rows(rows)),
                Err(e) => self.log_read_fallback(primary.name(), instrument_id, &e),
            }
        }
        let rows = self
            .fallback
            .read_recent(T::COLLECTION, instrument_id, limit)
            .await?;
        Ok(decode_rows(rows))
    }

    pub async fn read_since(
        &self,
        instrument_id: &str,
        after: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<T>, StorageError> {
        if let Some(primary) = &self.primary {
            match primary
                .read_since(T::COLLECTION, instrument_id, after, limit)
                .await
            {
                Ok(rows) => return Ok(decode_rows(rows)),
                Err(e) => self.log_read_fallback(primary.name(), instrument_id, &e),
            }
        }
        let rows = self
            .fallback
            .read_since(T::COLLECTION, instrument_id, after, limit)
            .await?;
        Ok(decode_rows(rows))
    }

    pub async fn latest_timestamp(
        &self,
        instrument_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StorageError> {
        if let Some(primary) = &self.primary {
            match primary.latest_timestamp(T::COLLECTION, instrument_id).await {
                Ok(ts) => return Ok(ts),
                Err(e) => self.log_read_fallback(primary.name(), instrument_id, &e),
            }
        }
        self.fallback
            .latest_timestamp(T::COLLECTION, instrument_id)
            .await
    }

    pub async fn instruments(&self) -> Result<Vec<String>, StorageError> {
        if let Some(primary) = &self.primary {
            match primary.instruments(T::COLLECTION).await {
                Ok(ids) => return Ok(ids),
                Err(e) => self.log_read_fallback(primary.name(), "*", &e),
            }
        }
        self.fallback.instruments(T::COLLECTION).await
    }

    fn log_read_fallback(&self, backend: &str, instrument_id: &str, error: &StorageError) {
        warn!(
            collection = T::COLLECTION.table(),
            backend,
            instrument = %instrument_id,
            error = %error,
            "Primary store read failed, reading from {}",
            self.fallback.name()
        );
    }
}

fn decode_rows<T: StoredRecord>(rows: Vec<Row>) -> Vec<T> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        match serde_json::from_value::<T>(row.body) {
            Ok(record) => out.push(record),
            Err(e) => warn!(
                collection = T::COLLECTION.table(),
                instrument = %row.instrument_id,
                timestamp = %row.timestamp,
                error = %e,
                "Skipping undecodable row"
            ),
        }
    }
    out
}

/// The three stores of one process, sharing backends.
#[derive(Clone)]
pub struct StorageSet {
    pub ticks: TickStore,
    pub features: FeatureStore,
    pub anomalies: AnomalyStore,
}

impl StorageSet {
    pub fn new(primary: Option<Arc<dyn StorageBackend>>, fallback: Arc<dyn StorageBackend>) -> Self {
        Self {
            ticks: Store::new(primary.clone(), fallback.clone()),
            features: Store::new(primary.clone(), fallback.clone()),
            anomalies: Store::new(primary, fallback),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Result<Self, StorageError> {
        let fallback: Arc<dyn StorageBackend> = Arc::new(FileBackend::new(&config.data_dir)?);
        let primary: Option<Arc<dyn StorageBackend>> = match config.primary {
            PrimaryBackend::None => None,
            PrimaryBackend::Sqlite => Some(Arc::new(SqliteBackend::open(&config.sqlite_path)?)),
            PrimaryBackend::Rest => {
                let url = config.rest_url.clone().ok_or_else(|| {
                    StorageError::Remote("rest backend selected without a url".to_string())
                })?;
                Some(Arc::new(RestBackend::new(
                    url,
                    config.rest_key.clone().unwrap_or_default(),
                    config.request_timeout(),
                )?))
            }
        };
        Ok(Self::new(primary, fallback))
    }

    pub fn describe(&self) -> String {
        self.ticks.describe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_row_from_body() {
        let row = Row::from_body(json!({
            "instrument_id": "X",
            "timestamp": "2024-01-02T00:00:00Z",
            "price": 1.0
        }))
        .unwrap();
        assert_eq!(row.instrument_id, "X");
        assert_eq!(row.timestamp, Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap());

        assert!(Row::from_body(json!({"timestamp": "2024-01-02T00:00:00Z"})).is_err());
        assert!(Row::from_body(json!({"instrument_id": "X", "timestamp": "soon"})).is_err());
    }

    #[test]
    fn test_dedup_keeps_last() {
        let t = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let row = |v: i64| Row {
            instrument_id: "X".into(),
            timestamp: t,
            body: json!({ "v": v }),
        };
        let rows = dedup_rows(vec![row(1), row(2)]);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].body["v"], 2);
    }
}
