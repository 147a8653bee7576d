//! Shared fixtures for integration tests

#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::path::Path;
use std::sync::Arc;
use tick_sentinel::config::ModelSettings;
use tick_sentinel::detector::{AnomalyDetector, FeatureJob};
use tick_sentinel::features::FeatureEngineer;
use tick_sentinel::model::ModelHandle;
use tick_sentinel::models::{OhlcvBar, Tick};
use tick_sentinel::storage::{FileBackend, StorageBackend, StorageSet};

/// Index of the volume spike in [`spike_ticks`] (the 15th tick)
pub const SPIKE_INDEX: usize = 14;

pub const BASE_VOLUME: i64 = 1_000;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

fn price_at(i: usize) -> f64 {
    100.0 + [0.0, 0.3, 0.1, 0.4][i % 4]
}

fn volume_at(i: usize) -> i64 {
    BASE_VOLUME + 40 * (i % 3) as i64
}

/// `n` daily ticks with mildly varying price and volume.
pub fn calm_ticks(instrument: &str, n: usize) -> Vec<Tick> {
    (0..n)
        .map(|i| Tick::new(instrument, t0() + Duration::days(i as i64), price_at(i), volume_at(i)))
        .collect()
}

/// 20 ticks where tick 15 trades ten times the baseline volume.
pub fn spike_ticks(instrument: &str) -> Vec<Tick> {
    let mut ticks = calm_ticks(instrument, 20);
    ticks[SPIKE_INDEX].volume = BASE_VOLUME * 10;
    ticks
}

pub fn bars_from(ticks: &[Tick]) -> Vec<OhlcvBar> {
    ticks
        .iter()
        .map(|t| OhlcvBar {
            timestamp: t.timestamp,
            open: t.price,
            high: t.price,
            low: t.price,
            close: t.price,
            volume: t.volume,
        })
        .collect()
}

pub fn local_storage(dir: &Path) -> StorageSet {
    let fallback: Arc<dyn StorageBackend> = Arc::new(FileBackend::new(dir.join("data")).unwrap());
    StorageSet::new(None, fallback)
}

pub fn model_settings(dir: &Path) -> ModelSettings {
    ModelSettings {
        artifact_path: dir.join("models").join("model.json"),
        ..ModelSettings::default()
    }
}

pub fn feature_job(storage: &StorageSet) -> FeatureJob {
    FeatureJob::new(
        FeatureEngineer::default(),
        storage.ticks.clone(),
        storage.features.clone(),
        1_000,
    )
}

pub fn detector(storage: &StorageSet, settings: ModelSettings) -> AnomalyDetector {
    AnomalyDetector::new(
        ModelHandle::new(),
        storage.features.clone(),
        storage.anomalies.clone(),
        settings,
        FeatureEngineer::default().feature_names(),
    )
}
