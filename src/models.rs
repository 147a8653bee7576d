use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One bar as returned by a market-data provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OhlcvBar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

/// Raw market observation for one instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub instrument_id: String,
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub volume: i64,
    pub venue: String,
}

impl Tick {
    pub fn new(
        instrument_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        price: f64,
        volume: i64,
    ) -> Self {
        let instrument_id = instrument_id.into();
        let venue = venue_for(&instrument_id).to_string();
        Self {
            instrument_id,
            timestamp,
            price,
            volume,
            venue,
        }
    }

    /// Build a tick from a provider bar; the close is the observed price.
    pub fn from_bar(instrument_id: &str, bar: &OhlcvBar) -> Self {
        Self::new(instrument_id, bar.timestamp, bar.close, bar.volume)
    }
}

/// Exchange inferred from the instrument symbol suffix
pub fn venue_for(instrument_id: &str) -> &'static str {
    if instrument_id.ends_with(".NS") {
        "NSE"
    } else if instrument_id.ends_with(".BO") {
        "BSE"
    } else {
        "NYSE"
    }
}

/// Rolling statistics for one instrument at one timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub instrument_id: String,
    pub timestamp: DateTime<Utc>,
    pub named_features: BTreeMap<String, f64>,
}

impl FeatureVector {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.named_features.get(name).copied()
    }
}

/// A scored feature vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub instrument_id: String,
    pub timestamp: DateTime<Utc>,
    /// Normalized to [0, 1]
    pub score: f64,
    pub model_version: String,
    pub is_flagged: bool,
    pub contributions: BTreeMap<String, f64>,
    pub raw_sample: FeatureVector,
}

impl AnomalyRecord {
    /// `is_flagged` is always derived from `score > threshold`.
    pub fn new(
        sample: FeatureVector,
        score: f64,
        threshold: f64,
        model_version: impl Into<String>,
        contributions: BTreeMap<String, f64>,
    ) -> Self {
        Self {
            instrument_id: sample.instrument_id.clone(),
            timestamp: sample.timestamp,
            score,
            model_version: model_version.into(),
            is_flagged: score > threshold,
            contributions,
            raw_sample: sample,
        }
    }

    /// Largest contributions first; ties broken by feature name.
    pub fn top_contributions(&self, n: usize) -> Vec<(&str, f64)> {
        let mut ranked: Vec<(&str, f64)> = self
            .contributions
            .iter()
            .map(|(k, v)| (k.as_str(), *v))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        ranked.truncate(n);
        ranked
    }

    /// Short human-readable reason, e.g. `volume_ratio 6.2σ, volume_zscore 3.9σ`
    pub fn explanation(&self, n: usize) -> String {
        let parts: Vec<String> = self
            .top_contributions(n)
            .into_iter()
            .map(|(name, v)| format!("{} {:.1}σ", name, v))
            .collect();
        if parts.is_empty() {
            "no feature deviations recorded".to_string()
        } else {
            parts.join(", ")
        }
    }
}
