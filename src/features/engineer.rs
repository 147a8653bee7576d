//! Rolling feature computation over a tick window

use super::rolling::{finite_or_zero, mean, population_std, simple_returns, zscore};
use crate::config::FeatureSettings;
use crate::models::{FeatureVector, Tick};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub const VOLUME_MEAN_SHORT: &str = "volume_mean_short";
pub const VOLUME_MEAN_LONG: &str = "volume_mean_long";
pub const VOLUME_RATIO: &str = "volume_ratio";
pub const VOLUME_ZSCORE: &str = "volume_zscore";
pub const PRICE_ZSCORE: &str = "price_zscore";
pub const PRICE_RETURN: &str = "price_return";
pub const PRICE_VOLATILITY: &str = "price_volatility";

/// Stateless feature engineer; a pure function of its settings and input.
#[derive(Debug, Clone)]
pub struct FeatureEngineer {
    min_window: usize,
    long_window: Option<usize>,
    epsilon: f64,
}

impl Default for FeatureEngineer {
    fn default() -> Self {
        Self::new(&FeatureSettings::default())
    }
}

impl FeatureEngineer {
    pub fn new(settings: &FeatureSettings) -> Self {
        Self {
            min_window: settings.min_window.max(1),
            long_window: settings.long_window,
            epsilon: settings.epsilon,
        }
    }

    pub fn min_window(&self) -> usize {
        self.min_window
    }

    /// Names of every feature this engineer emits, in map order
    pub fn feature_names(&self) -> Vec<String> {
        let mut names = vec![
            PRICE_RETURN,
            PRICE_VOLATILITY,
            PRICE_ZSCORE,
            VOLUME_MEAN_SHORT,
            VOLUME_RATIO,
            VOLUME_ZSCORE,
        ];
        if self.long_window.is_some() {
            names.push(VOLUME_MEAN_LONG);
        }
        let mut names: Vec<String> = names.into_iter().map(String::from).collect();
        names.sort();
        names
    }

    /// Number of vectors `n` ticks yield
    pub fn expected_len(&self, n: usize) -> usize {
        (n + 1).saturating_sub(self.min_window)
    }

    /// Sort, validate and window the ticks of one instrument.
    ///
    /// Ticks for other instruments and ticks with a non-finite or non-positive
    /// price are dropped. Duplicate timestamps keep the last tick given.
    pub fn compute(&self, instrument_id: &str, ticks: &[Tick]) -> FeatureSeries {
        let mut clean: Vec<Tick> = Vec::with_capacity(ticks.len());
        let mut dropped = 0usize;
        for tick in ticks {
            if tick.instrument_id != instrument_id {
                dropped += 1;
                continue;
            }
            if !tick.price.is_finite() || tick.price <= 0.0 || tick.volume < 0 {
                dropped += 1;
                continue;
            }
            clean.push(tick.clone());
        }
        if dropped > 0 {
            warn!(
                instrument = %instrument_id,
                dropped,
                "Dropped ticks that failed validation"
            );
        }

        // Stable sort keeps input order for equal timestamps, so the last one wins below.
        clean.sort_by_key(|t| t.timestamp);
        let mut deduped: Vec<Tick> = Vec::with_capacity(clean.len());
        for tick in clean {
            match deduped.last_mut() {
                Some(last) if last.timestamp == tick.timestamp => *last = tick,
                _ => deduped.push(tick),
            }
        }

        FeatureSeries::new(instrument_id, deduped, self.clone())
    }

    fn vector_at(&self, data: &SeriesData, i: usize) -> FeatureVector {
        let start = i + 1 - self.min_window;
        let volumes = &data.volumes[start..=i];
        let prices = &data.prices[start..=i];

        let volume = data.volumes[i];
        let price = data.prices[i];

        let vol_mean = mean(volumes);
        let vol_std = population_std(volumes);
        let price_mean = mean(prices);
        let price_std = population_std(prices);

        // Returns between ticks that are both inside the short window.
        let window_returns = &data.returns[start + 1..=i];
        let volatility = if window_returns.len() >= 2 {
            population_std(window_returns)
        } else {
            0.0
        };

        let mut raw: Vec<(&'static str, f64)> = vec![
            (VOLUME_MEAN_SHORT, vol_mean),
            (VOLUME_RATIO, volume / vol_mean),
            (VOLUME_ZSCORE, zscore(volume, vol_mean, vol_std, self.epsilon)),
            (PRICE_ZSCORE, zscore(price, price_mean, price_std, self.epsilon)),
            (PRICE_RETURN, data.returns[i]),
            (PRICE_VOLATILITY, volatility),
        ];
        if let Some(long) = self.long_window {
            // Partial long window until enough history accumulates.
            let span = long.min(i + 1);
            raw.push((VOLUME_MEAN_LONG, mean(&data.volumes[i + 1 - span..=i])));
        }

        let mut named_features = BTreeMap::new();
        for (name, value) in raw {
            if !value.is_finite() {
                debug!(
                    instrument = %data.instrument_id,
                    feature = name,
                    index = i,
                    "Non-finite feature replaced with 0.0"
                );
            }
            named_features.insert(name.to_string(), finite_or_zero(value));
        }

        FeatureVector {
            instrument_id: data.instrument_id.clone(),
            timestamp: data.ticks[i].timestamp,
            named_features,
        }
    }
}

#[derive(Debug)]
struct SeriesData {
    instrument_id: String,
    ticks: Vec<Tick>,
    prices: Vec<f64>,
    volumes: Vec<f64>,
    returns: Vec<f64>,
}

/// Lazy, restartable sequence of feature vectors for one instrument.
///
/// Cloning is cheap; each call to [`FeatureSeries::iter`] starts from the
/// first eligible tick again.
#[derive(Debug, Clone)]
pub struct FeatureSeries {
    data: Arc<SeriesData>,
    engineer: FeatureEngineer,
}

impl FeatureSeries {
    fn new(instrument_id: &str, ticks: Vec<Tick>, engineer: FeatureEngineer) -> Self {
        let prices: Vec<f64> = ticks.iter().map(|t| t.price).collect();
        let volumes: Vec<f64> = ticks.iter().map(|t| t.volume as f64).collect();
        let returns = simple_returns(&prices);
        Self {
            data: Arc::new(SeriesData {
                instrument_id: instrument_id.to_string(),
                ticks,
                prices,
                volumes,
                returns,
            }),
            engineer,
        }
    }

    pub fn instrument_id(&self) -> &str {
        &self.data.instrument_id
    }

    /// Valid ticks after sorting and dedup
    pub fn tick_count(&self) -> usize {
        self.data.ticks.len()
    }

    pub fn len(&self) -> usize {
        self.engineer.expected_len(self.data.ticks.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> FeatureIter {
        FeatureIter {
            series: self.clone(),
            next: self.engineer.min_window - 1,
        }
    }
}

impl<'a> IntoIterator for &'a FeatureSeries {
    type Item = FeatureVector;
    type IntoIter = FeatureIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct FeatureIter {
    series: FeatureSeries,
    next: usize,
}

impl Iterator for FeatureIter {
    type Item = FeatureVector;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.series.data.ticks.len() {
            return None;
        }
        let v = self.series.engineer.vector_at(&self.series.data, self.next);
        self.next += 1;
        Some(v)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.series.data.ticks.len().saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for FeatureIter {}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn ticks(n: usize) -> Vec<Tick> {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| {
                Tick::new(
                    "X",
                    t0 + Duration::days(i as i64),
                    100.0 + (i % 3) as f64,
                    1_000 + (i as i64 % 4) * 10,
                )
            })
            .collect()
    }

    #[test]
    fn test_vector_count_matches_window() {
        let fe = FeatureEngineer::default();
        for n in [0, 1, 4, 5, 6, 20] {
            let series = fe.compute("X", &ticks(n));
            let out: Vec<_> = series.iter().collect();
            assert_eq!(out.len(), n.saturating_sub(4), "n = {}", n);
            assert_eq!(series.len(), out.len());
        }
    }

    #[test]
    fn test_all_values_finite_even_for_flat_input() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let flat: Vec<Tick> = (0..8)
            .map(|i| Tick::new("X", t0 + Duration::days(i), 50.0, 0))
            .collect();
        let fe = FeatureEngineer::default();
        for v in fe.compute("X", &flat).iter() {
            assert_eq!(v.named_features.len(), fe.feature_names().len());
            assert!(v.named_features.values().all(|x| x.is_finite()));
            assert_eq!(v.get(VOLUME_RATIO), Some(0.0));
            assert_eq!(v.get(PRICE_ZSCORE), Some(0.0));
        }
    }

    #[test]
    fn test_unsorted_and_duplicate_input() {
        let mut input = ticks(6);
        input.reverse();
        let mut dup = input[0].clone();
        dup.volume = 9_999;
        input.push(dup.clone());

        let series = FeatureEngineer::default().compute("X", &input);
        assert_eq!(series.tick_count(), 6);
        let last = series.iter().last().unwrap();
        assert_eq!(last.timestamp, dup.timestamp);
        // The replacement tick's volume drives the last ratio.
        assert!(last.get(VOLUME_RATIO).unwrap() > 1.0);
    }

    #[test]
    fn test_foreign_and_invalid_ticks_dropped() {
        let mut input = ticks(6);
        input[2].price = f64::NAN;
        input.push(Tick::new("Y", Utc::now(), 1.0, 1));
        let series = FeatureEngineer::default().compute("X", &input);
        assert_eq!(series.tick_count(), 5);
        assert_eq!(series.len(), 1);
    }

    #[test]
    fn test_restartable_and_deterministic() {
        let fe = FeatureEngineer::default();
        let series = fe.compute("X", &ticks(12));
        let a = serde_json::to_vec(&series.iter().collect::<Vec<_>>()).unwrap();
        let b = serde_json::to_vec(&series.iter().collect::<Vec<_>>()).unwrap();
        let c = serde_json::to_vec(&fe.compute("X", &ticks(12)).iter().collect::<Vec<_>>())
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn test_first_vector_values() {
        let fe = FeatureEngineer::default();
        let first = fe.compute("X", &ticks(5)).iter().next().unwrap();
        // volumes 1000, 1010, 1020, 1030, 1000
        assert!((first.get(VOLUME_MEAN_SHORT).unwrap() - 1012.0).abs() < 1e-9);
        assert!((first.get(VOLUME_MEAN_LONG).unwrap() - 1012.0).abs() < 1e-9);
        // prices 100, 101, 102, 100, 101
        assert!((first.get(PRICE_RETURN).unwrap() - 0.01).abs() < 1e-12);
    }
}
