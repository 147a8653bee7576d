//! Tick ingestion from an external market data provider

mod provider;

pub use provider::{ChartApiProvider, MarketDataProvider};

use crate::config::PipelineSettings;
use crate::error::PipelineError;
use crate::models::Tick;
use crate::pipeline::CancelFlag;
use crate::storage::TickStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Fetches bars for an instrument and writes them as ticks.
#[derive(Clone)]
pub struct Ingester {
    provider: Arc<dyn MarketDataProvider>,
    ticks: TickStore,
    period: String,
    interval: String,
    delay: Duration,
}

impl Ingester {
    pub fn new(
        provider: Arc<dyn MarketDataProvider>,
        ticks: TickStore,
        settings: &PipelineSettings,
    ) -> Self {
        Self {
            provider,
            ticks,
            period: settings.provider_period.clone(),
            interval: settings.provider_interval.clone(),
            delay: settings.provider_delay(),
        }
    }

    /// Fetch and store ticks for one instrument.
    ///
    /// An empty provider response is reported as `DataUnavailable`, which
    /// callers count as zero.
    pub async fn ingest(&self, instrument_id: &str) -> Result<usize, PipelineError> {
        let bars = self
            .provider
            .fetch_bars(instrument_id, &self.period, &self.interval)
            .await?;
        if bars.is_empty() {
            info!(instrument = %instrument_id, provider = self.provider.name(), "No data from provider");
            return Err(PipelineError::DataUnavailable {
                instrument: instrument_id.to_string(),
            });
        }

        let ticks: Vec<Tick> = bars
            .iter()
            .map(|bar| Tick::from_bar(instrument_id, bar))
            .collect();
        let written = self.ticks.write_batch(&ticks).await?;
        info!(instrument = %instrument_id, written, "📥 Ingested ticks");
        Ok(written)
    }

    /// Ingest instruments one after another with the provider delay between
    /// calls. Failures count as zero and do not stop the batch.
    pub async fn ingest_all(
        &self,
        instruments: &[String],
        cancel: &CancelFlag,
    ) -> BTreeMap<String, usize> {
        let mut results = BTreeMap::new();
        for (i, instrument) in instruments.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(remaining = instruments.len() - i, "Ingestion cancelled");
                break;
            }
            if i > 0 && !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let count = match self.ingest(instrument).await {
                Ok(n) => n,
                Err(e) if e.is_zero_count() => 0,
                Err(e) => {
                    warn!(instrument = %instrument, error = %e, "Ingestion failed");
                    0
                }
            };
            results.insert(instrument.clone(), count);
        }
        let total: usize = results.values().sum();
        info!(instruments = results.len(), total, "Ingestion finished");
        results
    }
}
