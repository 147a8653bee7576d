use crate::error::PipelineError;
use crate::features::FeatureEngineer;
use crate::models::FeatureVector;
use crate::storage::{FeatureStore, TickStore};
use tracing::{debug, info};

/// Recomputes an instrument's feature vectors from its stored ticks.
#[derive(Clone)]
pub struct FeatureJob {
    engineer: FeatureEngineer,
    ticks: TickStore,
    features: FeatureStore,
    tick_window: usize,
}

impl FeatureJob {
    pub fn new(
        engineer: FeatureEngineer,
        ticks: TickStore,
        features: FeatureStore,
        tick_window: usize,
    ) -> Self {
        Self {
            engineer,
            ticks,
            features,
            tick_window,
        }
    }

    pub fn engineer(&self) -> &FeatureEngineer {
        &self.engineer
    }

    /// Read the recent tick window, compute vectors and upsert them.
    ///
    /// Fails with `InsufficientHistory` when fewer than `min_window` valid
    /// ticks are stored.
    pub async fn run(&self, instrument_id: &str) -> Result<usize, PipelineError> {
        let ticks = self.ticks.read_recent(instrument_id, self.tick_window).await?;
        let series = self.engineer.compute(instrument_id, &ticks);
        if series.is_empty() {
            info!(
                instrument = %instrument_id,
                ticks = series.tick_count(),
                required = self.engineer.min_window(),
                "Not enough history for features"
            );
            return Err(PipelineError::InsufficientHistory {
                instrument: instrument_id.to_string(),
                available: series.tick_count(),
                required: self.engineer.min_window(),
            });
        }

        let vectors: Vec<FeatureVector> = series.iter().collect();
        debug!(instrument = %instrument_id, vectors = vectors.len(), "Computed feature vectors");
        let written = self.features.write_batch(&vectors).await?;
        info!(instrument = %instrument_id, written, "🧮 Stored feature vectors");
        Ok(written)
    }
}
