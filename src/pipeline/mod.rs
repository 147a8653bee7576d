//! Per-instrument pipeline orchestration
//!
//! Each instrument runs ingest → features → detect in order. Instruments are
//! independent and run concurrently on a bounded pool of workers; each worker
//! keeps its own distance between provider calls.

mod report;

pub use report::{InstrumentOutcome, OutcomeStatus, PipelineReport};

use crate::detector::{AnomalyDetector, FeatureJob};
use crate::error::PipelineError;
use crate::ingest::Ingester;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

/// Cooperative cancellation shared by a run and whoever wants to stop it.
///
/// Units that already started are allowed to finish.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct PipelineOrchestrator {
    ingester: Option<Arc<Ingester>>,
    features: Arc<FeatureJob>,
    detector: Arc<AnomalyDetector>,
    workers: usize,
    provider_delay: Duration,
    auto_train: bool,
}

impl PipelineOrchestrator {
    pub fn new(
        ingester: Option<Ingester>,
        features: FeatureJob,
        detector: AnomalyDetector,
        workers: usize,
        provider_delay: Duration,
    ) -> Self {
        Self {
            ingester: ingester.map(Arc::new),
            features: Arc::new(features),
            detector: Arc::new(detector),
            workers: workers.max(1),
            provider_delay,
            auto_train: false,
        }
    }

    /// Train from the store when no model is loaded after the first pass.
    pub fn with_auto_train(mut self, enabled: bool) -> Self {
        self.auto_train = enabled;
        self
    }

    pub fn detector(&self) -> &AnomalyDetector {
        &self.detector
    }

    /// Run every instrument and collect one outcome per instrument.
    pub async fn run(&self, instruments: &[String], cancel: &CancelFlag) -> PipelineReport {
        let started = Instant::now();
        let mut seen = HashSet::new();
        let instruments: Vec<String> = instruments
            .iter()
            .filter(|i| seen.insert(i.as_str()))
            .cloned()
            .collect();

        let (tx, rx) = mpsc::channel::<String>(instruments.len().max(1));
        for instrument in &instruments {
            // Capacity covers every instrument, so this never waits.
            if tx.send(instrument.clone()).await.is_err() {
                break;
            }
        }
        drop(tx);

        let shared_rx = Arc::new(Mutex::new(rx));
        let workers = self.workers.min(instruments.len().max(1));
        info!(instruments = instruments.len(), workers, "🚀 Pipeline run starting");

        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let this = self.clone();
            let rx = shared_rx.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let mut done: Vec<(String, InstrumentOutcome)> = Vec::new();
                let mut last_provider_call: Option<Instant> = None;
                loop {
                    let job = { rx.lock().await.recv().await };
                    let Some(instrument) = job else {
                        break;
                    };
                    if cancel.is_cancelled() {
                        done.push((instrument, InstrumentOutcome::cancelled()));
                        continue;
                    }
                    if this.ingester.is_some() {
                        if let Some(last) = last_provider_call {
                            let since = last.elapsed();
                            if since < this.provider_delay {
                                tokio::time::sleep(this.provider_delay - since).await;
                            }
                        }
                        if cancel.is_cancelled() {
                            done.push((instrument, InstrumentOutcome::cancelled()));
                            continue;
                        }
                        last_provider_call = Some(Instant::now());
                    }
                    let outcome = this.run_instrument(&instrument).await;
                    info!(
                        worker,
                        instrument = %instrument,
                        status = outcome.status.as_str(),
                        "Instrument finished"
                    );
                    done.push((instrument, outcome));
                }
                done
            }));
        }

        let mut outcomes: BTreeMap<String, InstrumentOutcome> = BTreeMap::new();
        for handle in handles {
            match handle.await {
                Ok(done) => outcomes.extend(done),
                Err(e) => warn!(error = %e, "Pipeline worker panicked"),
            }
        }
        // Anything a crashed worker had taken off the queue has no outcome yet.
        for instrument in &instruments {
            outcomes.entry(instrument.clone()).or_insert_with(|| {
                let mut o = InstrumentOutcome::new();
                o.status = OutcomeStatus::Failed;
                o.note("worker terminated");
                o
            });
        }

        if self.auto_train && !cancel.is_cancelled() && !self.detector.model().is_loaded() {
            self.train_and_score_waiting(&instruments, &mut outcomes).await;
        }

        let report = PipelineReport {
            outcomes,
            elapsed: started.elapsed(),
        };
        info!(
            completed = report.count(OutcomeStatus::Completed),
            skipped = report.count(OutcomeStatus::Skipped),
            failed = report.count(OutcomeStatus::Failed),
            flagged = report.total_flagged(),
            "🏁 Pipeline run finished"
        );
        report
    }

    /// Second pass for instruments that had features but no model to score with.
    async fn train_and_score_waiting(
        &self,
        instruments: &[String],
        outcomes: &mut BTreeMap<String, InstrumentOutcome>,
    ) {
        if !outcomes.values().any(|o| o.awaiting_model) {
            return;
        }
        if let Err(e) = self.detector.retrain(instruments).await {
            warn!(error = %e, "Auto-training failed; instruments stay unscored");
            return;
        }
        for (instrument, outcome) in outcomes.iter_mut().filter(|(_, o)| o.awaiting_model) {
            outcome.awaiting_model = false;
            outcome.detail.retain(|d| d != NO_MODEL_NOTE);
            match self.detector.process_detailed(instrument).await {
                Ok(summary) => {
                    outcome.records_written = summary.written;
                    outcome.flagged = summary.flagged;
                    outcome.status = OutcomeStatus::Completed;
                    outcome.note("scored after training");
                }
                Err(e) => {
                    outcome.status = OutcomeStatus::Failed;
                    outcome.note(format!("detect: {e}"));
                }
            }
        }
    }

    /// Ingest → features → detect for one instrument; never panics, never
    /// returns an error.
    pub async fn run_instrument(&self, instrument: &str) -> InstrumentOutcome {
        let mut outcome = InstrumentOutcome::new();

        if let Some(ingester) = &self.ingester {
            match ingester.ingest(instrument).await {
                Ok(n) => outcome.ticks_ingested = n,
                Err(e) if e.is_zero_count() => outcome.note("no provider data"),
                Err(e) if e.is_fatal() => {
                    outcome.status = OutcomeStatus::Failed;
                    outcome.note(format!("ingest: {e}"));
                    return outcome;
                }
                Err(e) => {
                    // Stored ticks are still usable.
                    warn!(instrument = %instrument, error = %e, "Ingestion failed, continuing with stored ticks");
                    outcome.note(format!("ingest: {e}"));
                }
            }
        }

        match self.features.run(instrument).await {
            Ok(n) => outcome.features_written = n,
            Err(e @ PipelineError::InsufficientHistory { .. }) => {
                outcome.status = OutcomeStatus::Skipped;
                outcome.note(e.to_string());
                return outcome;
            }
            Err(e) => {
                warn!(instrument = %instrument, error = %e, "Feature computation failed");
                outcome.status = OutcomeStatus::Failed;
                outcome.note(format!("features: {e}"));
                return outcome;
            }
        }

        match self.detector.process_detailed(instrument).await {
            Ok(summary) => {
                outcome.records_written = summary.written;
                outcome.flagged = summary.flagged;
            }
            Err(PipelineError::ModelNotLoaded) => {
                outcome.status = OutcomeStatus::Skipped;
                outcome.awaiting_model = true;
                outcome.note(NO_MODEL_NOTE);
            }
            Err(e) => {
                warn!(instrument = %instrument, error = %e, "Detection failed");
                outcome.status = OutcomeStatus::Failed;
                outcome.note(format!("detect: {e}"));
            }
        }
        outcome
    }
}

const NO_MODEL_NOTE: &str = "no model loaded";
