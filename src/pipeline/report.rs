use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Completed,
    /// Nothing to do yet (no data, not enough history, no model)
    Skipped,
    Failed,
    /// Not started because the run was cancelled
    Cancelled,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Completed => "completed",
            OutcomeStatus::Skipped => "skipped",
            OutcomeStatus::Failed => "failed",
            OutcomeStatus::Cancelled => "cancelled",
        }
    }
}

/// What happened to one instrument during a pipeline run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstrumentOutcome {
    pub ticks_ingested: usize,
    pub features_written: usize,
    pub records_written: usize,
    pub flagged: usize,
    pub status: OutcomeStatus,
    /// Notes collected along the way; empty when everything went through
    pub detail: Vec<String>,
    #[serde(skip)]
    pub(crate) awaiting_model: bool,
}

impl InstrumentOutcome {
    pub fn new() -> Self {
        Self {
            ticks_ingested: 0,
            features_written: 0,
            records_written: 0,
            flagged: 0,
            status: OutcomeStatus::Completed,
            detail: Vec::new(),
            awaiting_model: false,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: OutcomeStatus::Cancelled,
            ..Self::new()
        }
    }

    pub fn note(&mut self, note: impl Into<String>) {
        self.detail.push(note.into());
    }
}

impl Default for InstrumentOutcome {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-instrument outcomes of one run
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub outcomes: BTreeMap<String, InstrumentOutcome>,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}

impl PipelineReport {
    pub fn count(&self, status: OutcomeStatus) -> usize {
        self.outcomes.values().filter(|o| o.status == status).count()
    }

    pub fn total_flagged(&self) -> usize {
        self.outcomes.values().map(|o| o.flagged).sum()
    }

    pub fn total_records(&self) -> usize {
        self.outcomes.values().map(|o| o.records_written).sum()
    }
}

impl fmt::Display for PipelineReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .outcomes
            .keys()
            .map(|k| k.len())
            .max()
            .unwrap_or(10)
            .max(10);

        writeln!(
            f,
            "{:<width$}  {:>7}  {:>8}  {:>7}  {:>7}  {:<9}  detail",
            "instrument", "ticks", "features", "records", "flagged", "status"
        )?;
        writeln!(f, "{}", "-".repeat(width + 60))?;
        for (instrument, o) in &self.outcomes {
            writeln!(
                f,
                "{:<width$}  {:>7}  {:>8}  {:>7}  {:>7}  {:<9}  {}",
                instrument,
                o.ticks_ingested,
                o.features_written,
                o.records_written,
                o.flagged,
                o.status.as_str(),
                o.detail.join("; ")
            )?;
        }
        writeln!(f, "{}", "-".repeat(width + 60))?;
        write!(
            f,
            "{} completed, {} skipped, {} failed, {} cancelled | {} records, {} flagged | {:.1}s",
            self.count(OutcomeStatus::Completed),
            self.count(OutcomeStatus::Skipped),
            self.count(OutcomeStatus::Failed),
            self.count(OutcomeStatus::Cancelled),
            self.total_records(),
            self.total_flagged(),
            self.elapsed.as_secs_f64()
        )
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}
