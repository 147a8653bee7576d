//! Tick Sentinel - market tick anomaly detection
//!
//! ```bash
//! tick-sentinel pipeline                     # ingest → features → detect for configured tickers
//! tick-sentinel --ticker RELIANCE.NS ingest  # one instrument
//! tick-sentinel train                        # fit and persist a model from stored features
//! tick-sentinel serve --schedule-secs 3600   # HTTP API plus an hourly pipeline run
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tick_sentinel::api::{self, AppState};
use tick_sentinel::config::AppConfig;
use tick_sentinel::detector::{AnomalyDetector, FeatureJob};
use tick_sentinel::features::FeatureEngineer;
use tick_sentinel::ingest::{ChartApiProvider, Ingester};
use tick_sentinel::model::ModelHandle;
use tick_sentinel::pipeline::{CancelFlag, PipelineOrchestrator};
use tick_sentinel::storage::StorageSet;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tick-sentinel")]
#[command(about = "Detect anomalous price/volume behaviour in market ticks")]
struct Args {
    /// TOML config file (defaults to ./tick_sentinel.toml when present)
    #[arg(long, env = "TICK_SENTINEL_CONFIG")]
    config: Option<PathBuf>,

    /// Restrict the run to these instruments (repeatable)
    #[arg(long = "ticker")]
    tickers: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetch ticks from the market data provider
    Ingest,
    /// Recompute feature vectors from stored ticks
    Features,
    /// Train a model on stored feature vectors and persist it
    Train,
    /// Score unscored feature vectors with the persisted model
    Detect,
    /// Ingest, compute features and detect for every instrument
    Pipeline,
    /// Serve the HTTP API
    Serve {
        /// Also run the full pipeline every N seconds
        #[arg(long)]
        schedule_secs: Option<u64>,
    },
    /// Write the effective configuration to a TOML file
    InitConfig {
        #[arg(long, default_value = "tick_sentinel.toml")]
        output: PathBuf,
    },
}

/// Everything one process needs, wired from the config.
struct Runtime {
    config: AppConfig,
    storage: StorageSet,
    ingester: Ingester,
    features: FeatureJob,
    detector: AnomalyDetector,
}

impl Runtime {
    fn build(config: AppConfig) -> Result<Self> {
        let storage = StorageSet::from_config(&config.storage).context("Failed to open storage")?;
        info!("📊 Storage: {}", storage.describe());

        let engineer = FeatureEngineer::new(&config.features);
        let provider = ChartApiProvider::new(
            config.pipeline.provider_url.clone(),
            config.pipeline.provider_timeout(),
        )?;
        let ingester = Ingester::new(Arc::new(provider), storage.ticks.clone(), &config.pipeline);
        let features = FeatureJob::new(
            engineer.clone(),
            storage.ticks.clone(),
            storage.features.clone(),
            config.pipeline.tick_window,
        );
        let detector = AnomalyDetector::new(
            ModelHandle::new(),
            storage.features.clone(),
            storage.anomalies.clone(),
            config.model.clone(),
            engineer.feature_names(),
        )
        .with_limits(config.pipeline.scoring_batch, config.pipeline.training_window);

        // A corrupt or incompatible artifact stops the process here.
        if detector.load_artifact()? {
            info!("🧠 Loaded model from {}", config.model.artifact_path.display());
        } else {
            warn!(
                path = %config.model.artifact_path.display(),
                "No model artifact yet; detection waits for training"
            );
        }

        Ok(Self {
            config,
            storage,
            ingester,
            features,
            detector,
        })
    }

    fn orchestrator(&self) -> PipelineOrchestrator {
        PipelineOrchestrator::new(
            Some(self.ingester.clone()),
            self.features.clone(),
            self.detector.clone(),
            self.config.pipeline.workers,
            self.config.pipeline.provider_delay(),
        )
        .with_auto_train(self.config.model.auto_train)
    }

    fn tickers(&self) -> &[String] {
        &self.config.pipeline.tickers
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let args = Args::parse();
    let mut config = AppConfig::resolve(args.config.as_deref())?;
    if !args.tickers.is_empty() {
        config.pipeline.tickers = args.tickers.clone();
    }

    if let Commands::InitConfig { output } = &args.command {
        config.save(output)?;
        println!("Wrote {}", output.display());
        return Ok(());
    }

    info!("🚀 Tick Sentinel starting ({} instruments)", config.pipeline.tickers.len());
    let runtime = Runtime::build(config)?;

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Ctrl-C received, finishing in-flight work");
                cancel.cancel();
            }
        });
    }

    match args.command {
        Commands::Ingest => {
            let counts = runtime.ingester.ingest_all(runtime.tickers(), &cancel).await;
            print_counts("ticks", &counts);
        }
        Commands::Features => {
            for instrument in runtime.tickers() {
                if cancel.is_cancelled() {
                    break;
                }
                match runtime.features.run(instrument).await {
                    Ok(n) => println!("{instrument:<16} {n:>6} feature vectors"),
                    Err(e) if e.is_zero_count() => println!("{instrument:<16} skipped ({e})"),
                    Err(e) => error!(instrument = %instrument, error = %e, "Feature computation failed"),
                }
            }
        }
        Commands::Train => {
            let model = runtime.detector.retrain(runtime.tickers()).await?;
            println!(
                "Trained {} on {} samples ({} features), saved to {}",
                model.version(),
                model.metadata.n_samples,
                model.feature_names().len(),
                runtime.config.model.artifact_path.display()
            );
        }
        Commands::Detect => {
            // Fail early with a clear message instead of one warning per instrument.
            runtime.detector.model().current()?;
            let counts = runtime.detector.process_all(runtime.tickers(), &cancel).await;
            print_counts("anomaly records", &counts);
        }
        Commands::Pipeline => {
            let report = runtime.orchestrator().run(runtime.tickers(), &cancel).await;
            println!("{report}");
        }
        Commands::Serve { schedule_secs } => {
            let orchestrator = runtime.orchestrator();
            if let Some(secs) = schedule_secs.filter(|s| *s > 0) {
                tokio::spawn(scheduled_pipeline(
                    orchestrator.clone(),
                    runtime.tickers().to_vec(),
                    Duration::from_secs(secs),
                    cancel.clone(),
                ));
            }
            let addr = format!("{}:{}", runtime.config.server.bind, runtime.config.server.port);
            let state = AppState::new(orchestrator, runtime.storage.clone(), runtime.tickers().to_vec());
            api::serve(state, &addr, cancel).await?;
        }
        Commands::InitConfig { .. } => {}
    }

    Ok(())
}

/// Run the pipeline on a fixed interval until cancelled.
async fn scheduled_pipeline(
    orchestrator: PipelineOrchestrator,
    tickers: Vec<String>,
    every: Duration,
    cancel: CancelFlag,
) {
    let mut ticker = tokio::time::interval(every);
    info!("⏰ Scheduled pipeline every {}s", every.as_secs());
    while !cancel.is_cancelled() {
        ticker.tick().await;
        if cancel.is_cancelled() {
            break;
        }
        let report = orchestrator.run(&tickers, &cancel).await;
        info!(
            records = report.total_records(),
            flagged = report.total_flagged(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Scheduled pipeline run complete"
        );
    }
}

fn print_counts(what: &str, counts: &std::collections::BTreeMap<String, usize>) {
    for (instrument, n) in counts {
        println!("{instrument:<16} {n:>6} {what}");
    }
    println!("total: {} {what}", counts.values().sum::<usize>());
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tick_sentinel=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // Standard dotenv search (cwd + parents)
    let _ = dotenv();

    // Also the crate directory, for runs started elsewhere with --manifest-path
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidate = manifest_dir.join(".env");
    if candidate.exists() {
        let _ = dotenv::from_path(&candidate);
    }
}
