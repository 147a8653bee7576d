//! Ticks → features → model → anomaly records, through real stores.

mod common;

use chrono::Duration;
use common::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tick_sentinel::config::ModelSettings;
use tick_sentinel::error::PipelineError;
use tick_sentinel::features::FeatureEngineer;
use tick_sentinel::model::AnomalyModel;
use tick_sentinel::models::{AnomalyRecord, FeatureVector, Tick};

/// Daily random walk: price moves up to 1% and volume up to 20% around the base.
fn random_walk_ticks(n: usize, seed: u64) -> Vec<Tick> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut price = 100.0;
    (0..n)
        .map(|i| {
            price *= 1.0 + rng.gen_range(-0.01..0.01);
            let volume = (BASE_VOLUME as f64 * (1.0 + rng.gen_range(-0.2..0.2))).round() as i64;
            Tick::new("RW", t0() + Duration::days(i as i64), price, volume)
        })
        .collect()
}

#[test]
fn test_volume_spike_scores_high_with_volume_explanation() {
    let ticks = spike_ticks("X");
    let spike_ts = ticks[SPIKE_INDEX].timestamp;
    let engineer = FeatureEngineer::default();
    let vectors: Vec<FeatureVector> = engineer.compute("X", &ticks).iter().collect();
    assert_eq!(vectors.len(), engineer.expected_len(ticks.len()));

    // Features of ticks 1-14 train the model; tick 15 is the spike.
    let training: Vec<FeatureVector> = vectors
        .iter()
        .filter(|v| v.timestamp < spike_ts)
        .cloned()
        .collect();
    assert_eq!(training.len(), 10);
    let settings = ModelSettings::default();
    let model = AnomalyModel::train(&training, &engineer.feature_names(), &settings).unwrap();

    let target = vectors
        .iter()
        .find(|v| v.timestamp == spike_ts)
        .cloned()
        .unwrap();
    let scored = model.score(&target);
    assert!(scored.is_complete());
    assert!(scored.score > 0.8, "spike scored {}", scored.score);

    let calm_score = model.score(&training[5]).score;
    assert!(calm_score < scored.score);

    let record = AnomalyRecord::new(
        target,
        scored.score,
        settings.threshold,
        model.version(),
        scored.contributions,
    );
    assert!(record.is_flagged);
    assert!(!record.contributions.is_empty());
    let (top, _) = record.top_contributions(1)[0];
    assert!(top.starts_with("volume_"), "top contribution was {top}");
}

#[test]
fn test_ordinary_points_flag_near_contamination_rate() {
    let engineer = FeatureEngineer::default();
    let vectors: Vec<FeatureVector> = engineer
        .compute("RW", &random_walk_ticks(1_000, 11))
        .iter()
        .collect();
    let (training, fresh) = vectors.split_at(500);

    let settings = ModelSettings::default();
    let model = AnomalyModel::train(training, &engineer.feature_names(), &settings).unwrap();
    let flagged = |set: &[FeatureVector]| {
        set.iter()
            .filter(|v| model.score(v).score > settings.threshold)
            .count()
    };

    // Only the top `contamination_rate` share of training sits above the cutoff.
    let allowed = (training.len() as f64 * settings.contamination_rate).ceil() as usize;
    assert!(flagged(training) <= allowed, "training flagged {}", flagged(training));

    let rate = flagged(fresh) as f64 / fresh.len() as f64;
    assert!(rate <= 0.03, "held-out flag rate {rate}");

    let cutoff = model.metadata.contamination_cutoff;
    assert!(cutoff > 0.0 && cutoff < 1.0);
}

#[tokio::test]
async fn test_process_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let storage = local_storage(dir.path());
    let settings = model_settings(dir.path());
    let features = feature_job(&storage);
    let detector = detector(&storage, settings.clone());

    assert_eq!(storage.ticks.write_batch(&spike_ticks("X")).await.unwrap(), 20);
    assert_eq!(features.run("X").await.unwrap(), 16);

    // Nothing to score with yet.
    assert!(matches!(
        detector.process("X").await,
        Err(PipelineError::ModelNotLoaded)
    ));

    let model = detector.retrain(&["X".to_string()]).await.unwrap();
    assert_eq!(model.metadata.n_samples, 16);
    assert!(settings.artifact_path.exists());

    assert_eq!(detector.process("X").await.unwrap(), 16);
    assert_eq!(detector.process("X").await.unwrap(), 0);

    let records = storage.anomalies.read_recent("X", 100).await.unwrap();
    assert_eq!(records.len(), 16);
    for r in &records {
        assert_eq!(r.is_flagged, r.score > detector.threshold());
        assert!((0.0..=1.0).contains(&r.score));
        assert_eq!(r.model_version, settings.version);
    }

    // Recomputing features rewrites the same keys; still nothing new to score.
    assert_eq!(features.run("X").await.unwrap(), 16);
    assert_eq!(detector.process("X").await.unwrap(), 0);
    assert_eq!(storage.anomalies.read_recent("X", 100).await.unwrap().len(), 16);
}

#[tokio::test]
async fn test_raising_threshold_never_flags_more() {
    let dir = tempfile::tempdir().unwrap();
    let storage = local_storage(dir.path());
    let features = feature_job(&storage);
    let detector = detector(&storage, model_settings(dir.path()));

    storage.ticks.write_batch(&spike_ticks("X")).await.unwrap();
    features.run("X").await.unwrap();
    let model = detector.retrain(&["X".to_string()]).await.unwrap();
    let vectors = storage.features.read_recent("X", 100).await.unwrap();

    let mut previous = usize::MAX;
    for threshold in [0.0, 0.25, 0.5, 0.8, 0.95, 1.0] {
        let d = detector.clone().with_threshold(threshold);
        let flagged = vectors
            .iter()
            .map(|v| d.score_with(&model, v.clone()))
            .filter(|r| {
                assert_eq!(r.is_flagged, r.score > threshold);
                r.is_flagged
            })
            .count();
        assert!(flagged <= previous, "threshold {threshold} flagged {flagged} > {previous}");
        previous = flagged;
    }
    // Scores never exceed 1.0.
    assert_eq!(previous, 0);
}

#[tokio::test]
async fn test_instrument_without_ticks_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let storage = local_storage(dir.path());
    let features = feature_job(&storage);
    let detector = detector(&storage, model_settings(dir.path()));

    storage.ticks.write_batch(&spike_ticks("X")).await.unwrap();
    features.run("X").await.unwrap();
    detector.retrain(&["X".to_string()]).await.unwrap();

    match features.run("EMPTY").await {
        Err(PipelineError::InsufficientHistory { available, required, .. }) => {
            assert_eq!(available, 0);
            assert_eq!(required, 5);
        }
        other => panic!("expected InsufficientHistory, got {other:?}"),
    }
    assert_eq!(detector.process("EMPTY").await.unwrap(), 0);
    assert!(storage.features.read_recent("EMPTY", 10).await.unwrap().is_empty());
    assert!(storage.anomalies.read_recent("EMPTY", 10).await.unwrap().is_empty());
    assert_eq!(storage.anomalies.instruments().await.unwrap(), Vec::<String>::new());
}

#[tokio::test]
async fn test_short_history_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let storage = local_storage(dir.path());
    let features = feature_job(&storage);

    storage.ticks.write_batch(&calm_ticks("Y", 4)).await.unwrap();
    assert!(matches!(
        features.run("Y").await,
        Err(PipelineError::InsufficientHistory { available: 4, .. })
    ));

    storage.ticks.write_batch(&calm_ticks("Y", 5)).await.unwrap();
    assert_eq!(features.run("Y").await.unwrap(), 1);
}

#[tokio::test]
async fn test_artifact_reload_scores_like_the_trained_model() {
    let dir = tempfile::tempdir().unwrap();
    let storage = local_storage(dir.path());
    let settings = model_settings(dir.path());
    let features = feature_job(&storage);
    let trainer = detector(&storage, settings.clone());

    storage.ticks.write_batch(&spike_ticks("X")).await.unwrap();
    features.run("X").await.unwrap();
    let trained = trainer.retrain(&["X".to_string()]).await.unwrap();

    let restarted = detector(&storage, settings);
    assert!(!restarted.model().is_loaded());
    assert!(restarted.load_artifact().unwrap());
    let reloaded = restarted.model().current().unwrap();
    assert_eq!(reloaded.feature_names(), trained.feature_names());

    for v in storage.features.read_recent("X", 100).await.unwrap() {
        let a = trained.score(&v).score;
        let b = reloaded.score(&v).score;
        assert!((a - b).abs() < 1e-9, "{a} != {b}");
    }
}

#[tokio::test]
async fn test_failed_training_keeps_previous_model() {
    let dir = tempfile::tempdir().unwrap();
    let storage = local_storage(dir.path());
    let features = feature_job(&storage);
    let detector = detector(&storage, model_settings(dir.path()));

    storage.ticks.write_batch(&spike_ticks("X")).await.unwrap();
    features.run("X").await.unwrap();
    let first = detector.retrain(&["X".to_string()]).await.unwrap();

    // Not enough vectors for a new model.
    let err = detector.retrain(&["NOPE".to_string()]).await.unwrap_err();
    assert!(matches!(err, PipelineError::InsufficientData { available: 0, .. }));
    let active = detector.model().current().unwrap();
    assert_eq!(active.metadata.trained_at, first.metadata.trained_at);
}
