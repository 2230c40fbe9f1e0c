//! Epoch loop — embed, mine, optimize, evaluate, checkpoint.
//!
//! Runs synchronously on the calling thread. A shared stop flag is checked
//! between batches; a stopped epoch is neither evaluated nor checkpointed.

use crate::checkpoint::{self, CheckpointError};
use crate::config::{ConfigError, LossAveraging, TrainConfig};
use crate::metrics::{write_roc, Fanout, MetricError, MetricSink, SqliteSink, TracingSink};
use crate::model::{LinearEmbedder, ModelError, TrainableEmbedder};
use facetrain_core::{
    CoreError, DistanceSample, EmbedderError, HardTripletMiner, InverseTimeDecay, LRScheduler,
    PairwiseDistance, ParamGroupSchedules, TripletBatch, TripletMarginLoss, TripletSet,
    VerificationEvaluator, VerificationReport,
};
use facetrain_data::{DataError, LfwPairs, PairInputs, TripletFaceDataset, TripletInputs};
use ndarray::{concatenate, Axis};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

pub const METRICS_DB: &str = "metrics.db";

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("core: {0}")]
    Core(#[from] CoreError),
    #[error("embedder: {0}")]
    Embedder(#[from] EmbedderError),
    #[error("data: {0}")]
    Data(#[from] DataError),
    #[error("checkpoint: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("metrics: {0}")]
    Metric(#[from] MetricError),
    #[error("model: {0}")]
    Model(#[from] ModelError),
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("shape: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// Statistics of one training epoch.
#[derive(Debug, Clone)]
pub struct EpochSummary {
    pub epoch: usize,
    pub batches: usize,
    pub optimized_batches: usize,
    pub hard_triplets: usize,
    pub avg_loss: f64,
    pub train_accuracy: Option<f64>,
    /// True when the stop flag ended the epoch early.
    pub stopped: bool,
    pub elapsed_ms: u64,
    /// Distances of every triplet in the optimized batches.
    pub distances: Vec<DistanceSample>,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub start_epoch: usize,
    pub epochs: Vec<EpochSummary>,
    pub test: Option<VerificationReport>,
    pub stopped: bool,
}

/// Result of one batch; `loss` is `None` when nothing was mined.
struct BatchOutcome {
    loss: Option<f32>,
    hard: usize,
    distances: Vec<DistanceSample>,
}

#[derive(Debug, Clone, Copy)]
enum EvalKind {
    Train,
    Test,
}

impl EvalKind {
    fn tag(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Test => "test",
        }
    }
}

/// Mean batch loss under the given policy. Zero when no batch counts.
pub fn average_loss(policy: LossAveraging, loss_sum: f64, optimized: usize, batches: usize) -> f64 {
    let denominator = match policy {
        LossAveraging::OptimizedOnly => optimized,
        LossAveraging::AllBatches => batches,
    };
    if denominator == 0 {
        0.0
    } else {
        loss_sum / denominator as f64
    }
}

pub struct Trainer<'a, M, S> {
    config: &'a TrainConfig,
    model: M,
    sink: S,
    miner: HardTripletMiner,
    loss: TripletMarginLoss,
    distance: PairwiseDistance,
    schedules: ParamGroupSchedules,
    train_eval: VerificationEvaluator,
    test_eval: VerificationEvaluator,
    run_dir: PathBuf,
    stop: Arc<AtomicBool>,
    start_epoch: usize,
}

impl<'a, M: TrainableEmbedder, S: MetricSink> Trainer<'a, M, S> {
    pub fn new(
        config: &'a TrainConfig,
        model: M,
        sink: S,
        run_dir: &Path,
        stop: Arc<AtomicBool>,
    ) -> Result<Self, TrainError> {
        config.validate()?;
        let decay = InverseTimeDecay::new(config.lr, config.lr_decay)?;
        let schedules = ParamGroupSchedules::new(decay, model.param_groups());
        let grid = config.threshold_grid();
        Ok(Self {
            config,
            miner: HardTripletMiner::new(config.margin)?,
            loss: TripletMarginLoss::new(config.margin)?,
            distance: PairwiseDistance::euclidean(),
            schedules,
            train_eval: VerificationEvaluator::new(config.train_folds, config.far_target, grid)?,
            test_eval: VerificationEvaluator::new(config.test_folds, config.far_target, grid)?,
            run_dir: run_dir.to_path_buf(),
            stop,
            start_epoch: config.start_epoch,
            model,
            sink,
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn schedules(&self) -> &ParamGroupSchedules {
        &self.schedules
    }

    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    /// Apply `--resume`. Returns the epoch the run will start at.
    pub fn resume(&mut self) -> Result<usize, TrainError> {
        let Some(path) = &self.config.resume else {
            return Ok(self.start_epoch);
        };
        if let Some(loaded) = checkpoint::resume(path)? {
            self.model.load_weights(&loaded.weights)?;
            self.start_epoch = loaded.record.epoch;
        }
        Ok(self.start_epoch)
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    fn train_batch(&mut self, batch: TripletInputs) -> Result<BatchOutcome, TrainError> {
        let TripletInputs {
            inputs,
            positive_labels,
            negative_labels,
        } = batch;
        let embeddings = TripletSet::new(
            self.model.embed(inputs.anchor().view())?,
            self.model.embed(inputs.positive().view())?,
            self.model.embed(inputs.negative().view())?,
        )?;
        let batch = TripletBatch::new(inputs, embeddings, positive_labels, negative_labels)?;

        let outcome = self.miner.mine(&batch)?;
        let Some(hard) = outcome.hard_batch(&batch) else {
            return Ok(BatchOutcome {
                loss: None,
                hard: 0,
                distances: Vec::new(),
            });
        };

        let loss = self.loss.forward_set(hard.embeddings())?;
        let grads = self.loss.backward(hard.embeddings())?;
        let x = hard.inputs();
        let inputs = concatenate(Axis(0), &[x.anchor().view(), x.positive().view(), x.negative().view()])?;
        let embedding_grads = concatenate(
            Axis(0),
            &[grads.anchor.view(), grads.positive.view(), grads.negative.view()],
        )?;

        let learning_rates = self.schedules.learning_rates();
        self.model
            .apply_gradients(inputs.view(), embedding_grads.view(), &learning_rates)?;
        self.schedules.step_all();
        self.sink.record("triplet_loss", loss as f64)?;

        Ok(BatchOutcome {
            loss: Some(loss),
            hard: outcome.hard_count(),
            distances: outcome.distance_samples(),
        })
    }

    /// One pass over `batches`.
    pub fn train_epoch<I>(&mut self, epoch: usize, batches: I) -> Result<EpochSummary, TrainError>
    where
        I: IntoIterator<Item = Result<TripletInputs, DataError>>,
    {
        let started = Instant::now();
        let batches = batches.into_iter();
        let total = batches.size_hint().1;

        let mut summary = EpochSummary {
            epoch,
            batches: 0,
            optimized_batches: 0,
            hard_triplets: 0,
            avg_loss: 0.0,
            train_accuracy: None,
            stopped: false,
            elapsed_ms: 0,
            distances: Vec::new(),
        };
        let mut loss_sum = 0.0f64;

        for batch in batches {
            if self.stop_requested() {
                tracing::warn!(epoch, batch = summary.batches, "stop requested, ending epoch early");
                summary.stopped = true;
                break;
            }
            let outcome = self.train_batch(batch?)?;
            summary.batches += 1;
            summary.hard_triplets += outcome.hard;
            match outcome.loss {
                Some(loss) => {
                    loss_sum += loss as f64;
                    summary.optimized_batches += 1;
                    summary.distances.extend(outcome.distances);
                }
                None => tracing::trace!(epoch, batch = summary.batches, "no hard triplets, batch skipped"),
            }

            if summary.batches % self.config.log_interval == 0 {
                tracing::info!(
                    epoch,
                    batch = summary.batches,
                    total = ?total,
                    avg_loss = average_loss(
                        self.config.loss_averaging,
                        loss_sum,
                        summary.optimized_batches,
                        summary.batches
                    ),
                    hard_triplets = summary.hard_triplets,
                    lr = self.schedules.group(0).map(LRScheduler::get_lr),
                    "training progress"
                );
            }
        }

        summary.avg_loss = average_loss(
            self.config.loss_averaging,
            loss_sum,
            summary.optimized_batches,
            summary.batches,
        );
        summary.elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            epoch,
            batches = summary.batches,
            optimized = summary.optimized_batches,
            hard_triplets = summary.hard_triplets,
            avg_loss = summary.avg_loss,
            elapsed_ms = summary.elapsed_ms,
            "epoch finished"
        );
        Ok(summary)
    }

    fn evaluate(
        &self,
        kind: EvalKind,
        epoch: usize,
        samples: &[DistanceSample],
    ) -> Result<Option<VerificationReport>, TrainError> {
        let evaluator = match kind {
            EvalKind::Train => &self.train_eval,
            EvalKind::Test => &self.test_eval,
        };
        if samples.len() < evaluator.folds() {
            tracing::warn!(
                epoch,
                set = kind.tag(),
                samples = samples.len(),
                folds = evaluator.folds(),
                "too few distance samples for cross-validation, skipping evaluation"
            );
            return Ok(None);
        }
        let report = evaluator.evaluate(samples)?;
        let roc_path = self.run_dir.join(format!("roc_{}_epoch_{epoch}.json", kind.tag()));
        write_roc(&roc_path, &report.roc)?;
        Ok(Some(report))
    }

    /// Evaluate an epoch's training distances and checkpoint the model.
    pub fn finish_epoch(&mut self, mut summary: EpochSummary) -> Result<EpochSummary, TrainError> {
        let epoch = summary.epoch;
        self.sink.record("avg_triplet_loss", summary.avg_loss)?;
        if let Some(report) = self.evaluate(EvalKind::Train, epoch, &summary.distances)? {
            self.sink.record("train_accuracy", report.mean_accuracy)?;
            tracing::info!(epoch, accuracy = report.mean_accuracy, "train set verification");
            summary.train_accuracy = Some(report.mean_accuracy);
        }
        checkpoint::save(&self.run_dir, epoch, epoch + 1, &self.model.to_weights())?;
        Ok(summary)
    }

    /// Embed every pair and run the held-out verification protocol.
    pub fn test_epoch<I>(&mut self, epoch: usize, pairs: I) -> Result<Option<VerificationReport>, TrainError>
    where
        I: IntoIterator<Item = Result<PairInputs, DataError>>,
    {
        let mut samples = Vec::new();
        for batch in pairs {
            let batch = batch?;
            let left = self.model.embed(batch.left.view())?;
            let right = self.model.embed(batch.right.view())?;
            let distances = self.distance.forward(left.view(), right.view())?;
            samples.extend(
                distances
                    .iter()
                    .zip(&batch.same)
                    .map(|(&d, &same)| DistanceSample::new(d, same)),
            );
        }

        let report = self.evaluate(EvalKind::Test, epoch, &samples)?;
        if let Some(report) = &report {
            self.sink.record("test_accuracy", report.mean_accuracy)?;
            self.sink.record("test_val", report.val)?;
            tracing::info!(
                epoch,
                pairs = samples.len(),
                accuracy = report.mean_accuracy,
                val = report.val,
                val_std = report.val_std,
                far = report.far,
                far_target = self.test_eval.far_target(),
                "test set verification"
            );
        }
        Ok(report)
    }

    /// Train `epochs` epochs from the start epoch, then test once.
    pub fn run(&mut self, train: &TripletFaceDataset, test: &LfwPairs) -> Result<RunSummary, TrainError> {
        let start = self.start_epoch;
        let end = start + self.config.epochs;
        tracing::info!(
            start,
            end,
            triplets = train.len(),
            test_pairs = test.len(),
            margin = self.loss.margin(),
            grid = ?self.train_eval.grid(),
            run_dir = %self.run_dir.display(),
            "training started"
        );

        let mut epochs = Vec::with_capacity(self.config.epochs);
        let mut stopped = false;
        for epoch in start..end {
            let summary = self.train_epoch(epoch, train.batches(self.config.batch_size)?)?;
            if summary.stopped {
                stopped = true;
                epochs.push(summary);
                break;
            }
            epochs.push(self.finish_epoch(summary)?);
        }

        let test_report = match epochs.last() {
            Some(last) if !stopped => {
                let epoch = last.epoch;
                self.test_epoch(epoch, test.batches(self.config.test_batch_size)?)?
            }
            _ => None,
        };

        Ok(RunSummary {
            start_epoch: start,
            epochs,
            test: test_report,
            stopped,
        })
    }
}

/// Build the datasets, model and sinks described by `config` and run them.
pub fn run_training(config: &TrainConfig, run_dir: &Path, stop: Arc<AtomicBool>) -> Result<RunSummary, TrainError> {
    let train = TripletFaceDataset::from_root(&config.dataroot, config.n_triplets, config.seed, config.image_size)?;
    let test = LfwPairs::load(&config.lfw_dir, &config.lfw_pairs_path, &config.lfw_ext, config.image_size)?;
    let model = LinearEmbedder::new(
        config.input_dim(),
        config.embedding_size,
        config.seed,
        config.optimizer.into(),
        config.wd as f32,
    )?;
    let sink = Fanout::new()
        .with(SqliteSink::open(&run_dir.join(METRICS_DB))?)
        .with(TracingSink::default());

    let mut trainer = Trainer::new(config, model, sink, run_dir, stop)?;
    trainer.resume()?;
    trainer.run(&train, &test)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MemorySink;
    use clap::Parser;
    use facetrain_core::Embedder;
    use ndarray::{array, Array2, ArrayView2};

    /// Embeds every input as itself; counts updates instead of learning.
    struct IdentityEmbedder {
        dim: usize,
        updates: usize,
        weights: Vec<u8>,
    }

    impl IdentityEmbedder {
        fn new(dim: usize) -> Self {
            Self {
                dim,
                updates: 0,
                weights: vec![1, 2, 3],
            }
        }
    }

    impl Embedder for IdentityEmbedder {
        fn embedding_dim(&self) -> usize {
            self.dim
        }

        fn embed(&mut self, inputs: ArrayView2<f32>) -> Result<Array2<f32>, EmbedderError> {
            Ok(inputs.to_owned())
        }
    }

    impl TrainableEmbedder for IdentityEmbedder {
        fn param_groups(&self) -> usize {
            2
        }

        fn apply_gradients(
            &mut self,
            inputs: ArrayView2<f32>,
            embedding_grads: ArrayView2<f32>,
            learning_rates: &[f64],
        ) -> Result<(), ModelError> {
            assert_eq!(inputs.nrows(), embedding_grads.nrows());
            assert_eq!(learning_rates.len(), 2);
            self.updates += 1;
            Ok(())
        }

        fn to_weights(&self) -> Vec<u8> {
            self.weights.clone()
        }

        fn load_weights(&mut self, blob: &[u8]) -> Result<(), ModelError> {
            self.weights = blob.to_vec();
            Ok(())
        }
    }

    fn config(log_dir: &Path, extra: &[&str]) -> TrainConfig {
        let log_dir = log_dir.to_string_lossy().into_owned();
        let mut args = vec![
            "facetrain-train".to_string(),
            "--dataroot".into(),
            "/data/train".into(),
            "--lfw-dir".into(),
            "/data/lfw".into(),
            "--lfw-pairs-path".into(),
            "/data/pairs.txt".into(),
            "--log-dir".into(),
            log_dir,
            "--log-interval".into(),
            "1".into(),
        ];
        args.extend(extra.iter().map(|s| s.to_string()));
        TrainConfig::parse_from(args)
    }

    /// One triplet per row with the given `(d(a, p), d(a, n))` along a line.
    fn inputs(pairs: &[(f32, f32)]) -> TripletInputs {
        let n = pairs.len();
        let anchor = Array2::<f32>::zeros((n, 2));
        let positive = Array2::from_shape_fn((n, 2), |(i, j)| if j == 0 { pairs[i].0 } else { 0.0 });
        let negative = Array2::from_shape_fn((n, 2), |(i, j)| if j == 0 { -pairs[i].1 } else { 0.0 });
        TripletInputs {
            inputs: TripletSet::new(anchor, positive, negative).unwrap(),
            positive_labels: vec![0; n],
            negative_labels: vec![1; n],
        }
    }

    fn trainer<'a>(cfg: &'a TrainConfig, dir: &Path) -> Trainer<'a, IdentityEmbedder, MemorySink> {
        Trainer::new(
            cfg,
            IdentityEmbedder::new(2),
            MemorySink::default(),
            dir,
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap()
    }

    #[test]
    fn test_average_loss_policies() {
        assert_eq!(average_loss(LossAveraging::OptimizedOnly, 0.8, 2, 4), 0.4);
        assert_eq!(average_loss(LossAveraging::AllBatches, 0.8, 2, 4), 0.2);
        assert_eq!(average_loss(LossAveraging::OptimizedOnly, 0.0, 0, 4), 0.0);
        assert_eq!(average_loss(LossAveraging::AllBatches, 0.0, 0, 0), 0.0);
    }

    #[test]
    fn test_easy_batch_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), &[]);
        let mut t = trainer(&cfg, dir.path());

        let batches = vec![Ok(inputs(&[(0.2, 0.3)])), Ok(inputs(&[(0.1, 5.0), (0.2, 4.0)]))];
        let summary = t.train_epoch(0, batches).unwrap();

        assert_eq!(summary.batches, 2);
        assert_eq!(summary.optimized_batches, 1);
        assert_eq!(summary.hard_triplets, 1);
        assert!((summary.avg_loss - 0.4).abs() < 1e-6);
        assert_eq!(t.model().updates, 1);
        assert_eq!(t.schedules().group(0).unwrap().state().step_count(), 1);
        assert_eq!(t.sink().values("triplet_loss").len(), 1);
        // only the optimized batch contributes distances: one same, one different
        assert_eq!(summary.distances.len(), 2);
        assert!(summary.distances[0].same);
        assert!(!summary.distances[1].same);
    }

    #[test]
    fn test_all_batches_averaging() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), &["--loss-averaging", "all-batches"]);
        let mut t = trainer(&cfg, dir.path());
        let batches = vec![Ok(inputs(&[(0.2, 0.3)])), Ok(inputs(&[(0.1, 5.0)]))];
        let summary = t.train_epoch(0, batches).unwrap();
        assert!((summary.avg_loss - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_no_hard_triplets_leaves_schedules_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), &[]);
        let mut t = trainer(&cfg, dir.path());
        let summary = t.train_epoch(0, vec![Ok(inputs(&[(0.0, 3.0)]))]).unwrap();
        assert_eq!(summary.optimized_batches, 0);
        assert_eq!(summary.avg_loss, 0.0);
        assert_eq!(t.schedules().learning_rates(), vec![0.1, 0.1]);
        assert!(t.sink().values("triplet_loss").is_empty());
    }

    #[test]
    fn test_stop_flag_ends_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), &[]);
        let stop = Arc::new(AtomicBool::new(true));
        let mut t = Trainer::new(&cfg, IdentityEmbedder::new(2), MemorySink::default(), dir.path(), stop).unwrap();
        let summary = t.train_epoch(0, vec![Ok(inputs(&[(0.2, 0.3)]))]).unwrap();
        assert!(summary.stopped);
        assert_eq!(summary.batches, 0);
        assert_eq!(t.model().updates, 0);
    }

    #[test]
    fn test_data_error_aborts_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), &[]);
        let mut t = trainer(&cfg, dir.path());
        let err = t.train_epoch(0, vec![Err(DataError::ZeroBatchSize)]).unwrap_err();
        assert!(matches!(err, TrainError::Data(_)));
    }

    #[test]
    fn test_resume_missing_checkpoint_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("checkpoint_4.json").to_string_lossy().into_owned();
        let cfg = config(dir.path(), &["--resume", missing.as_str()]);
        let mut t = trainer(&cfg, dir.path());
        assert_eq!(t.resume().unwrap(), 0);
        assert_eq!(t.model().weights, vec![1, 2, 3]);
    }

    #[test]
    fn test_resume_restores_epoch_and_weights() {
        let dir = tempfile::tempdir().unwrap();
        let path = checkpoint::save(dir.path(), 2, 3, &[7, 7, 7, 7]).unwrap();
        let path = path.to_string_lossy().into_owned();
        let cfg = config(dir.path(), &["--resume", path.as_str()]);
        let mut t = trainer(&cfg, dir.path());
        assert_eq!(t.resume().unwrap(), 3);
        assert_eq!(t.start_epoch(), 3);
        assert_eq!(t.model().weights, vec![7, 7, 7, 7]);
    }

    #[test]
    fn test_finish_epoch_checkpoints_and_skips_small_evaluation() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), &[]);
        let mut t = trainer(&cfg, dir.path());
        let summary = t.train_epoch(5, vec![Ok(inputs(&[(0.2, 0.3)]))]).unwrap();
        let summary = t.finish_epoch(summary).unwrap();

        // two samples cannot fill ten folds
        assert!(summary.train_accuracy.is_none());
        assert!(!dir.path().join("roc_train_epoch_5.json").exists());

        let loaded = checkpoint::load(&dir.path().join("checkpoint_5.json")).unwrap();
        assert_eq!(loaded.record.epoch, 6);
        assert_eq!(loaded.weights, vec![1, 2, 3]);
    }

    #[test]
    fn test_finish_epoch_evaluates_train_distances() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), &["--train-folds", "2"]);
        let mut t = trainer(&cfg, dir.path());
        let batch = inputs(&[(0.2, 0.3), (0.1, 0.4), (0.3, 0.5), (0.25, 0.35)]);
        let summary = t.train_epoch(0, vec![Ok(batch)]).unwrap();
        assert_eq!(summary.distances.len(), 8);

        let summary = t.finish_epoch(summary).unwrap();
        assert!(summary.train_accuracy.is_some());
        assert!(dir.path().join("roc_train_epoch_0.json").is_file());
        assert_eq!(t.sink().values("train_accuracy").len(), 1);
        assert_eq!(t.sink().values("avg_triplet_loss").len(), 1);
    }

    #[test]
    fn test_train_roc_size_follows_grid_not_samples() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), &[]);
        let mut t = trainer(&cfg, dir.path());
        let summary = EpochSummary {
            epoch: 0,
            batches: 1,
            optimized_batches: 1,
            hard_triplets: 50_000,
            avg_loss: 0.1,
            train_accuracy: None,
            stopped: false,
            elapsed_ms: 0,
            distances: (0..100_000u32)
                .map(|i| DistanceSample::new((i % 3_000) as f32 * 1e-3, i % 2 == 0))
                .collect(),
        };
        t.finish_epoch(summary).unwrap();

        let text = std::fs::read_to_string(dir.path().join("roc_train_epoch_0.json")).unwrap();
        let roc: Vec<facetrain_core::evaluator::RocPoint> = serde_json::from_str(&text).unwrap();
        // about 400 thresholds in 0..4 per fold, whatever the sample count
        assert!(roc.len() <= 10 * 401, "{} points", roc.len());
        assert!(roc.len() >= 10 * 399, "{} points", roc.len());
    }

    #[test]
    fn test_unique_thresholds_follow_training_distances() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), &["--unique-thresholds", "--train-folds", "2"]);
        let mut t = trainer(&cfg, dir.path());
        let batch = inputs(&[(0.2, 0.3), (0.1, 0.4), (0.3, 0.5), (0.25, 0.35)]);
        let summary = t.train_epoch(0, vec![Ok(batch)]).unwrap();
        t.finish_epoch(summary).unwrap();

        let text = std::fs::read_to_string(dir.path().join("roc_train_epoch_0.json")).unwrap();
        let roc: Vec<facetrain_core::evaluator::RocPoint> = serde_json::from_str(&text).unwrap();
        // two folds of four, each calibrated on the other four distances
        assert_eq!(roc.len(), 8);
    }

    #[test]
    fn test_test_epoch_separable_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), &[]);
        let mut t = trainer(&cfg, dir.path());

        // same pairs are 0.1 apart, different pairs 1.0, alternating
        let left = Array2::<f32>::zeros((6, 2));
        let right = Array2::from_shape_fn((6, 2), |(i, j)| match (i % 2, j) {
            (0, 0) => 0.1,
            (1, 0) => 1.0,
            _ => 0.0,
        });
        let same = vec![true, false, true, false, true, false];
        let pairs = vec![
            Ok(PairInputs {
                left: left.slice(ndarray::s![..4, ..]).to_owned(),
                right: right.slice(ndarray::s![..4, ..]).to_owned(),
                same: same[..4].to_vec(),
            }),
            Ok(PairInputs {
                left: left.slice(ndarray::s![4.., ..]).to_owned(),
                right: right.slice(ndarray::s![4.., ..]).to_owned(),
                same: same[4..].to_vec(),
            }),
        ];

        let report = t.test_epoch(9, pairs).unwrap().unwrap();
        assert_eq!(report.accuracy, vec![1.0, 1.0, 1.0]);
        assert_eq!(t.sink().values("test_accuracy"), vec![1.0]);
        assert_eq!(t.sink().values("test_val").len(), 1);
        assert!(dir.path().join("roc_test_epoch_9.json").is_file());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), &["--test-folds", "1"]);
        let result = Trainer::new(
            &cfg,
            IdentityEmbedder::new(2),
            MemorySink::default(),
            dir.path(),
            Arc::new(AtomicBool::new(false)),
        );
        assert!(matches!(result, Err(TrainError::Config(_))));
    }

    #[test]
    fn test_full_run_over_image_folders() {
        use image::{GrayImage, Luma};

        let dir = tempfile::tempdir().unwrap();
        let train_root = dir.path().join("train");
        for (name, level) in [("ann", 20u8), ("bob", 120), ("cat", 220)] {
            let class_dir = train_root.join(name);
            std::fs::create_dir_all(&class_dir).unwrap();
            for i in 0..3u8 {
                GrayImage::from_fn(4, 4, |x, y| Luma([level.wrapping_add(i * 5 + (x + y) as u8)]))
                    .save(class_dir.join(format!("{i}.png")))
                    .unwrap();
            }
        }
        let lfw_root = dir.path().join("lfw");
        for name in ["ann", "bob"] {
            let person = lfw_root.join(name);
            std::fs::create_dir_all(&person).unwrap();
            for i in 1..=2u32 {
                GrayImage::from_pixel(4, 4, Luma([if name == "ann" { 30 } else { 200 }]))
                    .save(person.join(format!("{name}_{i:04}.png")))
                    .unwrap();
            }
        }
        let pairs_path = dir.path().join("pairs.txt");
        std::fs::write(&pairs_path, "1\t6\nann\t1\t2\nann\t1\tbob\t1\nbob\t1\t2\nann\t2\tbob\t2\nann\t2\t1\nbob\t2\tann\t1\n").unwrap();

        let log_dir = dir.path().join("runs");
        let [train_arg, lfw_arg, pairs_arg, log_arg] =
            [&train_root, &lfw_root, &pairs_path, &log_dir].map(|p| p.to_string_lossy().into_owned());
        let args: Vec<String> = [
            "facetrain-train",
            "--dataroot",
            train_arg.as_str(),
            "--lfw-dir",
            lfw_arg.as_str(),
            "--lfw-pairs-path",
            pairs_arg.as_str(),
            "--lfw-ext",
            "png",
            "--log-dir",
            log_arg.as_str(),
            "--image-size",
            "4",
            "--embedding-size",
            "3",
            "--n-triplets",
            "32",
            "--batch-size",
            "8",
            "--epochs",
            "2",
            "--margin",
            "100",
            "--train-folds",
            "2",
            "--optimizer",
            "sgd",
            "--lr",
            "0.01",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let cfg = TrainConfig::parse_from(args);
        let run_dir = cfg.run_dir();
        std::fs::create_dir_all(&run_dir).unwrap();

        let summary = run_training(&cfg, &run_dir, Arc::new(AtomicBool::new(false))).unwrap();
        assert!(!summary.stopped);
        assert_eq!(summary.epochs.len(), 2);
        assert!(summary.epochs.iter().all(|e| e.batches == 4));
        assert!(summary.test.is_some());

        for file in [
            "checkpoint_0.json",
            "checkpoint_1.json",
            "checkpoint_1.weights",
            "roc_train_epoch_1.json",
            "roc_test_epoch_1.json",
            METRICS_DB,
        ] {
            assert!(run_dir.join(file).is_file(), "missing {file}");
        }
        assert_eq!(checkpoint::load(&run_dir.join("checkpoint_1.json")).unwrap().record.epoch, 2);

        let sink = SqliteSink::open(&run_dir.join(METRICS_DB)).unwrap();
        assert_eq!(sink.series("train_accuracy").unwrap().len(), 2);
        assert_eq!(sink.series("test_accuracy").unwrap().len(), 1);
        assert_eq!(sink.series("triplet_loss").unwrap().len(), 8);
    }

    #[test]
    fn test_identity_embedder_matches_line_layout() {
        let mut m = IdentityEmbedder::new(2);
        let batch = inputs(&[(0.5, 2.0)]);
        let a = m.embed(batch.inputs.anchor().view()).unwrap();
        let p = m.embed(batch.inputs.positive().view()).unwrap();
        assert_eq!(a, array![[0.0, 0.0]]);
        assert_eq!(p, array![[0.5, 0.0]]);
    }
}
