use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use facetrain_core::evaluator::{DEFAULT_FAR_TARGET, DEFAULT_FOLDS};
use facetrain_core::{
    DistanceSample, Embedder, InverseTimeDecay, OnnxEmbedder, PairwiseDistance, ThresholdGrid,
    VerificationEvaluator, VerificationReport,
};
use facetrain_data::lfw::DEFAULT_EXTENSION;
use facetrain_data::LfwPairs;
use facetrain_trainer::checkpoint::{self, CheckpointInspection};
use facetrain_trainer::metrics::write_roc;
use facetrain_trainer::{LinearEmbedder, Optimizer, UpdateRule};
use serde_json::json;
use std::io::Read;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "facetrain", about = "Face verification and checkpoint tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Cross-validate precomputed pair distances
    Evaluate {
        /// JSON array of {"distance", "same"} samples, or `-` for stdin
        input: PathBuf,
        #[command(flatten)]
        protocol: ProtocolArgs,
    },
    /// Embed an LFW pairs protocol and report verification results
    Lfw {
        #[command(flatten)]
        source: ModelSource,
        /// Directory holding one sub-directory per person
        #[arg(long)]
        lfw_dir: PathBuf,
        /// LFW pairs.txt
        #[arg(long)]
        pairs: PathBuf,
        #[arg(long, default_value = DEFAULT_EXTENSION)]
        ext: String,
        /// Side of the square face crop in pixels
        #[arg(long, default_value_t = 96)]
        image_size: u32,
        /// Output width of the ONNX model
        #[arg(long, default_value_t = 256)]
        embedding_size: usize,
        #[arg(long, default_value_t = 64)]
        batch_size: usize,
        #[command(flatten)]
        protocol: ProtocolArgs,
    },
    /// Print the inverse-time decayed learning rate per step
    Schedule {
        #[arg(long, default_value_t = 0.1)]
        lr: f64,
        #[arg(long, default_value_t = 1e-4)]
        lr_decay: f64,
        /// Last step to print
        #[arg(long, default_value_t = 10_000)]
        steps: u64,
        /// Print every n-th step
        #[arg(long, default_value_t = 1_000)]
        every: u64,
    },
    /// Verify a checkpoint record against its weight blob
    Checkpoint {
        /// checkpoint_{e}.json
        path: PathBuf,
    },
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct ModelSource {
    /// Exported ONNX embedding model
    #[arg(long)]
    model: Option<PathBuf>,
    /// checkpoint_{e}.json of a linear embedder trained by facetrain-train
    #[arg(long)]
    checkpoint: Option<PathBuf>,
}

#[derive(Args)]
struct ProtocolArgs {
    #[arg(long, default_value_t = DEFAULT_FOLDS)]
    folds: usize,
    #[arg(long, default_value_t = DEFAULT_FAR_TARGET)]
    far_target: f64,
    /// First threshold of a fixed grid (with --grid-stop and --grid-step)
    #[arg(long)]
    grid_start: Option<f32>,
    #[arg(long)]
    grid_stop: Option<f32>,
    #[arg(long)]
    grid_step: Option<f32>,
    /// Also write every ROC point to this JSON file
    #[arg(long)]
    roc: Option<PathBuf>,
}

impl ProtocolArgs {
    fn grid(&self) -> Result<ThresholdGrid> {
        match (self.grid_start, self.grid_stop, self.grid_step) {
            (None, None, None) => Ok(ThresholdGrid::UniqueTrainDistances),
            (Some(start), Some(stop), Some(step)) => Ok(ThresholdGrid::Fixed { start, stop, step }),
            _ => bail!("--grid-start, --grid-stop and --grid-step must be given together"),
        }
    }

    fn evaluator(&self) -> Result<VerificationEvaluator> {
        Ok(VerificationEvaluator::new(self.folds, self.far_target, self.grid()?)?)
    }

    /// Evaluate, write ROC points if asked, and return the printable summary.
    fn run(&self, samples: &[DistanceSample]) -> Result<serde_json::Value> {
        let report = self.evaluator()?.evaluate(samples)?;
        if let Some(path) = &self.roc {
            write_roc(path, &report.roc)?;
        }
        Ok(report_summary(samples.len(), &report))
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Evaluate { input, protocol } => {
            let samples = if input == Path::new("-") {
                read_samples(std::io::stdin().lock())?
            } else {
                let file = std::fs::File::open(&input)
                    .with_context(|| format!("opening {}", input.display()))?;
                read_samples(file)?
            };
            println!("{:#}", protocol.run(&samples)?);
        }
        Commands::Lfw {
            source,
            lfw_dir,
            pairs,
            ext,
            image_size,
            embedding_size,
            batch_size,
            protocol,
        } => {
            let lfw = LfwPairs::load(&lfw_dir, &pairs, &ext, image_size)?;
            if lfw.is_empty() {
                bail!("no LFW pair has both images under {}", lfw_dir.display());
            }
            let mut embedder = load_embedder(&source, image_size, embedding_size)?;
            let samples = pair_distances(embedder.as_mut(), &lfw, batch_size)?;
            let mut summary = protocol.run(&samples)?;
            summary["skipped_pairs"] = json!(lfw.skipped());
            println!("{summary:#}");
        }
        Commands::Schedule {
            lr,
            lr_decay,
            steps,
            every,
        } => {
            println!("step\tlr");
            for (step, rate) in schedule_rows(lr, lr_decay, steps, every)? {
                println!("{step}\t{rate:.6e}");
            }
        }
        Commands::Checkpoint { path } => {
            let inspection = checkpoint::inspect(&path)?;
            println!("{:#}", inspection_summary(&inspection));
            if !inspection.is_intact() {
                bail!("checkpoint {} does not match its weights", path.display());
            }
        }
    }

    Ok(())
}

fn read_samples(reader: impl Read) -> Result<Vec<DistanceSample>> {
    serde_json::from_reader(reader).context("expected a JSON array of {\"distance\", \"same\"} objects")
}

fn report_summary(pairs: usize, report: &VerificationReport) -> serde_json::Value {
    json!({
        "pairs": pairs,
        "folds": report.folds.len(),
        "accuracy": report.accuracy,
        "mean_accuracy": report.mean_accuracy,
        "val": report.val,
        "val_std": report.val_std,
        "far": report.far,
        "far_target": report.far_target,
    })
}

fn inspection_summary(inspection: &CheckpointInspection) -> serde_json::Value {
    let record = &inspection.record;
    json!({
        "resume_epoch": record.epoch,
        "saved_at": record.saved_at.to_rfc3339(),
        "weights": inspection.weights_path,
        "expected_len": record.weights_len,
        "actual_len": inspection.actual_len,
        "expected_sha256": record.weights_sha256,
        "actual_sha256": inspection.actual_sha256,
        "intact": inspection.is_intact(),
    })
}

/// `(step, lr)` at `0, every, 2 * every, ...` up to and including `steps`.
fn schedule_rows(lr: f64, lr_decay: f64, steps: u64, every: u64) -> Result<Vec<(u64, f64)>> {
    if every == 0 {
        bail!("--every must be at least 1");
    }
    let decay = InverseTimeDecay::new(lr, lr_decay)?;
    Ok((0..=steps)
        .step_by(every as usize)
        .map(|step| (step, decay.lr_at(step)))
        .collect())
}

fn load_embedder(source: &ModelSource, image_size: u32, embedding_size: usize) -> Result<Box<dyn Embedder>> {
    let input_dim = (image_size as usize) * (image_size as usize);
    match (&source.model, &source.checkpoint) {
        (Some(model), _) => Ok(Box::new(OnnxEmbedder::load(
            &model.to_string_lossy(),
            image_size as usize,
            embedding_size,
        )?)),
        (None, Some(path)) => {
            let loaded = checkpoint::load(path)?;
            let model = LinearEmbedder::from_weights(&loaded.weights, UpdateRule::from(Optimizer::Sgd), 0.0)?;
            if model.in_dim() != input_dim {
                bail!(
                    "checkpoint expects {} inputs, --image-size {image_size} gives {input_dim}",
                    model.in_dim()
                );
            }
            tracing::info!(
                path = %path.display(),
                embedding_dim = model.embedding_dim(),
                "loaded linear embedder from checkpoint"
            );
            Ok(Box::new(model))
        }
        (None, None) => bail!("one of --model or --checkpoint is required"),
    }
}

/// Embed both sides of every pair and tag each distance with its label.
fn pair_distances<E: Embedder + ?Sized>(
    embedder: &mut E,
    pairs: &LfwPairs,
    batch_size: usize,
) -> Result<Vec<DistanceSample>> {
    let distance = PairwiseDistance::euclidean();
    let mut samples = Vec::with_capacity(pairs.len());
    for batch in pairs.batches(batch_size)? {
        let batch = batch?;
        let left = embedder.embed(batch.left.view())?;
        let right = embedder.embed(batch.right.view())?;
        let distances = distance.forward(left.view(), right.view())?;
        samples.extend(
            distances
                .iter()
                .zip(&batch.same)
                .map(|(&d, &same)| DistanceSample::new(d, same)),
        );
        tracing::debug!(pairs = samples.len(), "embedded LFW batch");
    }
    Ok(samples)
}
