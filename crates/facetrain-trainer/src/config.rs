use clap::{Parser, ValueEnum};
use facetrain_core::ThresholdGrid;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid option --{flag}: {reason}")]
    Invalid { flag: &'static str, reason: String },
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("toml: {0}")]
    Toml(#[from] toml::ser::Error),
}

/// Parameter update rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Optimizer {
    Sgd,
    Adam,
    Adagrad,
}

impl fmt::Display for Optimizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sgd => "sgd",
            Self::Adam => "adam",
            Self::Adagrad => "adagrad",
        };
        f.write_str(name)
    }
}

/// Which batches count in the per-epoch average loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LossAveraging {
    /// Only batches that had hard triplets and were optimized.
    #[default]
    OptimizedOnly,
    /// Every batch; skipped batches contribute a loss of zero.
    AllBatches,
}

/// Triplet training configuration. Every flag can also be set through a
/// `FACETRAIN_*` environment variable.
#[derive(Debug, Clone, PartialEq, Parser, Serialize, Deserialize)]
#[command(name = "facetrain-train", about = "Train a face embedding with online hard triplet mining")]
pub struct TrainConfig {
    /// Root of the training set, one subdirectory per identity
    #[arg(long, env = "FACETRAIN_DATAROOT")]
    pub dataroot: PathBuf,

    /// LFW image root
    #[arg(long, env = "FACETRAIN_LFW_DIR")]
    pub lfw_dir: PathBuf,

    /// LFW pairs.txt protocol file
    #[arg(long, env = "FACETRAIN_LFW_PAIRS_PATH")]
    pub lfw_pairs_path: PathBuf,

    /// Image extension of LFW files
    #[arg(long, env = "FACETRAIN_LFW_EXT", default_value = facetrain_data::lfw::DEFAULT_EXTENSION)]
    pub lfw_ext: String,

    /// Parent directory of per-run output directories
    #[arg(long, env = "FACETRAIN_LOG_DIR", default_value = "runs")]
    pub log_dir: PathBuf,

    /// Checkpoint record (`checkpoint_<e>.json`) to resume from
    #[arg(long, env = "FACETRAIN_RESUME")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume: Option<PathBuf>,

    /// First epoch index when not resuming
    #[arg(long, env = "FACETRAIN_START_EPOCH", default_value_t = 0)]
    pub start_epoch: usize,

    #[arg(long, env = "FACETRAIN_EPOCHS", default_value_t = 10)]
    pub epochs: usize,

    #[arg(long, env = "FACETRAIN_EMBEDDING_SIZE", default_value_t = 256)]
    pub embedding_size: usize,

    #[arg(long, env = "FACETRAIN_BATCH_SIZE", default_value_t = 64)]
    pub batch_size: usize,

    #[arg(long, env = "FACETRAIN_TEST_BATCH_SIZE", default_value_t = 64)]
    pub test_batch_size: usize,

    /// Number of triplets drawn from the training set
    #[arg(long, env = "FACETRAIN_N_TRIPLETS", default_value_t = 1_000_000)]
    pub n_triplets: usize,

    #[arg(long, env = "FACETRAIN_MARGIN", default_value_t = 0.5)]
    pub margin: f32,

    /// Base learning rate
    #[arg(long, env = "FACETRAIN_LR", default_value_t = 0.1)]
    pub lr: f64,

    /// Inverse-time learning rate decay per optimization step
    #[arg(long, env = "FACETRAIN_LR_DECAY", default_value_t = 1e-4)]
    pub lr_decay: f64,

    /// Weight decay
    #[arg(long, env = "FACETRAIN_WD", default_value_t = 0.0)]
    pub wd: f64,

    #[arg(long, env = "FACETRAIN_OPTIMIZER", value_enum, default_value_t = Optimizer::Adagrad)]
    pub optimizer: Optimizer,

    #[arg(long, env = "FACETRAIN_SEED", default_value_t = 0)]
    pub seed: u64,

    /// Batches between progress log lines
    #[arg(long, env = "FACETRAIN_LOG_INTERVAL", default_value_t = 10)]
    pub log_interval: usize,

    /// Exported as CUDA_VISIBLE_DEVICES before any model is loaded
    #[arg(long, env = "FACETRAIN_GPU_ID")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_id: Option<String>,

    /// Side length of the square grayscale face crops
    #[arg(long, env = "FACETRAIN_IMAGE_SIZE", default_value_t = 96)]
    pub image_size: u32,

    /// Cross-validation folds for the per-epoch training evaluation
    #[arg(long, env = "FACETRAIN_TRAIN_FOLDS", default_value_t = 10)]
    pub train_folds: usize,

    /// Cross-validation folds for the LFW evaluation
    #[arg(long, env = "FACETRAIN_TEST_FOLDS", default_value_t = 3)]
    pub test_folds: usize,

    /// Target false accept rate for the validation rate
    #[arg(long, env = "FACETRAIN_FAR_TARGET", default_value_t = 1e-3)]
    pub far_target: f64,

    #[arg(long, env = "FACETRAIN_LOSS_AVERAGING", value_enum, default_value_t = LossAveraging::OptimizedOnly)]
    pub loss_averaging: LossAveraging,

    /// First threshold of the evaluation grid
    #[arg(long, env = "FACETRAIN_GRID_START", default_value_t = 0.0)]
    pub grid_start: f32,

    /// Thresholds stay strictly below this value
    #[arg(long, env = "FACETRAIN_GRID_STOP", default_value_t = 4.0)]
    pub grid_stop: f32,

    #[arg(long, env = "FACETRAIN_GRID_STEP", default_value_t = 0.01)]
    pub grid_step: f32,

    /// Calibrate on every distinct training distance instead of the fixed
    /// grid. ROC files then grow with the number of samples.
    #[arg(long, env = "FACETRAIN_UNIQUE_THRESHOLDS")]
    #[serde(default)]
    pub unique_thresholds: bool,
}

// --- Limits ---
pub const MAX_IMAGE_SIZE: u32 = 4096;
pub const MAX_GRID_THRESHOLDS: usize = 100_000;

fn invalid(flag: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        flag,
        reason: reason.into(),
    }
}

impl TrainConfig {
    /// Reject values that would fail deep inside a run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("epochs", self.epochs),
            ("embedding-size", self.embedding_size),
            ("batch-size", self.batch_size),
            ("test-batch-size", self.test_batch_size),
            ("n-triplets", self.n_triplets),
            ("log-interval", self.log_interval),
            ("image-size", self.image_size as usize),
        ];
        for (flag, value) in positive {
            if value == 0 {
                return Err(invalid(flag, "must be positive"));
            }
        }
        for (flag, folds) in [("train-folds", self.train_folds), ("test-folds", self.test_folds)] {
            if folds < 2 {
                return Err(invalid(flag, format!("need at least 2 folds, got {folds}")));
            }
        }
        if !self.margin.is_finite() || self.margin < 0.0 {
            return Err(invalid("margin", format!("must be non-negative, got {}", self.margin)));
        }
        if !self.lr.is_finite() || self.lr <= 0.0 {
            return Err(invalid("lr", format!("must be positive, got {}", self.lr)));
        }
        if !self.lr_decay.is_finite() || self.lr_decay < 0.0 {
            return Err(invalid("lr-decay", format!("must be non-negative, got {}", self.lr_decay)));
        }
        if !self.wd.is_finite() || self.wd < 0.0 {
            return Err(invalid("wd", format!("must be non-negative, got {}", self.wd)));
        }
        if self.image_size > MAX_IMAGE_SIZE {
            return Err(invalid(
                "image-size",
                format!("must be at most {MAX_IMAGE_SIZE}, got {}", self.image_size),
            ));
        }
        if !(0.0..=1.0).contains(&self.far_target) {
            return Err(invalid("far-target", format!("must lie in [0, 1], got {}", self.far_target)));
        }
        self.validate_grid()
    }

    fn validate_grid(&self) -> Result<(), ConfigError> {
        let (start, stop, step) = (self.grid_start, self.grid_stop, self.grid_step);
        if !(start.is_finite() && stop.is_finite()) || stop <= start {
            return Err(invalid(
                "grid-stop",
                format!("must be finite and above --grid-start, got {start}..{stop}"),
            ));
        }
        if !step.is_finite() || step <= 0.0 {
            return Err(invalid("grid-step", format!("must be positive, got {step}")));
        }
        let count = ((stop - start) / step).ceil() as usize;
        if count > MAX_GRID_THRESHOLDS {
            return Err(invalid(
                "grid-step",
                format!("grid has {count} thresholds, limit is {MAX_GRID_THRESHOLDS}"),
            ));
        }
        Ok(())
    }

    /// Threshold candidates for both verification protocols.
    pub fn threshold_grid(&self) -> ThresholdGrid {
        if self.unique_thresholds {
            ThresholdGrid::UniqueTrainDistances
        } else {
            ThresholdGrid::Fixed {
                start: self.grid_start,
                stop: self.grid_stop,
                step: self.grid_step,
            }
        }
    }

    /// Name of the per-run output directory, built from the hyperparameters.
    pub fn run_name(&self) -> String {
        format!(
            "run-optim_{}-n{}-lr{:?}-wd{:?}-m{:?}-embeddings{}",
            self.optimizer, self.n_triplets, self.lr, self.wd, self.margin, self.embedding_size
        )
    }

    pub fn run_dir(&self) -> PathBuf {
        self.log_dir.join(self.run_name())
    }

    /// Flattened input width of the embedder.
    pub fn input_dim(&self) -> usize {
        let side = self.image_size as usize;
        side * side
    }

    /// Persist the effective configuration as TOML.
    pub fn write_toml(&self, path: &Path) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self)?;
        std::fs::write(path, text).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}
