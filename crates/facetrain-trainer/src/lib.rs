//! facetrain-trainer — Online hard-triplet training of face embedders.
//!
//! Wires the data sources to a trainable embedder, the triplet miner and loss,
//! per-group learning rate schedules and the verification protocol, and
//! persists checkpoints, ROC points and scalar metrics into a run directory.

pub mod checkpoint;
pub mod config;
pub mod metrics;
pub mod model;
pub mod optim;
pub mod trainer;

pub use checkpoint::{CheckpointError, CheckpointRecord, LoadedCheckpoint};
pub use config::{ConfigError, LossAveraging, Optimizer, TrainConfig};
pub use metrics::{Fanout, MemorySink, MetricError, MetricSink, SqliteSink, TracingSink};
pub use model::{LinearEmbedder, ModelError, TrainableEmbedder};
pub use optim::{GroupOptimizer, UpdateRule};
pub use trainer::{run_training, EpochSummary, RunSummary, TrainError, Trainer};
