//! facetrain-core — Triplet training and verification numerics.
//!
//! Online hard-triplet mining, the triplet margin loss, inverse-time learning
//! rate decay and k-fold cross-validated face verification. The embedding
//! model is only seen through the [`Embedder`] trait.

pub mod distance;
pub mod embedder;
pub mod error;
pub mod evaluator;
pub mod loss;
pub mod miner;
pub mod schedule;
pub mod types;

pub use distance::PairwiseDistance;
pub use embedder::{Embedder, EmbedderError, OnnxEmbedder};
pub use error::CoreError;
pub use evaluator::{ThresholdGrid, VerificationEvaluator, VerificationReport};
pub use loss::{TripletGradients, TripletMarginLoss};
pub use miner::{HardTripletMiner, MiningOutcome};
pub use schedule::{GroupSchedule, InverseTimeDecay, LRScheduler, ParamGroupSchedules, ScheduleState};
pub use types::{DistanceSample, TripletBatch, TripletSet};
