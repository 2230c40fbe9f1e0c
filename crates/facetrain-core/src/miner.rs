//! Online in-batch hard triplet mining.
//!
//! A triplet is hard when the current embeddings do not yet push the negative
//! at least `margin` further from the anchor than the positive:
//! `d(a, n) - d(a, p) < margin`.

use crate::distance::PairwiseDistance;
use crate::error::CoreError;
use crate::types::{DistanceSample, TripletBatch};
use ndarray::Array1;

/// Selects the margin-violating triplets of a batch.
#[derive(Debug, Clone, Copy)]
pub struct HardTripletMiner {
    margin: f32,
    distance: PairwiseDistance,
}

impl HardTripletMiner {
    pub fn new(margin: f32) -> Result<Self, CoreError> {
        Self::with_distance(margin, PairwiseDistance::euclidean())
    }

    pub fn with_distance(margin: f32, distance: PairwiseDistance) -> Result<Self, CoreError> {
        if !margin.is_finite() || margin < 0.0 {
            return Err(CoreError::config(format!(
                "margin must be a finite non-negative value, got {margin}"
            )));
        }
        Ok(Self { margin, distance })
    }

    /// Measure every triplet of the batch and pick the hard ones.
    pub fn mine(&self, batch: &TripletBatch) -> Result<MiningOutcome, CoreError> {
        let emb = batch.embeddings();
        let positive_distances = self.distance.forward(emb.anchor().view(), emb.positive().view())?;
        let negative_distances = self.distance.forward(emb.anchor().view(), emb.negative().view())?;

        let selected: Vec<usize> = positive_distances
            .iter()
            .zip(negative_distances.iter())
            .enumerate()
            .filter(|&(_, (&dp, &dn))| dn - dp < self.margin)
            .map(|(i, _)| i)
            .collect();

        tracing::trace!(
            batch = batch.len(),
            hard = selected.len(),
            margin = self.margin,
            "mined triplets"
        );

        Ok(MiningOutcome {
            positive_distances,
            negative_distances,
            selected,
        })
    }
}

/// Result of mining one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct MiningOutcome {
    /// `d(anchor[i], positive[i])` for the whole batch.
    pub positive_distances: Array1<f32>,
    /// `d(anchor[i], negative[i])` for the whole batch.
    pub negative_distances: Array1<f32>,
    /// Indices of hard triplets, ascending.
    pub selected: Vec<usize>,
}

impl MiningOutcome {
    /// True when no triplet violates the margin; the batch must not be optimized.
    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }

    pub fn hard_count(&self) -> usize {
        self.selected.len()
    }

    /// The hard subset of `batch` (inputs, embeddings and labels), or `None`
    /// when nothing was selected.
    pub fn hard_batch(&self, batch: &TripletBatch) -> Option<TripletBatch> {
        if self.is_empty() {
            None
        } else {
            Some(batch.select(&self.selected))
        }
    }

    /// All anchor-positive distances labelled same, followed by all
    /// anchor-negative distances labelled different.
    pub fn distance_samples(&self) -> Vec<DistanceSample> {
        self.positive_distances
            .iter()
            .map(|&d| DistanceSample::new(d, true))
            .chain(self.negative_distances.iter().map(|&d| DistanceSample::new(d, false)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TripletSet;
    use ndarray::{array, Array2};

    /// Embeddings on a line so that d(a, p) and d(a, n) are the given values.
    fn batch_with_distances(pairs: &[(f32, f32)]) -> TripletBatch {
        let n = pairs.len();
        let anchor = Array2::<f32>::zeros((n, 1));
        let positive = Array2::from_shape_fn((n, 1), |(i, _)| pairs[i].0);
        let negative = Array2::from_shape_fn((n, 1), |(i, _)| -pairs[i].1);
        let inputs = Array2::from_shape_fn((n, 2), |(i, j)| (i * 10 + j) as f32);
        TripletBatch::new(
            TripletSet::new(inputs.clone(), inputs.clone(), inputs).unwrap(),
            TripletSet::new(anchor, positive, negative).unwrap(),
            (0..n as u32).collect(),
            (100..100 + n as u32).collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_violating_triplet_selected() {
        let batch = batch_with_distances(&[(0.2, 0.3)]);
        let outcome = HardTripletMiner::new(0.5).unwrap().mine(&batch).unwrap();
        assert_eq!(outcome.selected, vec![0]);
        assert!((outcome.positive_distances[0] - 0.2).abs() < 1e-6);
        assert!((outcome.negative_distances[0] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_satisfied_batch_is_empty() {
        let batch = batch_with_distances(&[(0.1, 0.7), (0.2, 1.5), (0.0, 0.5)]);
        let outcome = HardTripletMiner::new(0.5).unwrap().mine(&batch).unwrap();
        assert!(outcome.is_empty());
        assert!(outcome.hard_batch(&batch).is_none());
    }

    #[test]
    fn test_margin_boundary_is_not_hard() {
        // d_neg - d_pos == margin exactly
        let batch = batch_with_distances(&[(0.25, 0.75)]);
        let outcome = HardTripletMiner::new(0.5).unwrap().mine(&batch).unwrap();
        assert!(outcome.is_empty());
    }

    #[test]
    fn test_hard_batch_slices_inputs_and_labels() {
        let batch = batch_with_distances(&[(0.1, 2.0), (0.9, 0.3), (0.1, 3.0), (0.4, 0.5)]);
        let outcome = HardTripletMiner::new(0.5).unwrap().mine(&batch).unwrap();
        assert_eq!(outcome.selected, vec![1, 3]);

        let hard = outcome.hard_batch(&batch).unwrap();
        assert_eq!(hard.len(), 2);
        assert_eq!(hard.positive_labels(), &[1, 3]);
        assert_eq!(hard.negative_labels(), &[101, 103]);
        assert_eq!(hard.inputs().anchor(), &array![[10.0, 11.0], [30.0, 31.0]]);
        assert_eq!(hard.embeddings().positive(), &array![[0.9], [0.4]]);
    }

    #[test]
    fn test_zero_margin_selects_inverted_only() {
        let batch = batch_with_distances(&[(0.5, 0.4), (0.5, 0.5), (0.5, 0.6)]);
        let outcome = HardTripletMiner::new(0.0).unwrap().mine(&batch).unwrap();
        assert_eq!(outcome.selected, vec![0]);
    }

    #[test]
    fn test_distance_samples_layout() {
        let batch = batch_with_distances(&[(0.1, 0.2), (0.3, 0.4)]);
        let outcome = HardTripletMiner::new(0.5).unwrap().mine(&batch).unwrap();
        let samples = outcome.distance_samples();
        assert_eq!(samples.len(), 4);
        assert!(samples[..2].iter().all(|s| s.same));
        assert!(samples[2..].iter().all(|s| !s.same));
        assert!((samples[3].distance - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_negative_margin_rejected() {
        assert!(HardTripletMiner::new(-0.1).is_err());
    }
}
