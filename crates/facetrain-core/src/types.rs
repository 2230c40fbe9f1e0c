use crate::error::CoreError;
use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

/// A pairwise distance tagged with whether both sides share an identity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistanceSample {
    pub distance: f32,
    pub same: bool,
}

impl DistanceSample {
    pub fn new(distance: f32, same: bool) -> Self {
        Self { distance, same }
    }
}

/// Three index-aligned row collections (anchor, positive, negative).
///
/// Row `i` of each matrix belongs to triplet `i`. All three matrices always
/// have the same shape.
#[derive(Debug, Clone, PartialEq)]
pub struct TripletSet {
    anchor: Array2<f32>,
    positive: Array2<f32>,
    negative: Array2<f32>,
}

impl TripletSet {
    pub fn new(
        anchor: Array2<f32>,
        positive: Array2<f32>,
        negative: Array2<f32>,
    ) -> Result<Self, CoreError> {
        let expected = anchor.dim();
        for (context, other) in [("positive rows", &positive), ("negative rows", &negative)] {
            if other.dim() != expected {
                return Err(CoreError::ShapeMismatch {
                    context,
                    expected,
                    actual: other.dim(),
                });
            }
        }
        Ok(Self { anchor, positive, negative })
    }

    pub fn anchor(&self) -> &Array2<f32> {
        &self.anchor
    }

    pub fn positive(&self) -> &Array2<f32> {
        &self.positive
    }

    pub fn negative(&self) -> &Array2<f32> {
        &self.negative
    }

    /// Number of triplets.
    pub fn len(&self) -> usize {
        self.anchor.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Row width (embedding dimension or flattened input size).
    pub fn width(&self) -> usize {
        self.anchor.ncols()
    }

    /// Keep only the given rows, in the given order, from all three matrices.
    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            anchor: self.anchor.select(Axis(0), indices),
            positive: self.positive.select(Axis(0), indices),
            negative: self.negative.select(Axis(0), indices),
        }
    }

    pub fn into_parts(self) -> (Array2<f32>, Array2<f32>, Array2<f32>) {
        (self.anchor, self.positive, self.negative)
    }
}

/// A mini-batch of triplets: raw inputs, their embeddings and identity labels.
///
/// Every collection is index-aligned. Subsets are only taken through
/// [`TripletBatch::select`], so the mined embeddings can never drift away from
/// the inputs they were computed from.
#[derive(Debug, Clone, PartialEq)]
pub struct TripletBatch {
    inputs: TripletSet,
    embeddings: TripletSet,
    positive_labels: Vec<u32>,
    negative_labels: Vec<u32>,
}

impl TripletBatch {
    pub fn new(
        inputs: TripletSet,
        embeddings: TripletSet,
        positive_labels: Vec<u32>,
        negative_labels: Vec<u32>,
    ) -> Result<Self, CoreError> {
        let n = inputs.len();
        let lengths = [
            ("embedding rows", embeddings.len()),
            ("positive labels", positive_labels.len()),
            ("negative labels", negative_labels.len()),
        ];
        for (context, len) in lengths {
            if len != n {
                return Err(CoreError::ShapeMismatch {
                    context,
                    expected: (n, 1),
                    actual: (len, 1),
                });
            }
        }
        Ok(Self {
            inputs,
            embeddings,
            positive_labels,
            negative_labels,
        })
    }

    pub fn inputs(&self) -> &TripletSet {
        &self.inputs
    }

    pub fn embeddings(&self) -> &TripletSet {
        &self.embeddings
    }

    pub fn positive_labels(&self) -> &[u32] {
        &self.positive_labels
    }

    pub fn negative_labels(&self) -> &[u32] {
        &self.negative_labels
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slice inputs, embeddings and labels together.
    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            inputs: self.inputs.select(indices),
            embeddings: self.embeddings.select(indices),
            positive_labels: indices.iter().map(|&i| self.positive_labels[i]).collect(),
            negative_labels: indices.iter().map(|&i| self.negative_labels[i]).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn set(offset: f32) -> TripletSet {
        TripletSet::new(
            array![[offset, 0.0], [offset + 1.0, 0.0], [offset + 2.0, 0.0]],
            array![[offset, 1.0], [offset + 1.0, 1.0], [offset + 2.0, 1.0]],
            array![[offset, 2.0], [offset + 1.0, 2.0], [offset + 2.0, 2.0]],
        )
        .unwrap()
    }

    #[test]
    fn test_triplet_set_rejects_mismatched_rows() {
        let err = TripletSet::new(
            Array2::zeros((3, 2)),
            Array2::zeros((2, 2)),
            Array2::zeros((3, 2)),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::ShapeMismatch { context: "positive rows", .. }));
    }

    #[test]
    fn test_triplet_set_rejects_mismatched_dim() {
        let err = TripletSet::new(
            Array2::zeros((3, 2)),
            Array2::zeros((3, 2)),
            Array2::zeros((3, 4)),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::ShapeMismatch { context: "negative rows", .. }));
    }

    #[test]
    fn test_batch_rejects_label_length() {
        let err = TripletBatch::new(set(0.0), set(10.0), vec![1, 2, 3], vec![4, 5]).unwrap_err();
        assert!(matches!(err, CoreError::ShapeMismatch { context: "negative labels", .. }));
    }

    #[test]
    fn test_batch_select_keeps_alignment() {
        let batch = TripletBatch::new(set(0.0), set(10.0), vec![1, 2, 3], vec![4, 5, 6]).unwrap();
        let picked = batch.select(&[2, 0]);

        assert_eq!(picked.len(), 2);
        assert_eq!(picked.inputs().anchor(), &array![[2.0, 0.0], [0.0, 0.0]]);
        assert_eq!(picked.inputs().negative(), &array![[2.0, 2.0], [0.0, 2.0]]);
        assert_eq!(picked.embeddings().positive(), &array![[12.0, 1.0], [10.0, 1.0]]);
        assert_eq!(picked.positive_labels(), &[3, 1]);
        assert_eq!(picked.negative_labels(), &[6, 4]);
    }

    #[test]
    fn test_batch_select_empty() {
        let batch = TripletBatch::new(set(0.0), set(10.0), vec![1, 2, 3], vec![4, 5, 6]).unwrap();
        let picked = batch.select(&[]);
        assert!(picked.is_empty());
        assert_eq!(picked.embeddings().width(), 2);
    }
}
