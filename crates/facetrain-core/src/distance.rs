//! Batched pairwise distance between index-aligned embedding rows.

use crate::error::CoreError;
use ndarray::{Array1, ArrayView2, Zip};

const EUCLIDEAN_NORM: f32 = 2.0;

/// Row-wise Minkowski distance of order `norm` (2 = Euclidean).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairwiseDistance {
    norm: f32,
}

impl Default for PairwiseDistance {
    fn default() -> Self {
        Self::euclidean()
    }
}

impl PairwiseDistance {
    pub fn new(norm: f32) -> Result<Self, CoreError> {
        if !norm.is_finite() || norm < 1.0 {
            return Err(CoreError::config(format!(
                "distance norm must be a finite value >= 1, got {norm}"
            )));
        }
        Ok(Self { norm })
    }

    pub fn euclidean() -> Self {
        Self { norm: EUCLIDEAN_NORM }
    }

    pub fn norm(&self) -> f32 {
        self.norm
    }

    /// One distance per row pair `(a[i], b[i])`.
    pub fn forward(&self, a: ArrayView2<f32>, b: ArrayView2<f32>) -> Result<Array1<f32>, CoreError> {
        if a.dim() != b.dim() {
            return Err(CoreError::ShapeMismatch {
                context: "pairwise distance",
                expected: a.dim(),
                actual: b.dim(),
            });
        }
        let mut out = Array1::<f32>::zeros(a.nrows());
        Zip::from(&mut out)
            .and(a.rows())
            .and(b.rows())
            .for_each(|d, ra, rb| {
                *d = self.reduce(ra.iter().zip(rb.iter()).map(|(x, y)| x - y));
            });
        Ok(out)
    }

    fn reduce(&self, diffs: impl Iterator<Item = f32>) -> f32 {
        if self.norm == EUCLIDEAN_NORM {
            // Nothing below zero may reach the root.
            let sum: f32 = diffs.map(|d| d * d).sum();
            return sum.max(0.0).sqrt();
        }
        let sum: f32 = diffs.map(|d| d.abs().powf(self.norm)).sum();
        sum.max(0.0).powf(1.0 / self.norm)
    }
}
