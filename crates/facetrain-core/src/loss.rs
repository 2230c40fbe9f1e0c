//! Triplet margin loss: `mean_i max(0, margin + d(a, p) - d(a, n))`.

use crate::distance::PairwiseDistance;
use crate::error::CoreError;
use crate::types::TripletSet;
use ndarray::{Array1, Array2, ArrayView2};

/// Hinge loss over anchor/positive/negative embeddings.
#[derive(Debug, Clone, Copy)]
pub struct TripletMarginLoss {
    margin: f32,
    distance: PairwiseDistance,
}

/// Gradient of the mean loss with respect to each embedding set.
#[derive(Debug, Clone, PartialEq)]
pub struct TripletGradients {
    pub anchor: Array2<f32>,
    pub positive: Array2<f32>,
    pub negative: Array2<f32>,
}

impl TripletMarginLoss {
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

    pub fn margin(&self) -> f32 {
        self.margin
    }

    /// Per-triplet hinge term.
    pub fn hinge(&self, positive_distance: f32, negative_distance: f32) -> f32 {
        (self.margin + positive_distance - negative_distance).max(0.0)
    }

    /// Mean hinge over the rows of the three views.
    ///
    /// Fails with [`CoreError::EmptySelection`] for zero rows; callers skip
    /// the optimization step instead of asking for a loss.
    pub fn forward(
        &self,
        anchor: ArrayView2<f32>,
        positive: ArrayView2<f32>,
        negative: ArrayView2<f32>,
    ) -> Result<f32, CoreError> {
        let (dp, dn) = self.distances(anchor, positive, negative)?;
        let total: f32 = dp.iter().zip(dn.iter()).map(|(&p, &n)| self.hinge(p, n)).sum();
        Ok(total / dp.len() as f32)
    }

    pub fn forward_set(&self, embeddings: &TripletSet) -> Result<f32, CoreError> {
        self.forward(
            embeddings.anchor().view(),
            embeddings.positive().view(),
            embeddings.negative().view(),
        )
    }

    /// Gradient of [`forward`](Self::forward) with respect to every input row.
    ///
    /// Triplets with an inactive hinge and coincident points get zero gradient.
    pub fn backward(&self, embeddings: &TripletSet) -> Result<TripletGradients, CoreError> {
        let (anchor, positive, negative) = (embeddings.anchor(), embeddings.positive(), embeddings.negative());
        let (dp, dn) = self.distances(anchor.view(), positive.view(), negative.view())?;
        let scale = 1.0 / dp.len() as f32;

        let mut grad_a = Array2::<f32>::zeros(anchor.dim());
        let mut grad_p = Array2::<f32>::zeros(anchor.dim());
        let mut grad_n = Array2::<f32>::zeros(anchor.dim());

        for i in 0..dp.len() {
            if self.hinge(dp[i], dn[i]) <= 0.0 {
                continue;
            }
            let a = anchor.row(i);
            let g_pos = self.norm_gradient(&(&a - &positive.row(i)), dp[i]);
            let g_neg = self.norm_gradient(&(&a - &negative.row(i)), dn[i]);

            grad_a.row_mut(i).assign(&((&g_pos - &g_neg) * scale));
            grad_p.row_mut(i).assign(&(&g_pos * -scale));
            grad_n.row_mut(i).assign(&(&g_neg * scale));
        }

        Ok(TripletGradients {
            anchor: grad_a,
            positive: grad_p,
            negative: grad_n,
        })
    }

    fn distances(
        &self,
        anchor: ArrayView2<f32>,
        positive: ArrayView2<f32>,
        negative: ArrayView2<f32>,
    ) -> Result<(Array1<f32>, Array1<f32>), CoreError> {
        let dp = self.distance.forward(anchor, positive)?;
        let dn = self.distance.forward(anchor, negative)?;
        if dp.is_empty() {
            return Err(CoreError::EmptySelection);
        }
        Ok((dp, dn))
    }

    /// d||x||_p / dx for a difference vector `x` whose norm is `norm`.
    fn norm_gradient(&self, diff: &Array1<f32>, norm: f32) -> Array1<f32> {
        if norm <= 0.0 {
            return Array1::zeros(diff.len());
        }
        let p = self.distance.norm();
        let denom = norm.powf(p - 1.0);
        diff.mapv(|x| if x == 0.0 { 0.0 } else { x.signum() * x.abs().powf(p - 1.0) / denom })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn line_set(pairs: &[(f32, f32)]) -> TripletSet {
        let n = pairs.len();
        TripletSet::new(
            Array2::zeros((n, 1)),
            Array2::from_shape_fn((n, 1), |(i, _)| pairs[i].0),
            Array2::from_shape_fn((n, 1), |(i, _)| -pairs[i].1),
        )
        .unwrap()
    }

    #[test]
    fn test_single_hinge_term() {
        let loss = TripletMarginLoss::new(0.5).unwrap();
        let value = loss.forward_set(&line_set(&[(0.2, 0.3)])).unwrap();
        assert!((value - 0.4).abs() < 1e-6, "got {value}");
    }

    #[test]
    fn test_mean_over_rows() {
        let loss = TripletMarginLoss::new(0.5).unwrap();
        // hinges: 0.4, 0.0 (satisfied), 1.0
        let value = loss.forward_set(&line_set(&[(0.2, 0.3), (0.1, 2.0), (0.6, 0.1)])).unwrap();
        assert!((value - 1.4 / 3.0).abs() < 1e-6, "got {value}");
    }

    #[test]
    fn test_empty_selection_is_error() {
        let loss = TripletMarginLoss::new(0.5).unwrap();
        let empty = TripletSet::new(Array2::zeros((0, 4)), Array2::zeros((0, 4)), Array2::zeros((0, 4))).unwrap();
        assert_eq!(loss.forward_set(&empty), Err(CoreError::EmptySelection));
        assert_eq!(loss.backward(&empty), Err(CoreError::EmptySelection));
    }

    #[test]
    fn test_backward_directions() {
        let loss = TripletMarginLoss::new(1.0).unwrap();
        let set = TripletSet::new(array![[0.0, 0.0]], array![[1.0, 0.0]], array![[0.0, 1.0]]).unwrap();
        let grads = loss.backward(&set).unwrap();

        // anchor: (a-p)/|a-p| - (a-n)/|a-n| = (-1, 0) - (0, -1)
        assert_eq!(grads.anchor, array![[-1.0, 1.0]]);
        // positive pulled towards the anchor, negative pushed away
        assert_eq!(grads.positive, array![[1.0, 0.0]]);
        assert_eq!(grads.negative, array![[0.0, -1.0]]);
    }

    #[test]
    fn test_backward_inactive_hinge_is_zero() {
        let loss = TripletMarginLoss::new(0.5).unwrap();
        let grads = loss.backward(&line_set(&[(0.1, 2.0)])).unwrap();
        assert!(grads.anchor.iter().chain(grads.positive.iter()).chain(grads.negative.iter()).all(|&g| g == 0.0));
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        let loss = TripletMarginLoss::new(0.8).unwrap();
        let anchor = array![[0.3, -0.2, 0.5], [0.1, 0.4, -0.3]];
        let positive = array![[0.5, 0.1, 0.2], [-0.2, 0.3, 0.1]];
        let negative = array![[0.2, -0.1, 0.9], [0.4, 0.2, -0.5]];
        let set = TripletSet::new(anchor.clone(), positive.clone(), negative.clone()).unwrap();
        let grads = loss.backward(&set).unwrap();

        let eps = 1e-3f32;
        for r in 0..2 {
            for c in 0..3 {
                let mut plus = anchor.clone();
                plus[[r, c]] += eps;
                let mut minus = anchor.clone();
                minus[[r, c]] -= eps;
                let lp = loss.forward(plus.view(), positive.view(), negative.view()).unwrap();
                let lm = loss.forward(minus.view(), positive.view(), negative.view()).unwrap();
                let numeric = (lp - lm) / (2.0 * eps);
                assert!(
                    (numeric - grads.anchor[[r, c]]).abs() < 1e-2,
                    "anchor[{r},{c}]: numeric {numeric} vs analytic {}",
                    grads.anchor[[r, c]]
                );
            }
        }
    }

    #[test]
    fn test_zero_margin_allowed() {
        let loss = TripletMarginLoss::new(0.0).unwrap();
        assert_eq!(loss.hinge(0.2, 0.3), 0.0);
        assert!(TripletMarginLoss::new(-1.0).is_err());
    }
}
