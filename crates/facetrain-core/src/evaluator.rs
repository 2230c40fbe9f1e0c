//! K-fold cross-validated pairwise verification.
//!
//! Each fold in turn is held out as the test set while the remaining samples
//! calibrate two thresholds: one maximizing accuracy and one meeting a target
//! false accept rate. Both are then applied to the held-out fold. Pairs with
//! `distance <= threshold` are classified as the same identity.
//!
//! Folds are contiguous slices in input order, so results depend only on the
//! sample order, the fold count and the threshold grid.

use crate::error::CoreError;
use crate::types::DistanceSample;
use serde::{Deserialize, Serialize};
use std::ops::Range;

// --- Defaults ---
pub const DEFAULT_FOLDS: usize = 10;
pub const DEFAULT_FAR_TARGET: f64 = 1e-3;
const MAX_FIXED_CANDIDATES: usize = 1_000_000;

/// How threshold candidates are generated from a fold's training samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ThresholdGrid {
    /// Every distinct training distance, ascending.
    UniqueTrainDistances,
    /// `start, start + step, ...` strictly below `stop`, independent of the data.
    Fixed { start: f32, stop: f32, step: f32 },
}

impl Default for ThresholdGrid {
    fn default() -> Self {
        Self::UniqueTrainDistances
    }
}

impl ThresholdGrid {
    fn validate(&self) -> Result<(), CoreError> {
        if let Self::Fixed { start, stop, step } = *self {
            if !(start.is_finite() && stop.is_finite() && step.is_finite()) {
                return Err(CoreError::config("threshold grid bounds must be finite"));
            }
            if step <= 0.0 || stop <= start {
                return Err(CoreError::config(format!(
                    "threshold grid needs step > 0 and stop > start, got start={start} stop={stop} step={step}"
                )));
            }
            let count = ((stop - start) / step).ceil() as usize;
            if count > MAX_FIXED_CANDIDATES {
                return Err(CoreError::config(format!(
                    "threshold grid has {count} candidates, limit is {MAX_FIXED_CANDIDATES}"
                )));
            }
        }
        Ok(())
    }

    /// Ascending candidate thresholds for the given training samples.
    fn candidates(&self, train: &SortedSamples) -> Vec<f32> {
        match *self {
            Self::UniqueTrainDistances => {
                let mut out: Vec<f32> = train.samples.iter().map(|s| s.distance).collect();
                out.dedup();
                out
            }
            Self::Fixed { start, stop, step } => (0..)
                .map(|i| start + i as f32 * step)
                .take_while(|&t| t < stop)
                .collect(),
        }
    }
}

/// Outcome of one held-out fold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoldReport {
    pub fold: usize,
    pub train_size: usize,
    pub test_size: usize,
    /// Threshold that maximized accuracy on the training part.
    pub accuracy_threshold: f32,
    pub train_accuracy: f64,
    pub accuracy: f64,
    pub tpr: f64,
    pub fpr: f64,
    /// Threshold calibrated to the target FAR on the training part.
    pub far_threshold: f32,
    pub train_far: f64,
    pub val: f64,
    pub far: f64,
}

/// A (false positive rate, true positive rate) point on a fold's test set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RocPoint {
    pub fold: usize,
    pub threshold: f32,
    pub fpr: f64,
    pub tpr: f64,
}

/// Aggregated cross-validation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    /// Per-fold test accuracy, in fold order.
    pub accuracy: Vec<f64>,
    pub mean_accuracy: f64,
    /// Mean validation rate at the target FAR.
    pub val: f64,
    /// Sample standard deviation of the per-fold validation rates.
    pub val_std: f64,
    /// Mean FAR actually achieved on the test folds.
    pub far: f64,
    pub far_target: f64,
    pub folds: Vec<FoldReport>,
    /// One point per fold and candidate threshold, concatenated in fold order.
    pub roc: Vec<RocPoint>,
}

impl VerificationReport {
    pub fn tpr(&self) -> Vec<f64> {
        self.roc.iter().map(|p| p.tpr).collect()
    }

    pub fn fpr(&self) -> Vec<f64> {
        self.roc.iter().map(|p| p.fpr).collect()
    }
}

/// Stateless k-fold verification protocol.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VerificationEvaluator {
    folds: usize,
    far_target: f64,
    grid: ThresholdGrid,
}

impl Default for VerificationEvaluator {
    fn default() -> Self {
        Self {
            folds: DEFAULT_FOLDS,
            far_target: DEFAULT_FAR_TARGET,
            grid: ThresholdGrid::UniqueTrainDistances,
        }
    }
}

impl VerificationEvaluator {
    pub fn new(folds: usize, far_target: f64, grid: ThresholdGrid) -> Result<Self, CoreError> {
        if folds < 2 {
            return Err(CoreError::config(format!("fold count must be at least 2, got {folds}")));
        }
        if !(0.0..=1.0).contains(&far_target) {
            return Err(CoreError::config(format!(
                "target FAR must lie in [0, 1], got {far_target}"
            )));
        }
        grid.validate()?;
        Ok(Self { folds, far_target, grid })
    }

    pub fn with_folds(folds: usize) -> Result<Self, CoreError> {
        Self::new(folds, DEFAULT_FAR_TARGET, ThresholdGrid::default())
    }

    pub fn folds(&self) -> usize {
        self.folds
    }

    pub fn far_target(&self) -> f64 {
        self.far_target
    }

    pub fn grid(&self) -> ThresholdGrid {
        self.grid
    }

    /// Run the full protocol over `samples`.
    pub fn evaluate(&self, samples: &[DistanceSample]) -> Result<VerificationReport, CoreError> {
        if self.folds > samples.len() {
            return Err(CoreError::config(format!(
                "fold count {} exceeds sample count {}",
                self.folds,
                samples.len()
            )));
        }
        if let Some((index, s)) = samples
            .iter()
            .enumerate()
            .find(|(_, s)| !s.distance.is_finite() || s.distance < 0.0)
        {
            return Err(CoreError::InvalidDistance { index, value: s.distance });
        }

        let mut folds = Vec::with_capacity(self.folds);
        let mut roc = Vec::new();

        for (fold, range) in fold_ranges(samples.len(), self.folds).into_iter().enumerate() {
            let test = SortedSamples::new(samples[range.clone()].iter().copied());
            let train = SortedSamples::new(
                samples[..range.start]
                    .iter()
                    .chain(&samples[range.end..])
                    .copied(),
            );
            let candidates = self.grid.candidates(&train);
            let train_sweep = train.sweep(&candidates);

            // Accuracy: first maximum wins, i.e. the smallest threshold.
            let mut best = 0;
            for (i, c) in train_sweep.iter().enumerate() {
                if c.correct() > train_sweep[best].correct() {
                    best = i;
                }
            }
            let accuracy_threshold = candidates[best];
            let train_accuracy = train_sweep[best].accuracy();

            // FAR is non-decreasing along the ascending candidates, so the last
            // candidate within the target is the closest one from below. When
            // every candidate overshoots, the first has the smallest FAR.
            let far_idx = train_sweep
                .iter()
                .rposition(|c| c.fpr() <= self.far_target)
                .unwrap_or(0);
            let far_threshold = candidates[far_idx];
            let train_far = train_sweep[far_idx].fpr();

            let at_accuracy = test.confusion_at(accuracy_threshold);
            let at_far = test.confusion_at(far_threshold);

            roc.extend(
                candidates
                    .iter()
                    .zip(test.sweep(&candidates))
                    .map(|(&threshold, c)| RocPoint {
                        fold,
                        threshold,
                        fpr: c.fpr(),
                        tpr: c.tpr(),
                    }),
            );

            let report = FoldReport {
                fold,
                train_size: train.len(),
                test_size: test.len(),
                accuracy_threshold,
                train_accuracy,
                accuracy: at_accuracy.accuracy(),
                tpr: at_accuracy.tpr(),
                fpr: at_accuracy.fpr(),
                far_threshold,
                train_far,
                val: at_far.tpr(),
                far: at_far.fpr(),
            };
            tracing::debug!(
                fold,
                test_size = report.test_size,
                threshold = report.accuracy_threshold,
                accuracy = report.accuracy,
                val = report.val,
                far = report.far,
                "verification fold"
            );
            folds.push(report);
        }

        let accuracy: Vec<f64> = folds.iter().map(|f| f.accuracy).collect();
        let vals: Vec<f64> = folds.iter().map(|f| f.val).collect();
        let fars: Vec<f64> = folds.iter().map(|f| f.far).collect();

        Ok(VerificationReport {
            mean_accuracy: mean(&accuracy),
            accuracy,
            val: mean(&vals),
            val_std: sample_std(&vals),
            far: mean(&fars),
            far_target: self.far_target,
            folds,
            roc,
        })
    }
}

/// Split `0..n` into `k` contiguous ranges whose sizes differ by at most one.
/// The first `n % k` ranges hold the extra element.
pub fn fold_ranges(n: usize, k: usize) -> Vec<Range<usize>> {
    if k == 0 {
        return Vec::new();
    }
    let base = n / k;
    let extra = n % k;
    let mut start = 0;
    (0..k)
        .map(|i| {
            let len = base + usize::from(i < extra);
            let range = start..start + len;
            start += len;
            range
        })
        .collect()
}

/// Samples sorted by distance, with class totals.
struct SortedSamples {
    samples: Vec<DistanceSample>,
    positives: usize,
    negatives: usize,
}

impl SortedSamples {
    fn new(samples: impl Iterator<Item = DistanceSample>) -> Self {
        let mut samples: Vec<DistanceSample> = samples.collect();
        samples.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        let positives = samples.iter().filter(|s| s.same).count();
        let negatives = samples.len() - positives;
        Self { samples, positives, negatives }
    }

    fn len(&self) -> usize {
        self.samples.len()
    }

    /// Confusion counts at every threshold of an ascending list, in one pass.
    fn sweep(&self, thresholds: &[f32]) -> Vec<Confusion> {
        let mut idx = 0;
        let mut same_below = 0;
        let mut diff_below = 0;
        thresholds
            .iter()
            .map(|&t| {
                while idx < self.samples.len() && self.samples[idx].distance <= t {
                    if self.samples[idx].same {
                        same_below += 1;
                    } else {
                        diff_below += 1;
                    }
                    idx += 1;
                }
                self.confusion(same_below, diff_below)
            })
            .collect()
    }

    fn confusion_at(&self, threshold: f32) -> Confusion {
        let below = self.samples.partition_point(|s| s.distance <= threshold);
        let same_below = self.samples[..below].iter().filter(|s| s.same).count();
        self.confusion(same_below, below - same_below)
    }

    fn confusion(&self, same_below: usize, diff_below: usize) -> Confusion {
        Confusion {
            tp: same_below,
            fp: diff_below,
            tn: self.negatives - diff_below,
            fn_: self.positives - same_below,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Confusion {
    tp: usize,
    fp: usize,
    tn: usize,
    fn_: usize,
}

impl Confusion {
    fn correct(&self) -> usize {
        self.tp + self.tn
    }

    fn accuracy(&self) -> f64 {
        ratio(self.correct(), self.tp + self.fp + self.tn + self.fn_)
    }

    /// True positive rate; 0 when there are no positives.
    fn tpr(&self) -> f64 {
        ratio(self.tp, self.tp + self.fn_)
    }

    /// False positive (false accept) rate; 0 when there are no negatives.
    fn fpr(&self) -> f64 {
        ratio(self.fp, self.fp + self.tn)
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}
