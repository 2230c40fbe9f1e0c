//! Per-parameter-group update rules.
//!
//! The learning rate is not owned here: the caller passes the current rate of
//! the group's schedule on every update. Weight decay adds `wd * θ` to the
//! gradient before the rule sees it.

use crate::config::Optimizer;
use crate::model::ModelError;
use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, IxDyn, Zip};

// --- Fixed hyperparameters ---
pub const SGD_MOMENTUM: f32 = 0.9;
pub const SGD_DAMPENING: f32 = 0.9;
pub const ADAM_BETA1: f32 = 0.9;
pub const ADAM_BETA2: f32 = 0.999;
pub const ADAM_EPS: f32 = 1e-8;
pub const ADAGRAD_EPS: f32 = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpdateRule {
    /// `buf = g` on the first step, then `buf = momentum * buf + (1 - dampening) * g`.
    Sgd { momentum: f32, dampening: f32 },
    /// Bias-corrected first and second moments.
    Adam { beta1: f32, beta2: f32, eps: f32 },
    /// Per-element accumulated squared gradients.
    Adagrad { eps: f32 },
}

impl From<Optimizer> for UpdateRule {
    fn from(optimizer: Optimizer) -> Self {
        match optimizer {
            Optimizer::Sgd => Self::Sgd {
                momentum: SGD_MOMENTUM,
                dampening: SGD_DAMPENING,
            },
            Optimizer::Adam => Self::Adam {
                beta1: ADAM_BETA1,
                beta2: ADAM_BETA2,
                eps: ADAM_EPS,
            },
            Optimizer::Adagrad => Self::Adagrad { eps: ADAGRAD_EPS },
        }
    }
}

/// Update rule plus its running state for one parameter tensor.
#[derive(Debug, Clone)]
pub struct GroupOptimizer {
    rule: UpdateRule,
    weight_decay: f32,
    steps: u64,
    first: ArrayD<f32>,
    second: ArrayD<f32>,
}

impl GroupOptimizer {
    pub fn new(rule: UpdateRule, weight_decay: f32, shape: &[usize]) -> Self {
        Self {
            rule,
            weight_decay,
            steps: 0,
            first: ArrayD::zeros(IxDyn(shape)),
            second: ArrayD::zeros(IxDyn(shape)),
        }
    }

    /// Number of updates applied so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Apply one update to `param` in place.
    pub fn update(
        &mut self,
        param: ArrayViewMutD<f32>,
        grad: ArrayViewD<f32>,
        lr: f64,
    ) -> Result<(), ModelError> {
        for (context, shape) in [("gradient", grad.shape()), ("optimizer state", self.first.shape())] {
            if shape != param.shape() {
                return Err(ModelError::ShapeMismatch {
                    context,
                    expected: param.shape().to_vec(),
                    actual: shape.to_vec(),
                });
            }
        }

        let lr = lr as f32;
        let wd = self.weight_decay;
        match self.rule {
            UpdateRule::Sgd { momentum, dampening } => {
                let first_step = self.steps == 0;
                Zip::from(param)
                    .and(&grad)
                    .and(&mut self.first)
                    .for_each(|p, &g, buf| {
                        let g = g + wd * *p;
                        *buf = if first_step {
                            g
                        } else {
                            momentum * *buf + (1.0 - dampening) * g
                        };
                        *p -= lr * *buf;
                    });
            }
            UpdateRule::Adam { beta1, beta2, eps } => {
                let t = (self.steps + 1) as f32;
                let bias1 = 1.0 - beta1.powf(t);
                let bias2 = 1.0 - beta2.powf(t);
                Zip::from(param)
                    .and(&grad)
                    .and(&mut self.first)
                    .and(&mut self.second)
                    .for_each(|p, &g, m, v| {
                        let g = g + wd * *p;
                        *m = beta1 * *m + (1.0 - beta1) * g;
                        *v = beta2 * *v + (1.0 - beta2) * g * g;
                        *p -= lr * (*m / bias1) / ((*v / bias2).sqrt() + eps);
                    });
            }
            UpdateRule::Adagrad { eps } => {
                Zip::from(param)
                    .and(&grad)
                    .and(&mut self.second)
                    .for_each(|p, &g, sum| {
                        let g = g + wd * *p;
                        *sum += g * g;
                        *p -= lr * g / (sum.sqrt() + eps);
                    });
            }
        }
        self.steps += 1;
        Ok(())
    }
}
