//! Trainable embedders.
//!
//! [`LinearEmbedder`] maps a flattened face crop to `x · W + b`. Its weight
//! blob is a little-endian `(in_dim: u32, dim: u32)` header followed by `W`
//! (row-major) and `b`, all as `f32`.

use crate::optim::{GroupOptimizer, UpdateRule};
use facetrain_core::{Embedder, EmbedderError};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

const HEADER_LEN: usize = 8;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("expected {expected} learning rates, got {actual}")]
    LearningRates { expected: usize, actual: usize },
    #[error("malformed weight blob: {0}")]
    Blob(String),
    #[error("invalid model: {0}")]
    Invalid(String),
}

/// `(in_dim, dim)` from the blob header.
fn blob_header(blob: &[u8]) -> Result<(usize, usize), ModelError> {
    let read_u32 = |at: usize| -> Option<u32> {
        let bytes: [u8; 4] = blob.get(at..at + 4)?.try_into().ok()?;
        Some(u32::from_le_bytes(bytes))
    };
    match (read_u32(0), read_u32(4)) {
        (Some(in_dim), Some(dim)) => Ok((in_dim as usize, dim as usize)),
        _ => Err(ModelError::Blob(format!(
            "{} bytes is shorter than the header",
            blob.len()
        ))),
    }
}

/// An embedder whose parameters can be updated from embedding gradients.
pub trait TrainableEmbedder: Embedder {
    /// Number of independently scheduled parameter groups.
    fn param_groups(&self) -> usize;

    /// Backpropagate `embedding_grads` (one row per input row) and update
    /// every group with its learning rate.
    fn apply_gradients(
        &mut self,
        inputs: ArrayView2<f32>,
        embedding_grads: ArrayView2<f32>,
        learning_rates: &[f64],
    ) -> Result<(), ModelError>;

    fn to_weights(&self) -> Vec<u8>;

    fn load_weights(&mut self, blob: &[u8]) -> Result<(), ModelError>;
}

pub struct LinearEmbedder {
    weight: Array2<f32>,
    bias: Array1<f32>,
    weight_opt: GroupOptimizer,
    bias_opt: GroupOptimizer,
}

impl LinearEmbedder {
    /// Uniform init in `±1/sqrt(in_dim)`, reproducible for a seed.
    pub fn new(
        in_dim: usize,
        dim: usize,
        seed: u64,
        rule: UpdateRule,
        weight_decay: f32,
    ) -> Result<Self, ModelError> {
        if in_dim == 0 || dim == 0 {
            return Err(ModelError::Invalid(format!(
                "dimensions must be positive, got {in_dim}x{dim}"
            )));
        }
        if in_dim > u32::MAX as usize || dim > u32::MAX as usize {
            return Err(ModelError::Invalid(format!("dimensions {in_dim}x{dim} exceed u32")));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let bound = 1.0 / (in_dim as f32).sqrt();
        let weight = Array2::from_shape_fn((in_dim, dim), |_| rng.gen_range(-bound..bound));
        let bias = Array1::from_shape_fn(dim, |_| rng.gen_range(-bound..bound));
        tracing::debug!(in_dim, dim, seed, ?rule, "initialized linear embedder");
        Ok(Self {
            weight,
            bias,
            weight_opt: GroupOptimizer::new(rule, weight_decay, &[in_dim, dim]),
            bias_opt: GroupOptimizer::new(rule, weight_decay, &[dim]),
        })
    }

    /// Rebuild a model from a weight blob alone, taking its shape from the
    /// blob header.
    pub fn from_weights(blob: &[u8], rule: UpdateRule, weight_decay: f32) -> Result<Self, ModelError> {
        let (in_dim, dim) = blob_header(blob)?;
        let mut model = Self::new(in_dim, dim, 0, rule, weight_decay)?;
        model.load_weights(blob)?;
        Ok(model)
    }

    pub fn in_dim(&self) -> usize {
        self.weight.nrows()
    }

    pub fn weight(&self) -> &Array2<f32> {
        &self.weight
    }

    pub fn bias(&self) -> &Array1<f32> {
        &self.bias
    }

    /// `(dL/dW, dL/db)` for the given inputs and embedding gradients.
    pub fn gradients(
        &self,
        inputs: ArrayView2<f32>,
        embedding_grads: ArrayView2<f32>,
    ) -> Result<(Array2<f32>, Array1<f32>), ModelError> {
        let expected = vec![inputs.nrows(), self.weight.ncols()];
        if inputs.ncols() != self.in_dim() {
            return Err(ModelError::ShapeMismatch {
                context: "inputs",
                expected: vec![inputs.nrows(), self.in_dim()],
                actual: inputs.shape().to_vec(),
            });
        }
        if embedding_grads.shape() != expected.as_slice() {
            return Err(ModelError::ShapeMismatch {
                context: "embedding gradients",
                expected,
                actual: embedding_grads.shape().to_vec(),
            });
        }
        Ok((inputs.t().dot(&embedding_grads), embedding_grads.sum_axis(Axis(0))))
    }
}

impl Embedder for LinearEmbedder {
    fn embedding_dim(&self) -> usize {
        self.weight.ncols()
    }

    fn embed(&mut self, inputs: ArrayView2<f32>) -> Result<Array2<f32>, EmbedderError> {
        if inputs.ncols() != self.in_dim() {
            return Err(EmbedderError::InputShape {
                expected: self.in_dim(),
                actual: inputs.ncols(),
            });
        }
        Ok(inputs.dot(&self.weight) + &self.bias)
    }
}

impl TrainableEmbedder for LinearEmbedder {
    fn param_groups(&self) -> usize {
        2
    }

    fn apply_gradients(
        &mut self,
        inputs: ArrayView2<f32>,
        embedding_grads: ArrayView2<f32>,
        learning_rates: &[f64],
    ) -> Result<(), ModelError> {
        let &[weight_lr, bias_lr] = learning_rates else {
            return Err(ModelError::LearningRates {
                expected: self.param_groups(),
                actual: learning_rates.len(),
            });
        };
        let (dw, db) = self.gradients(inputs, embedding_grads)?;
        self.weight_opt
            .update(self.weight.view_mut().into_dyn(), dw.view().into_dyn(), weight_lr)?;
        self.bias_opt
            .update(self.bias.view_mut().into_dyn(), db.view().into_dyn(), bias_lr)?;
        Ok(())
    }

    fn to_weights(&self) -> Vec<u8> {
        let mut blob = Vec::with_capacity(HEADER_LEN + 4 * (self.weight.len() + self.bias.len()));
        blob.extend_from_slice(&(self.in_dim() as u32).to_le_bytes());
        blob.extend_from_slice(&(self.embedding_dim() as u32).to_le_bytes());
        for v in self.weight.iter().chain(self.bias.iter()) {
            blob.extend_from_slice(&v.to_le_bytes());
        }
        blob
    }

    fn load_weights(&mut self, blob: &[u8]) -> Result<(), ModelError> {
        let (in_dim, dim) = blob_header(blob)?;
        if (in_dim, dim) != (self.in_dim(), self.embedding_dim()) {
            return Err(ModelError::ShapeMismatch {
                context: "weight blob",
                expected: vec![self.in_dim(), self.embedding_dim()],
                actual: vec![in_dim, dim],
            });
        }

        let expected_len = HEADER_LEN + 4 * (in_dim * dim + dim);
        if blob.len() != expected_len {
            return Err(ModelError::Blob(format!(
                "expected {expected_len} bytes for {in_dim}x{dim}, got {}",
                blob.len()
            )));
        }
        let values: Vec<f32> = blob[HEADER_LEN..]
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let (w, b) = values.split_at(in_dim * dim);
        self.weight = Array2::from_shape_vec((in_dim, dim), w.to_vec())
            .map_err(|e| ModelError::Blob(e.to_string()))?;
        self.bias = Array1::from(b.to_vec());
        Ok(())
    }
}
