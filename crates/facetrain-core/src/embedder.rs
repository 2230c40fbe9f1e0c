//! Embedding model seam, with an ONNX Runtime implementation.
//!
//! Inputs are flattened square grayscale face crops, one row per image, already
//! normalized to [-1, 1]. Outputs are one embedding row per input row.

use ndarray::{Array2, Array4, ArrayView2};
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("input rows have {actual} values, expected {expected}")]
    InputShape { expected: usize, actual: usize },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Maps a batch of images to a batch of embeddings.
pub trait Embedder {
    /// Dimension of every produced embedding row.
    fn embedding_dim(&self) -> usize;

    /// Embed each input row.
    fn embed(&mut self, inputs: ArrayView2<f32>) -> Result<Array2<f32>, EmbedderError>;
}

/// Forward-only embedder backed by an exported ONNX model (NCHW, 3 channels).
pub struct OnnxEmbedder {
    session: Session,
    input_size: usize,
    embedding_dim: usize,
}

impl OnnxEmbedder {
    /// Load a model taking `input_size x input_size` crops and producing
    /// `embedding_dim`-dimensional embeddings.
    pub fn load(model_path: &str, input_size: usize, embedding_dim: usize) -> Result<Self, EmbedderError> {
        if !Path::new(model_path).exists() {
            return Err(EmbedderError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            input_size,
            embedding_dim,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ONNX embedding model"
        );

        Ok(Self {
            session,
            input_size,
            embedding_dim,
        })
    }

    /// Reshape flattened gray rows into an NCHW tensor, replicating the gray
    /// channel into R, G and B.
    fn to_nchw(inputs: ArrayView2<f32>, size: usize) -> Result<Array4<f32>, EmbedderError> {
        if inputs.ncols() != size * size {
            return Err(EmbedderError::InputShape {
                expected: size * size,
                actual: inputs.ncols(),
            });
        }
        let n = inputs.nrows();
        let mut tensor = Array4::<f32>::zeros((n, 3, size, size));
        for (b, row) in inputs.rows().into_iter().enumerate() {
            for y in 0..size {
                for x in 0..size {
                    let v = row[y * size + x];
                    tensor[[b, 0, y, x]] = v;
                    tensor[[b, 1, y, x]] = v;
                    tensor[[b, 2, y, x]] = v;
                }
            }
        }
        Ok(tensor)
    }
}

impl Embedder for OnnxEmbedder {
    fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    fn embed(&mut self, inputs: ArrayView2<f32>) -> Result<Array2<f32>, EmbedderError> {
        let n = inputs.nrows();
        if n == 0 {
            return Ok(Array2::zeros((0, self.embedding_dim)));
        }
        let tensor = Self::to_nchw(inputs, self.input_size)?;

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(tensor.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != n * self.embedding_dim {
            return Err(EmbedderError::InferenceFailed(format!(
                "expected {n}x{} embeddings, got {} values",
                self.embedding_dim,
                raw.len()
            )));
        }

        Array2::from_shape_vec((n, self.embedding_dim), raw.to_vec())
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding reshape: {e}")))
    }
}
