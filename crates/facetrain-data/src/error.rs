use facetrain_core::CoreError;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to decode image {path}: {source}")]
    Image {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("need at least two identities with images, found {0}")]
    NotEnoughClasses(usize),
    #[error("no identity has two or more images")]
    NoPositiveClass,
    #[error("pairs file line {line}: {message}")]
    PairsFormat { line: usize, message: String },
    #[error("batch size must be positive")]
    ZeroBatchSize,
    #[error("image size must be positive")]
    ZeroImageSize,
    #[error("face matrix shape: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Attach `path` to an io error.
pub(crate) fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> DataError {
    let path = path.to_path_buf();
    move |source| DataError::Io { path, source }
}
