//! Image decoding — grayscale conversion, bilinear resize, [-1, 1] normalization.

use crate::error::DataError;
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array2;
use std::path::Path;

/// Map an 8-bit intensity to [-1, 1] via `(p / 255 - 0.5) / 0.5`.
pub fn normalize_pixel(p: u8) -> f32 {
    (p as f32 / 255.0 - 0.5) / 0.5
}

/// Resize a luma image to `size x size` and flatten it row-major into
/// normalized values.
pub fn face_from_luma(gray: &GrayImage, size: u32) -> Vec<f32> {
    let resized = if gray.width() == size && gray.height() == size {
        gray.clone()
    } else {
        imageops::resize(gray, size, size, FilterType::Triangle)
    };
    resized.as_raw().iter().map(|&p| normalize_pixel(p)).collect()
}

/// Decode one face image into a flat `size * size` row.
pub fn load_face(path: &Path, size: u32) -> Result<Vec<f32>, DataError> {
    if size == 0 {
        return Err(DataError::ZeroImageSize);
    }
    let img = image::open(path).map_err(|source| DataError::Image {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(face_from_luma(&img.to_luma8(), size))
}

/// Decode several images into one `(n, size * size)` matrix, in order.
pub fn load_faces<'a, I>(paths: I, size: u32) -> Result<Array2<f32>, DataError>
where
    I: IntoIterator<Item = &'a Path>,
{
    if size == 0 {
        return Err(DataError::ZeroImageSize);
    }
    let width = size as usize * size as usize;
    let mut flat = Vec::new();
    let mut rows = 0usize;
    for path in paths {
        flat.extend(load_face(path, size)?);
        rows += 1;
    }
    Ok(Array2::from_shape_vec((rows, width), flat)?)
}
