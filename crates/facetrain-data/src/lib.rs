//! facetrain-data — Face image sources for training and verification.
//!
//! Reads identity-per-folder training sets into seeded random triplets and
//! LFW `pairs.txt` protocols into labeled image pairs. Images are decoded to
//! normalized grayscale rows ready for an embedder.

pub mod error;
pub mod image_io;
pub mod lfw;
pub mod triplets;

pub use error::DataError;
pub use image_io::{load_face, load_faces, normalize_pixel};
pub use lfw::{parse_pairs, LfwPair, LfwPairs, PairInputs};
pub use triplets::{generate_triplets, ClassIndex, FaceClass, FaceTriplet, TripletFaceDataset, TripletInputs};
