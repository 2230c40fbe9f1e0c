//! Identity-folder training sets and seeded random triplet generation.
//!
//! Layout: `root/<identity>/<image>.{jpg,jpeg,png}`. Identities and images
//! are sorted by name so a seed reproduces the same triplets on any machine.

use crate::error::{io_error, DataError};
use crate::image_io::load_faces;
use facetrain_core::TripletSet;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// One identity and its images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaceClass {
    pub name: String,
    pub images: Vec<PathBuf>,
}

/// All identities of a training set, in name order. Class labels are indices
/// into this list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassIndex {
    classes: Vec<FaceClass>,
}

impl ClassIndex {
    /// Scan `root` for identity subdirectories. Directories without any
    /// image are left out.
    pub fn scan(root: &Path) -> Result<Self, DataError> {
        let mut dirs: Vec<PathBuf> = std::fs::read_dir(root)
            .map_err(io_error(root))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();

        let mut classes = Vec::with_capacity(dirs.len());
        for dir in dirs {
            let mut images: Vec<PathBuf> = std::fs::read_dir(&dir)
                .map_err(io_error(&dir))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && is_image(p))
                .collect();
            if images.is_empty() {
                tracing::debug!(dir = %dir.display(), "identity directory has no images, skipping");
                continue;
            }
            images.sort();
            let name = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            classes.push(FaceClass { name, images });
        }

        let index = Self { classes };
        tracing::info!(
            root = %root.display(),
            identities = index.len(),
            images = index.image_count(),
            "scanned training set"
        );
        Ok(index)
    }

    /// Build an index from already known classes. Classes without images are
    /// dropped and the rest sorted by name.
    pub fn from_classes(mut classes: Vec<FaceClass>) -> Self {
        classes.retain(|c| !c.images.is_empty());
        classes.sort_by(|a, b| a.name.cmp(&b.name));
        Self { classes }
    }

    pub fn classes(&self) -> &[FaceClass] {
        &self.classes
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn image_count(&self) -> usize {
        self.classes.iter().map(|c| c.images.len()).sum()
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.iter().any(|x| e.eq_ignore_ascii_case(x)))
        .unwrap_or(false)
}

/// Image paths and class labels of one training triplet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceTriplet {
    pub anchor: PathBuf,
    pub positive: PathBuf,
    pub negative: PathBuf,
    pub positive_class: u32,
    pub negative_class: u32,
}

/// Draw `n` triplets. The anchor and positive are two distinct images of one
/// identity, the negative is any image of a different identity.
pub fn generate_triplets(index: &ClassIndex, n: usize, seed: u64) -> Result<Vec<FaceTriplet>, DataError> {
    let classes = index.classes();
    if classes.len() < 2 {
        return Err(DataError::NotEnoughClasses(classes.len()));
    }
    let eligible: Vec<usize> = (0..classes.len())
        .filter(|&c| classes[c].images.len() >= 2)
        .collect();
    if eligible.is_empty() {
        return Err(DataError::NoPositiveClass);
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut triplets = Vec::with_capacity(n);
    for _ in 0..n {
        let pos_class = eligible[rng.gen_range(0..eligible.len())];
        let mut neg_class = rng.gen_range(0..classes.len() - 1);
        if neg_class >= pos_class {
            neg_class += 1;
        }

        let pos_images = &classes[pos_class].images;
        let a = rng.gen_range(0..pos_images.len());
        let mut p = rng.gen_range(0..pos_images.len() - 1);
        if p >= a {
            p += 1;
        }
        let neg_images = &classes[neg_class].images;
        let ni = rng.gen_range(0..neg_images.len());

        triplets.push(FaceTriplet {
            anchor: pos_images[a].clone(),
            positive: pos_images[p].clone(),
            negative: neg_images[ni].clone(),
            positive_class: pos_class as u32,
            negative_class: neg_class as u32,
        });
    }
    tracing::debug!(n, seed, "generated triplets");
    Ok(triplets)
}

/// Decoded inputs of one batch of triplets, plus their class labels.
#[derive(Debug, Clone)]
pub struct TripletInputs {
    pub inputs: TripletSet,
    pub positive_labels: Vec<u32>,
    pub negative_labels: Vec<u32>,
}

impl TripletInputs {
    pub fn len(&self) -> usize {
        self.positive_labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positive_labels.is_empty()
    }
}

/// A fixed list of triplets that decodes images lazily, one batch at a time.
#[derive(Debug, Clone)]
pub struct TripletFaceDataset {
    triplets: Vec<FaceTriplet>,
    image_size: u32,
}

impl TripletFaceDataset {
    pub fn new(triplets: Vec<FaceTriplet>, image_size: u32) -> Result<Self, DataError> {
        if image_size == 0 {
            return Err(DataError::ZeroImageSize);
        }
        Ok(Self { triplets, image_size })
    }

    /// Scan `root` and draw `n` triplets from it.
    pub fn from_root(root: &Path, n: usize, seed: u64, image_size: u32) -> Result<Self, DataError> {
        let index = ClassIndex::scan(root)?;
        Self::new(generate_triplets(&index, n, seed)?, image_size)
    }

    pub fn triplets(&self) -> &[FaceTriplet] {
        &self.triplets
    }

    pub fn len(&self) -> usize {
        self.triplets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triplets.is_empty()
    }

    pub fn image_size(&self) -> u32 {
        self.image_size
    }

    /// Number of batches `batches(batch_size)` yields.
    pub fn batch_count(&self, batch_size: usize) -> usize {
        if batch_size == 0 {
            0
        } else {
            self.triplets.len().div_ceil(batch_size)
        }
    }

    /// Iterate over consecutive batches in triplet order. The last batch may
    /// be short.
    pub fn batches(&self, batch_size: usize) -> Result<TripletBatches<'_>, DataError> {
        if batch_size == 0 {
            return Err(DataError::ZeroBatchSize);
        }
        Ok(TripletBatches {
            chunks: self.triplets.chunks(batch_size),
            image_size: self.image_size,
        })
    }
}

pub struct TripletBatches<'a> {
    chunks: std::slice::Chunks<'a, FaceTriplet>,
    image_size: u32,
}

impl TripletBatches<'_> {
    fn decode(chunk: &[FaceTriplet], size: u32) -> Result<TripletInputs, DataError> {
        let anchor = load_faces(chunk.iter().map(|t| t.anchor.as_path()), size)?;
        let positive = load_faces(chunk.iter().map(|t| t.positive.as_path()), size)?;
        let negative = load_faces(chunk.iter().map(|t| t.negative.as_path()), size)?;
        Ok(TripletInputs {
            inputs: TripletSet::new(anchor, positive, negative)?,
            positive_labels: chunk.iter().map(|t| t.positive_class).collect(),
            negative_labels: chunk.iter().map(|t| t.negative_class).collect(),
        })
    }
}

impl Iterator for TripletBatches<'_> {
    type Item = Result<TripletInputs, DataError>;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = self.chunks.next()?;
        Some(Self::decode(chunk, self.image_size))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.chunks.size_hint()
    }
}
