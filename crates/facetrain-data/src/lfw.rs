//! LFW verification protocol — `pairs.txt` parsing and pair batching.
//!
//! The first line of `pairs.txt` is a header (`folds pairs_per_fold`) and is
//! ignored. Every other non-blank line is one pair:
//!
//! ```text
//! name  i  j            same identity, images i and j
//! name1 i  name2 j      different identities
//! ```
//!
//! Image `i` of `name` lives at `{dir}/{name}/{name}_{i:04}.{ext}`.

use crate::error::{io_error, DataError};
use crate::image_io::load_faces;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// --- Defaults ---
pub const DEFAULT_EXTENSION: &str = "jpg";

/// Two image paths and whether they show the same person.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LfwPair {
    pub left: PathBuf,
    pub right: PathBuf,
    pub same: bool,
}

fn image_path(dir: &Path, name: &str, index: u32, ext: &str) -> PathBuf {
    dir.join(name).join(format!("{name}_{index:04}.{ext}"))
}

fn parse_index(token: &str, line: usize) -> Result<u32, DataError> {
    token.parse().map_err(|_| DataError::PairsFormat {
        line,
        message: format!("image number `{token}` is not a non-negative integer"),
    })
}

/// Parse the text of a `pairs.txt` file. Line numbers in errors are 1-based.
pub fn parse_pairs(text: &str, dir: &Path, ext: &str) -> Result<Vec<LfwPair>, DataError> {
    let mut pairs = Vec::new();
    for (i, raw) in text.lines().enumerate().skip(1) {
        let line = i + 1;
        let tokens: Vec<&str> = raw.split_whitespace().collect();
        let pair = match tokens.as_slice() {
            [] => continue,
            [name, a, b] => LfwPair {
                left: image_path(dir, name, parse_index(a, line)?, ext),
                right: image_path(dir, name, parse_index(b, line)?, ext),
                same: true,
            },
            [name1, a, name2, b] => LfwPair {
                left: image_path(dir, name1, parse_index(a, line)?, ext),
                right: image_path(dir, name2, parse_index(b, line)?, ext),
                same: false,
            },
            other => {
                return Err(DataError::PairsFormat {
                    line,
                    message: format!("expected 3 or 4 fields, found {}", other.len()),
                })
            }
        };
        pairs.push(pair);
    }
    Ok(pairs)
}

/// Labeled pairs whose images all exist on disk.
#[derive(Debug, Clone)]
pub struct LfwPairs {
    pairs: Vec<LfwPair>,
    skipped: usize,
    image_size: u32,
}

/// Decoded images of one batch of pairs.
#[derive(Debug, Clone)]
pub struct PairInputs {
    pub left: Array2<f32>,
    pub right: Array2<f32>,
    pub same: Vec<bool>,
}

impl PairInputs {
    pub fn len(&self) -> usize {
        self.same.len()
    }

    pub fn is_empty(&self) -> bool {
        self.same.is_empty()
    }
}

impl LfwPairs {
    /// Read `pairs_path` and resolve images under `dir`. Pairs with a missing
    /// image are dropped and counted in [`skipped`](Self::skipped).
    pub fn load(dir: &Path, pairs_path: &Path, ext: &str, image_size: u32) -> Result<Self, DataError> {
        let text = std::fs::read_to_string(pairs_path).map_err(io_error(pairs_path))?;
        let parsed = parse_pairs(&text, dir, ext)?;
        let lfw = Self::from_pairs(parsed, image_size)?;
        tracing::info!(
            pairs_file = %pairs_path.display(),
            pairs = lfw.len(),
            skipped = lfw.skipped,
            "loaded LFW pairs"
        );
        Ok(lfw)
    }

    /// Keep the pairs whose two images exist.
    pub fn from_pairs(parsed: Vec<LfwPair>, image_size: u32) -> Result<Self, DataError> {
        if image_size == 0 {
            return Err(DataError::ZeroImageSize);
        }
        let total = parsed.len();
        let pairs: Vec<LfwPair> = parsed
            .into_iter()
            .filter(|p| {
                let missing = [&p.left, &p.right].into_iter().find(|path| !path.is_file());
                if let Some(path) = missing {
                    tracing::warn!(path = %path.display(), "LFW image missing, skipping pair");
                }
                missing.is_none()
            })
            .collect();
        let skipped = total - pairs.len();
        Ok(Self { pairs, skipped, image_size })
    }

    pub fn pairs(&self) -> &[LfwPair] {
        &self.pairs
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Number of pairs dropped because an image was missing.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Iterate over consecutive batches of decoded pairs, in file order.
    pub fn batches(&self, batch_size: usize) -> Result<PairBatches<'_>, DataError> {
        if batch_size == 0 {
            return Err(DataError::ZeroBatchSize);
        }
        Ok(PairBatches {
            chunks: self.pairs.chunks(batch_size),
            image_size: self.image_size,
        })
    }
}

pub struct PairBatches<'a> {
    chunks: std::slice::Chunks<'a, LfwPair>,
    image_size: u32,
}

impl Iterator for PairBatches<'_> {
    type Item = Result<PairInputs, DataError>;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = self.chunks.next()?;
        let size = self.image_size;
        let decode = || -> Result<PairInputs, DataError> {
            Ok(PairInputs {
                left: load_faces(chunk.iter().map(|p| p.left.as_path()), size)?,
                right: load_faces(chunk.iter().map(|p| p.right.as_path()), size)?,
                same: chunk.iter().map(|p| p.same).collect(),
            })
        };
        Some(decode())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.chunks.size_hint()
    }
}
