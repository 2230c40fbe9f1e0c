//! Checkpoints — a JSON record next to an opaque weight blob.
//!
//! `checkpoint_{e}.json` names its `checkpoint_{e}.weights` file and carries
//! the blob's length and SHA-256 so a truncated or swapped blob is caught on
//! resume. The stored `epoch` is the epoch a resumed run starts at.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed checkpoint record {path}: {source}")]
    Record {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("weights {path} are {actual} bytes, record says {expected}")]
    Length {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },
    #[error("weights {path} digest {actual} does not match record {expected}")]
    Digest {
        path: PathBuf,
        expected: String,
        actual: String,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CheckpointError {
    let path = path.to_path_buf();
    move |source| CheckpointError::Io { path, source }
}

/// Contents of `checkpoint_{e}.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Epoch to resume at.
    pub epoch: usize,
    /// Weight blob file name, relative to the record's directory.
    pub weights_file: String,
    pub weights_len: u64,
    pub weights_sha256: String,
    pub saved_at: DateTime<Utc>,
}

/// A verified checkpoint.
#[derive(Debug, Clone)]
pub struct LoadedCheckpoint {
    pub record: CheckpointRecord,
    pub weights: Vec<u8>,
}

/// Outcome of checking a record against its blob without failing.
#[derive(Debug, Clone)]
pub struct CheckpointInspection {
    pub record: CheckpointRecord,
    pub weights_path: PathBuf,
    pub actual_len: Option<u64>,
    pub actual_sha256: Option<String>,
}

impl CheckpointInspection {
    pub fn is_intact(&self) -> bool {
        self.actual_len == Some(self.record.weights_len)
            && self.actual_sha256.as_deref() == Some(self.record.weights_sha256.as_str())
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn record_path(dir: &Path, epoch_index: usize) -> PathBuf {
    dir.join(format!("checkpoint_{epoch_index}.json"))
}

/// Write `checkpoint_{epoch_index}.weights` then `checkpoint_{epoch_index}.json`
/// into `dir`. Returns the record path.
pub fn save(dir: &Path, epoch_index: usize, resume_epoch: usize, weights: &[u8]) -> Result<PathBuf, CheckpointError> {
    let weights_file = format!("checkpoint_{epoch_index}.weights");
    let weights_path = dir.join(&weights_file);
    std::fs::write(&weights_path, weights).map_err(io_error(&weights_path))?;

    let record = CheckpointRecord {
        epoch: resume_epoch,
        weights_file,
        weights_len: weights.len() as u64,
        weights_sha256: sha256_hex(weights),
        saved_at: Utc::now(),
    };
    let path = record_path(dir, epoch_index);
    let json = serde_json::to_string_pretty(&record).map_err(|source| CheckpointError::Record {
        path: path.clone(),
        source,
    })?;
    std::fs::write(&path, json).map_err(io_error(&path))?;

    tracing::info!(
        path = %path.display(),
        epoch = resume_epoch,
        bytes = weights.len(),
        "checkpoint saved"
    );
    Ok(path)
}

fn read_record(path: &Path) -> Result<CheckpointRecord, CheckpointError> {
    let text = std::fs::read_to_string(path).map_err(io_error(path))?;
    serde_json::from_str(&text).map_err(|source| CheckpointError::Record {
        path: path.to_path_buf(),
        source,
    })
}

fn weights_path(record_path: &Path, record: &CheckpointRecord) -> PathBuf {
    record_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(&record.weights_file)
}

/// Read a record and its blob, rejecting any length or digest mismatch.
pub fn load(path: &Path) -> Result<LoadedCheckpoint, CheckpointError> {
    let record = read_record(path)?;
    let blob_path = weights_path(path, &record);
    let weights = std::fs::read(&blob_path).map_err(io_error(&blob_path))?;

    let actual = weights.len() as u64;
    if actual != record.weights_len {
        return Err(CheckpointError::Length {
            path: blob_path,
            expected: record.weights_len,
            actual,
        });
    }
    let digest = sha256_hex(&weights);
    if digest != record.weights_sha256 {
        return Err(CheckpointError::Digest {
            path: blob_path,
            expected: record.weights_sha256,
            actual: digest,
        });
    }
    Ok(LoadedCheckpoint { record, weights })
}

/// Load the checkpoint at `path`, or `Ok(None)` with a warning when no file
/// exists there so the run starts fresh.
pub fn resume(path: &Path) -> Result<Option<LoadedCheckpoint>, CheckpointError> {
    if !path.is_file() {
        tracing::warn!(path = %path.display(), "no checkpoint found, starting from fresh weights");
        return Ok(None);
    }
    let loaded = load(path)?;
    tracing::info!(
        path = %path.display(),
        epoch = loaded.record.epoch,
        saved_at = %loaded.record.saved_at,
        "resuming from checkpoint"
    );
    Ok(Some(loaded))
}

/// Read a record and report what its blob actually contains.
pub fn inspect(path: &Path) -> Result<CheckpointInspection, CheckpointError> {
    let record = read_record(path)?;
    let weights_path = weights_path(path, &record);
    let blob = std::fs::read(&weights_path).ok();
    Ok(CheckpointInspection {
        actual_len: blob.as_ref().map(|b| b.len() as u64),
        actual_sha256: blob.as_deref().map(sha256_hex),
        record,
        weights_path,
    })
}
