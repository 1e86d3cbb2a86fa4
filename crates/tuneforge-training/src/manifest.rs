use crate::checkpoint::CheckpointRecord;
use crate::config::RunConfig;
use crate::dataset::DatasetId;
use crate::error::{RunError, TrainingError, TrainingResult};
use crate::state::{RunId, RunPhase};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Record of a finished run, written to `run_manifest.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub phase: RunPhase,
    pub config: RunConfig,
    /// Content hash of the records the run trained on.
    pub dataset_id: DatasetId,
    pub checkpoints: Vec<CheckpointRecord>,
    #[serde(default)]
    pub loss_history: Vec<f64>,
    pub best_loss: Option<f64>,
    pub error: Option<RunError>,
}

impl RunManifest {
    pub fn read(path: &Path) -> TrainingResult<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn write(&self, path: &Path) -> TrainingResult<()> {
        write_json(path, self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedFile {
    /// Relative to the export directory.
    pub path: PathBuf,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportManifest {
    pub created_at: DateTime<Utc>,
    pub source: PathBuf,
    pub files: Vec<ExportedFile>,
}

pub fn sha256_file(path: &Path) -> TrainingResult<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

pub fn hash_file(root: &Path, path: &Path) -> TrainingResult<ExportedFile> {
    if !path.is_file() {
        return Err(TrainingError::Artifact(format!("artifact path does not exist: {}", path.display())));
    }
    let relative = path.strip_prefix(root).unwrap_or(path).to_path_buf();
    Ok(ExportedFile { path: relative, sha256: sha256_file(path)? })
}

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> TrainingResult<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    std::fs::write(path, bytes)?;
    Ok(())
}
