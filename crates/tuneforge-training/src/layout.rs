use crate::error::TrainingResult;
use std::path::{Path, PathBuf};

/// Filesystem layout of a run's output directory.
///
/// ```text
/// <output>/epoch_<n>/            per-epoch checkpoint
/// <output>/best_model/           best checkpoint so far
/// <output>/run_manifest.json     written when the run ends
/// <output>/exported_model/       export target (config.json + weights)
/// ```
#[derive(Debug, Clone)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn epoch_dir(&self, epoch: u32) -> PathBuf {
        self.root.join(format!("epoch_{epoch}"))
    }

    #[must_use]
    pub fn best_dir(&self) -> PathBuf {
        self.root.join("best_model")
    }

    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("run_manifest.json")
    }

    #[must_use]
    pub fn export_dir(&self) -> PathBuf {
        self.root.join("exported_model")
    }

    /// Epoch checkpoints present on disk, sorted by epoch.
    pub fn existing_epochs(&self) -> TrainingResult<Vec<(u32, PathBuf)>> {
        let mut out = Vec::new();
        let dir = match std::fs::read_dir(&self.root) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };

        for entry in dir {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let epoch = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("epoch_"))
                .and_then(|n| n.parse::<u32>().ok());
            if let Some(epoch) = epoch {
                out.push((epoch, path));
            }
        }

        out.sort_by_key(|(epoch, _)| *epoch);
        Ok(out)
    }

    pub fn ensure_dirs(&self) -> TrainingResult<()> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }
}
