//! Checkpoint manager.
//!
//! Decides where checkpoints go and whether an epoch improved on the best
//! loss. Writing weights is the backend's job.

use crate::backend::ModelBackend;
use crate::error::BackendError;
use crate::layout::RunLayout;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub epoch: u32,
    pub path: PathBuf,
    pub loss: f64,
    pub is_best: bool,
}

#[derive(Debug)]
pub struct CheckpointManager {
    layout: RunLayout,
    best_loss: Option<f64>,
    records: Vec<CheckpointRecord>,
    best_index: Option<usize>,
}

impl CheckpointManager {
    #[must_use]
    pub fn new(layout: RunLayout) -> Self {
        Self { layout, best_loss: None, records: Vec::new(), best_index: None }
    }

    /// Saves the checkpoints for a finished epoch.
    ///
    /// When `loss` is strictly below the best so far the model is first saved
    /// to the best location. The epoch snapshot is always saved. Returns the
    /// epoch record and whether it improved.
    pub async fn record_epoch<B: ModelBackend>(
        &mut self,
        backend: &B,
        model: &B::Model,
        tokenizer: &B::Tokenizer,
        epoch: u32,
        loss: f64,
    ) -> Result<(CheckpointRecord, bool), BackendError> {
        let improved = self.best_loss.is_none_or(|best| loss < best);

        if improved {
            let best_dir = self.layout.best_dir();
            backend.save(model, tokenizer, &best_dir).await?;
            info!(epoch, loss, path = %best_dir.display(), "New best model saved");
        }

        let epoch_dir = self.layout.epoch_dir(epoch);
        backend.save(model, tokenizer, &epoch_dir).await?;

        let record = CheckpointRecord { epoch, path: epoch_dir, loss, is_best: improved };
        self.records.push(record.clone());

        if improved {
            if let Some(previous) = self.best_index.and_then(|i| self.records.get_mut(i)) {
                previous.is_best = false;
            }
            self.best_index = Some(self.records.len() - 1);
            self.best_loss = Some(loss);
        }

        Ok((record, improved))
    }

    #[must_use]
    pub fn records(&self) -> &[CheckpointRecord] {
        &self.records
    }

    /// Location of the best checkpoint, once one exists.
    #[must_use]
    pub fn best_path(&self) -> Option<PathBuf> {
        self.best_index.map(|_| self.layout.best_dir())
    }

    #[must_use]
    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }
}
