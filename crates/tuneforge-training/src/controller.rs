//! Epoch loop controller.
//!
//! Drives one run from `Idle` to a terminal phase on the worker task: load
//! resources, iterate epochs, checkpoint, apply early stopping and honor the
//! cooperative signals between epochs.

use crate::backend::{EpochParams, EpochStats, ModelBackend};
use crate::checkpoint::CheckpointManager;
use crate::config::RunConfig;
use crate::dataset::Dataset;
use crate::error::{BackendError, RunError};
use crate::layout::RunLayout;
use crate::loader::{load_resources, LoadOutcome, LoadedResources};
use crate::manifest::RunManifest;
use crate::observer::{Observer, RunEvent, RunSummary};
use crate::signal::{HoldRelease, SignalListener};
use crate::state::{EpochResult, RunId, RunPhase, SharedRunState};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// How the loop left.
#[derive(Debug)]
enum Exit {
    Completed,
    EarlyStopped,
    Cancelled,
    Failed(RunError),
}

pub struct EpochLoopController<B: ModelBackend> {
    backend: Arc<B>,
    config: Arc<RunConfig>,
    dataset: Arc<Dataset>,
    state: SharedRunState,
    observer: Arc<dyn Observer>,
    signal: SignalListener,
    run_id: RunId,
}

impl<B: ModelBackend> EpochLoopController<B> {
    pub fn new(
        backend: Arc<B>,
        config: Arc<RunConfig>,
        dataset: Arc<Dataset>,
        state: SharedRunState,
        observer: Arc<dyn Observer>,
        signal: SignalListener,
    ) -> Self {
        let run_id = state.snapshot().run_id;
        Self { backend, config, dataset, state, observer, signal, run_id }
    }

    /// Runs to a terminal phase and returns the summary.
    pub async fn run(mut self) -> RunSummary {
        let started_at = Utc::now();
        let mut checkpoints = CheckpointManager::new(RunLayout::new(&self.config.output_dir));

        let exit = self.drive(&mut checkpoints).await;
        self.finish(exit, &checkpoints, started_at)
    }

    async fn drive(&mut self, checkpoints: &mut CheckpointManager) -> Exit {
        self.advance(RunPhase::Loading);

        if let Err(e) = checkpoints.layout().ensure_dirs() {
            return Exit::Failed(RunError::storage(format!(
                "cannot create output directory {}: {e}",
                checkpoints.layout().root().display()
            )));
        }

        let resources =
            match load_resources(self.backend.as_ref(), &self.config, &self.run_id, self.observer.as_ref(), &self.signal)
                .await
            {
                LoadOutcome::Loaded(resources) => resources,
                LoadOutcome::Cancelled => return Exit::Cancelled,
                LoadOutcome::Failed(err) => return Exit::Failed(err),
            };
        let LoadedResources { mut model, tokenizer, attempts } = resources;
        debug!(run_id = %self.run_id, attempts, "Resources ready");

        self.advance(RunPhase::Training);

        let total_epochs = self.config.hyperparams.epochs;
        for epoch in 1..=total_epochs {
            if self.signal.is_cancelled() {
                return Exit::Cancelled;
            }
            if self.signal.is_held() {
                self.advance(RunPhase::Paused);
                match self.signal.wait_while_held().await {
                    HoldRelease::Resumed => self.advance(RunPhase::Training),
                    HoldRelease::Cancelled => return Exit::Cancelled,
                }
            }

            self.state.update(|s| s.begin_epoch(epoch));
            let params = EpochParams::for_epoch(&self.config, epoch);
            let started = Instant::now();

            let stats = match self.backend.train_epoch(&mut model, &self.dataset, &params).await {
                Ok(stats) => stats,
                Err(err) => return Exit::Failed(RunError::backend(Some(epoch), err)),
            };
            let loss = match checked_loss(stats) {
                Ok(loss) => loss,
                Err(err) => return Exit::Failed(RunError::backend(Some(epoch), err)),
            };

            let result = EpochResult {
                epoch,
                loss,
                learning_rate: stats.learning_rate.unwrap_or(params.learning_rate),
                duration: started.elapsed(),
            };
            let progress_percent = self.state.update(|s| {
                s.complete_epoch(&result);
                s.progress_percent
            });
            self.observer.on_event(RunEvent::EpochSample {
                run_id: self.run_id.clone(),
                epoch,
                total_epochs,
                loss,
                learning_rate: result.learning_rate,
                progress_percent,
            });

            let (record, improved) =
                match checkpoints.record_epoch(self.backend.as_ref(), &model, &tokenizer, epoch, loss).await {
                    Ok(saved) => saved,
                    Err(err) => return Exit::Failed(RunError::backend(Some(epoch), err)),
                };
            self.observer.on_event(RunEvent::CheckpointSaved { run_id: self.run_id.clone(), record });

            let patience_exhausted = self.state.update(|s| s.record_improvement(loss, improved));
            // A stop requested during this epoch wins over early stopping and completion.
            if self.signal.is_cancelled() {
                return Exit::Cancelled;
            }
            if patience_exhausted {
                info!(run_id = %self.run_id, epoch, "No improvement within patience window, stopping early");
                return Exit::EarlyStopped;
            }
        }

        Exit::Completed
    }

    fn finish(&self, exit: Exit, checkpoints: &CheckpointManager, started_at: DateTime<Utc>) -> RunSummary {
        match exit {
            Exit::Completed => self.advance(RunPhase::Completed),
            Exit::EarlyStopped => self.advance(RunPhase::EarlyStopped),
            Exit::Cancelled => {
                self.advance(RunPhase::Stopping);
                self.advance(RunPhase::Cancelled);
            }
            Exit::Failed(err) => {
                warn!(run_id = %self.run_id, error = %err, "Run failed");
                if let Ok(from) = self.state.update(|s| s.fail(err)) {
                    self.emit_phase(from, RunPhase::Failed);
                }
            }
        }

        let state = self.state.snapshot();
        let manifest = RunManifest {
            run_id: state.run_id.clone(),
            started_at,
            finished_at: Utc::now(),
            phase: state.phase,
            config: self.config.as_ref().clone(),
            dataset_id: self.dataset.id().clone(),
            checkpoints: checkpoints.records().to_vec(),
            loss_history: state.loss_history.clone(),
            best_loss: state.best_loss,
            error: state.error.clone(),
        };
        let manifest_path = checkpoints.layout().manifest_path();
        if checkpoints.layout().root().is_dir()
            && let Err(e) = manifest.write(&manifest_path)
        {
            warn!(run_id = %self.run_id, path = %manifest_path.display(), error = %e, "Failed to write run manifest");
        }

        let summary = RunSummary {
            run_id: state.run_id,
            phase: state.phase,
            epochs_completed: u32::try_from(state.loss_history.len()).unwrap_or(u32::MAX),
            best_loss: state.best_loss,
            best_checkpoint: checkpoints.best_path(),
            error: state.error,
        };
        self.observer.on_event(RunEvent::Finished { summary: summary.clone() });
        summary
    }

    fn advance(&self, to: RunPhase) {
        // Rejections are logged by `RunState::transition`.
        if let Ok(from) = self.state.update(|s| s.transition(to)) {
            self.emit_phase(from, to);
        }
    }

    fn emit_phase(&self, from: RunPhase, to: RunPhase) {
        self.observer.on_event(RunEvent::PhaseChanged { run_id: self.run_id.clone(), from, to });
    }
}

fn checked_loss(stats: EpochStats) -> Result<f64, BackendError> {
    if stats.loss.is_finite() && stats.loss >= 0.0 {
        Ok(stats.loss)
    } else {
        Err(BackendError::InvalidLoss(stats.loss.to_string()))
    }
}
