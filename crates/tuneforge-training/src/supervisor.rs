//! Run supervisor: owns the lifecycle of at most one active run.

use crate::backend::ModelBackend;
use crate::config::RunConfig;
use crate::controller::EpochLoopController;
use crate::dataset::Dataset;
use crate::error::{TrainingError, TrainingResult};
use crate::observer::{BroadcastObserver, Observer, ObserverSet, RunEvent, RunSummary, TracingObserver};
use crate::signal::RunSignal;
use crate::state::{RunId, RunState, SharedRunState};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

struct ActiveRun {
    run_id: RunId,
    state: SharedRunState,
    signal: RunSignal,
    done: watch::Receiver<Option<RunSummary>>,
}

impl ActiveRun {
    /// No summary yet and the worker still holds its sender.
    fn is_running(&self) -> bool {
        self.done.borrow().is_none() && self.done.has_changed().is_ok()
    }
}

/// Starts runs on a background task and relays control requests to them.
///
/// Control calls never block on the worker; they only flip signals that the
/// worker polls between epochs and before load attempts.
pub struct RunSupervisor<B: ModelBackend> {
    backend: Arc<B>,
    observers: ObserverSet,
    events: BroadcastObserver,
    current: Mutex<Option<ActiveRun>>,
}

impl<B: ModelBackend> std::fmt::Debug for RunSupervisor<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunSupervisor")
            .field("backend", &self.backend.id())
            .field("observers", &self.observers)
            .finish_non_exhaustive()
    }
}

impl<B: ModelBackend + 'static> RunSupervisor<B> {
    #[must_use]
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            observers: ObserverSet::new().with(Arc::new(TracingObserver)),
            events: BroadcastObserver::default(),
            current: Mutex::new(None),
        }
    }

    /// Adds an observer that receives every event of every run.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Receiver for events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    /// Loads the dataset named by `config` and starts a run.
    ///
    /// Dataset errors surface here and no run is started.
    pub fn start_from_config(&self, config: RunConfig) -> TrainingResult<RunId> {
        self.ensure_idle()?;
        let dataset = Dataset::load(&config.dataset_path)?;
        self.start(config, dataset)
    }

    /// Starts a run on a new tokio task.
    ///
    /// Fails with [`TrainingError::RunActive`] while another run is still
    /// executing.
    pub fn start(&self, config: RunConfig, dataset: Dataset) -> TrainingResult<RunId> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(active) = current.as_ref().filter(|a| a.is_running()) {
            return Err(TrainingError::RunActive(active.run_id.to_string()));
        }

        let run_id = RunId::new();
        let state = SharedRunState::new(RunState::new(run_id.clone(), config.hyperparams.epochs));
        let signal = RunSignal::new();
        let (done_tx, done) = watch::channel(None);

        let observer: Arc<dyn Observer> = Arc::new(self.observers.clone().with(Arc::new(self.events.clone())));
        info!(
            run_id = %run_id,
            backend = self.backend.id(),
            model_id = %config.model_id,
            epochs = config.hyperparams.epochs,
            records = dataset.len(),
            dataset_id = %dataset.id(),
            "Starting run"
        );

        let controller = EpochLoopController::new(
            Arc::clone(&self.backend),
            Arc::new(config),
            Arc::new(dataset),
            state.clone(),
            observer,
            signal.listener(),
        );

        let worker_state = state.clone();
        let worker_signal = signal.clone();
        tokio::spawn(async move {
            let summary = controller.run().await;
            if worker_signal.is_cancelled() {
                worker_state.update(RunState::reset_progress);
            }
            done_tx.send_replace(Some(summary));
        });

        *current = Some(ActiveRun { run_id: run_id.clone(), state, signal, done });
        Ok(run_id)
    }

    /// Requests a pause at the next epoch boundary.
    pub fn pause(&self) -> TrainingResult<()> {
        self.with_active(|run| {
            if run.is_running() {
                run.signal.hold();
            }
        })
    }

    pub fn resume(&self) -> TrainingResult<()> {
        self.with_active(|run| run.signal.release())
    }

    /// Requests cancellation. The current epoch, if any, is allowed to
    /// finish and checkpoint before the run ends as `Cancelled`.
    pub fn stop(&self) -> TrainingResult<()> {
        self.with_active(|run| {
            if run.is_running() {
                run.signal.cancel();
            } else {
                run.state.update(RunState::reset_progress);
            }
        })
    }

    /// Clone of the current run's state, if a run was started.
    #[must_use]
    pub fn snapshot(&self) -> Option<RunState> {
        let current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        current.as_ref().map(|run| run.state.snapshot())
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        let current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        current.as_ref().is_some_and(ActiveRun::is_running)
    }

    /// Waits for the current run to reach a terminal phase.
    pub async fn wait(&self) -> TrainingResult<RunSummary> {
        let mut done = {
            let current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
            current.as_ref().map(|run| run.done.clone()).ok_or(TrainingError::NoRun)?
        };

        let summary = done.wait_for(Option::is_some).await.map_err(|_| {
            warn!("Run worker exited without reporting a summary");
            TrainingError::Worker("run worker exited without reporting a summary".to_string())
        })?;
        summary.clone().ok_or_else(|| TrainingError::Worker("missing run summary".to_string()))
    }

    fn ensure_idle(&self) -> TrainingResult<()> {
        let current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        match current.as_ref().filter(|a| a.is_running()) {
            Some(active) => Err(TrainingError::RunActive(active.run_id.to_string())),
            None => Ok(()),
        }
    }

    fn with_active(&self, f: impl FnOnce(&ActiveRun)) -> TrainingResult<()> {
        let current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        let run = current.as_ref().ok_or(TrainingError::NoRun)?;
        f(run);
        Ok(())
    }
}
