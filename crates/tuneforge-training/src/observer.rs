//! Run events and the sinks that receive them.
//!
//! Observers must accept events without blocking the worker. Lost events are
//! acceptable (they only feed logs and displays); lost checkpoints are not,
//! which is why observers never take part in control decisions.

use crate::checkpoint::CheckpointRecord;
use crate::error::RunError;
use crate::loader::{AttemptOutcome, LoadAttempt};
use crate::state::{RunId, RunPhase};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Terminal summary of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub phase: RunPhase,
    pub epochs_completed: u32,
    pub best_loss: Option<f64>,
    pub best_checkpoint: Option<PathBuf>,
    pub error: Option<RunError>,
}

impl RunSummary {
    /// Stopped because the caller asked.
    #[must_use]
    pub fn was_cancelled(&self) -> bool {
        self.phase == RunPhase::Cancelled
    }

    /// Stopped because something went wrong.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.phase == RunPhase::Failed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    LoadAttempt { run_id: RunId, attempt: LoadAttempt },
    PhaseChanged { run_id: RunId, from: RunPhase, to: RunPhase },
    EpochSample {
        run_id: RunId,
        epoch: u32,
        total_epochs: u32,
        loss: f64,
        learning_rate: f64,
        progress_percent: f64,
    },
    CheckpointSaved { run_id: RunId, record: CheckpointRecord },
    Finished { summary: RunSummary },
}

impl RunEvent {
    #[must_use]
    pub fn run_id(&self) -> &RunId {
        match self {
            Self::LoadAttempt { run_id, .. }
            | Self::PhaseChanged { run_id, .. }
            | Self::EpochSample { run_id, .. }
            | Self::CheckpointSaved { run_id, .. } => run_id,
            Self::Finished { summary } => &summary.run_id,
        }
    }
}

pub trait Observer: Send + Sync {
    fn on_event(&self, event: RunEvent);
}

impl<T: Observer + ?Sized> Observer for Arc<T> {
    fn on_event(&self, event: RunEvent) {
        (**self).on_event(event);
    }
}

/// Renders events as tracing records.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn on_event(&self, event: RunEvent) {
        match event {
            RunEvent::LoadAttempt { run_id, attempt } => match attempt.outcome {
                AttemptOutcome::Success => {
                    info!(run_id = %run_id, attempt = attempt.attempt, "Model and tokenizer loaded");
                }
                AttemptOutcome::Failure => warn!(
                    run_id = %run_id,
                    attempt = attempt.attempt,
                    max_attempts = attempt.max_attempts,
                    backoff_ms = attempt.backoff.map(|b| b.as_millis() as u64),
                    error = attempt.error.as_deref().unwrap_or_default(),
                    "Model load attempt failed"
                ),
            },
            RunEvent::PhaseChanged { run_id, from, to } => {
                info!(run_id = %run_id, from = %from, to = %to, "Run phase changed");
            }
            RunEvent::EpochSample { run_id, epoch, total_epochs, loss, learning_rate, progress_percent } => {
                info!(
                    run_id = %run_id,
                    epoch,
                    total_epochs,
                    loss,
                    learning_rate,
                    progress = progress_percent,
                    "Epoch {epoch}/{total_epochs}, loss {loss:.4}"
                );
            }
            RunEvent::CheckpointSaved { run_id, record } => {
                info!(
                    run_id = %run_id,
                    epoch = record.epoch,
                    is_best = record.is_best,
                    path = %record.path.display(),
                    "Checkpoint saved"
                );
            }
            RunEvent::Finished { summary } => {
                if let Some(err) = &summary.error {
                    warn!(run_id = %summary.run_id, phase = %summary.phase, error = %err, "Run finished");
                } else {
                    info!(
                        run_id = %summary.run_id,
                        phase = %summary.phase,
                        best_loss = summary.best_loss,
                        "Run finished"
                    );
                }
            }
        }
    }
}

/// Fans events out to `tokio::sync::broadcast` subscribers.
///
/// Never blocks; a subscriber that falls behind loses the oldest events.
#[derive(Debug, Clone)]
pub struct BroadcastObserver {
    tx: broadcast::Sender<RunEvent>,
}

impl BroadcastObserver {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastObserver {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Observer for BroadcastObserver {
    fn on_event(&self, event: RunEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

/// Delivers every event to each observer in order.
#[derive(Clone, Default)]
pub struct ObserverSet {
    observers: Vec<Arc<dyn Observer>>,
}

impl ObserverSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn push(&mut self, observer: Arc<dyn Observer>) {
        self.observers.push(observer);
    }
}

impl std::fmt::Debug for ObserverSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverSet").field("observers", &self.observers.len()).finish()
    }
}

impl Observer for ObserverSet {
    fn on_event(&self, event: RunEvent) {
        if let Some((last, rest)) = self.observers.split_last() {
            for observer in rest {
                observer.on_event(event.clone());
            }
            last.on_event(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<RunEvent>>);

    impl Observer for Collect {
        fn on_event(&self, event: RunEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    fn phase_event(to: RunPhase) -> RunEvent {
        RunEvent::PhaseChanged { run_id: RunId("r".to_string()), from: RunPhase::Idle, to }
    }

    #[test]
    fn test_observer_set_delivers_to_all() {
        let a = Arc::new(Collect::default());
        let b = Arc::new(Collect::default());
        let set = ObserverSet::new().with(a.clone()).with(b.clone());

        set.on_event(phase_event(RunPhase::Loading));

        assert_eq!(a.0.lock().unwrap().len(), 1);
        assert_eq!(b.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_drops_oldest_for_lagging_subscriber() {
        let observer = BroadcastObserver::new(2);
        let mut rx = observer.subscribe();

        observer.on_event(phase_event(RunPhase::Loading));
        observer.on_event(phase_event(RunPhase::Training));
        observer.on_event(phase_event(RunPhase::Completed));

        assert!(matches!(rx.recv().await, Err(broadcast::error::RecvError::Lagged(1))));
        assert_eq!(rx.recv().await.unwrap(), phase_event(RunPhase::Training));
        assert_eq!(rx.recv().await.unwrap(), phase_event(RunPhase::Completed));
    }

    #[test]
    fn test_broadcast_without_subscribers_does_not_fail() {
        let observer = BroadcastObserver::new(4);
        observer.on_event(phase_event(RunPhase::Loading));
    }

    #[test]
    fn test_summary_distinguishes_outcomes() {
        let summary = RunSummary {
            run_id: RunId("r".to_string()),
            phase: RunPhase::Cancelled,
            epochs_completed: 1,
            best_loss: Some(1.0),
            best_checkpoint: None,
            error: None,
        };
        assert!(summary.was_cancelled());
        assert!(!summary.is_failure());
    }
}
