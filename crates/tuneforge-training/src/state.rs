//! Run state machine.
//!
//! `RunState` is the single mutable object of a run. The worker changes it
//! only through the transition functions below; callers read clones.

use crate::error::RunError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, error};
use uuid::Uuid;

/// Consecutive non-improving epochs tolerated before early stopping.
pub const PATIENCE: u32 = 3;

/// Identifier for a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Phase of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Loading,
    Training,
    Paused,
    Stopping,
    Completed,
    EarlyStopped,
    Cancelled,
    Failed,
}

impl RunPhase {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::EarlyStopped | Self::Cancelled | Self::Failed)
    }

    /// Checks if the run can move from `self` to `to`.
    #[must_use]
    #[allow(clippy::match_same_arms)] // one arm per edge of the phase graph
    pub fn can_transition_to(self, to: Self) -> bool {
        match (self, to) {
            (Self::Idle, Self::Loading) => true,
            (Self::Loading, Self::Training | Self::Failed | Self::Stopping) => true,
            (Self::Training, Self::Paused | Self::Stopping) => true,
            (Self::Training, Self::Completed | Self::EarlyStopped | Self::Failed) => true,
            (Self::Paused, Self::Training | Self::Stopping) => true,
            (Self::Stopping, Self::Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Training => "training",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Completed => "completed",
            Self::EarlyStopped => "early_stopped",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        })
    }
}

/// Rejected phase change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid phase transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: RunPhase,
    pub to: RunPhase,
}

/// Outcome of one completed epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochResult {
    /// 1-based.
    pub epoch: u32,
    pub loss: f64,
    pub learning_rate: f64,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: RunId,
    pub phase: RunPhase,
    pub current_epoch: u32,
    pub total_epochs: u32,
    pub progress_percent: f64,
    pub best_loss: Option<f64>,
    pub epochs_without_improvement: u32,
    /// Loss of every completed epoch, in order.
    pub loss_history: Vec<f64>,
    pub error: Option<RunError>,
}

impl RunState {
    #[must_use]
    pub fn new(run_id: RunId, total_epochs: u32) -> Self {
        Self {
            run_id,
            phase: RunPhase::Idle,
            current_epoch: 0,
            total_epochs,
            progress_percent: 0.0,
            best_loss: None,
            epochs_without_improvement: 0,
            loss_history: Vec::new(),
            error: None,
        }
    }

    /// Moves to `to`, returning the previous phase.
    pub fn transition(&mut self, to: RunPhase) -> Result<RunPhase, InvalidTransition> {
        let from = self.phase;
        if !from.can_transition_to(to) {
            error!(run_id = %self.run_id, from = %from, to = %to, "Invalid phase transition");
            return Err(InvalidTransition { from, to });
        }
        debug!(run_id = %self.run_id, from = %from, to = %to, "Phase transition");
        self.phase = to;
        Ok(from)
    }

    /// Marks `epoch` as the one being executed.
    pub fn begin_epoch(&mut self, epoch: u32) {
        self.current_epoch = epoch;
    }

    /// Folds a finished epoch into the history and progress.
    pub fn complete_epoch(&mut self, result: &EpochResult) {
        self.current_epoch = result.epoch;
        self.loss_history.push(result.loss);
        if self.total_epochs > 0 {
            self.progress_percent = f64::from(result.epoch) / f64::from(self.total_epochs) * 100.0;
        }
    }

    /// Applies the checkpoint verdict for the current epoch.
    ///
    /// Returns `true` when the patience window is exhausted.
    pub fn record_improvement(&mut self, loss: f64, improved: bool) -> bool {
        if improved {
            if self.best_loss.is_none_or(|best| loss < best) {
                self.best_loss = Some(loss);
            }
            self.epochs_without_improvement = 0;
        } else {
            self.epochs_without_improvement += 1;
        }
        self.epochs_without_improvement >= PATIENCE
    }

    /// Moves to `Failed` and keeps the error.
    pub fn fail(&mut self, error: RunError) -> Result<RunPhase, InvalidTransition> {
        let previous = self.transition(RunPhase::Failed)?;
        self.error = Some(error);
        Ok(previous)
    }

    /// Clears the displayed epoch counter and progress. History is kept.
    pub fn reset_progress(&mut self) {
        self.current_epoch = 0;
        self.progress_percent = 0.0;
    }
}

/// `RunState` shared between the worker and the caller.
#[derive(Debug, Clone)]
pub struct SharedRunState(Arc<RwLock<RunState>>);

impl SharedRunState {
    #[must_use]
    pub fn new(state: RunState) -> Self {
        Self(Arc::new(RwLock::new(state)))
    }

    #[must_use]
    pub fn snapshot(&self) -> RunState {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Runs `f` with exclusive access. Keep `f` short; it must not block.
    pub fn update<R>(&self, f: impl FnOnce(&mut RunState) -> R) -> R {
        let mut guard = self.0.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(epoch: u32, loss: f64) -> EpochResult {
        EpochResult { epoch, loss, learning_rate: 2e-5, duration: Duration::from_millis(5) }
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut state = RunState::new(RunId::new(), 2);
        assert_eq!(state.transition(RunPhase::Loading), Ok(RunPhase::Idle));
        assert_eq!(state.transition(RunPhase::Training), Ok(RunPhase::Loading));
        assert_eq!(state.transition(RunPhase::Paused), Ok(RunPhase::Training));
        assert_eq!(state.transition(RunPhase::Training), Ok(RunPhase::Paused));
        assert_eq!(state.transition(RunPhase::Completed), Ok(RunPhase::Training));
    }

    #[test]
    fn test_no_skipping_and_no_leaving_terminal_phases() {
        let mut state = RunState::new(RunId::new(), 2);
        assert!(state.transition(RunPhase::Training).is_err());
        assert!(state.transition(RunPhase::Completed).is_err());

        state.transition(RunPhase::Loading).unwrap();
        state.transition(RunPhase::Stopping).unwrap();
        state.transition(RunPhase::Cancelled).unwrap();

        for to in [RunPhase::Idle, RunPhase::Loading, RunPhase::Training, RunPhase::Failed, RunPhase::Completed] {
            assert!(state.transition(to).is_err(), "cancelled -> {to} must be rejected");
        }
        assert_eq!(state.phase, RunPhase::Cancelled);
    }

    #[test]
    fn test_paused_cannot_complete_directly() {
        assert!(!RunPhase::Paused.can_transition_to(RunPhase::Completed));
        assert!(!RunPhase::Paused.can_transition_to(RunPhase::Cancelled));
        assert!(RunPhase::Paused.can_transition_to(RunPhase::Stopping));
    }

    #[test]
    fn test_patience_window() {
        let mut state = RunState::new(RunId::new(), 10);
        assert!(!state.record_improvement(1.0, true));
        assert!(!state.record_improvement(1.1, false));
        assert!(!state.record_improvement(1.2, false));
        assert!(state.record_improvement(1.0, false));
        assert_eq!(state.best_loss, Some(1.0));
    }

    #[test]
    fn test_best_loss_never_increases() {
        let mut state = RunState::new(RunId::new(), 10);
        let mut previous = f64::INFINITY;
        for (loss, improved) in [(2.0, true), (1.5, true), (3.0, false), (1.2, true), (1.2, false)] {
            state.record_improvement(loss, improved);
            let best = state.best_loss.unwrap();
            assert!(best <= previous);
            previous = best;
        }
        assert_eq!(state.best_loss, Some(1.2));
    }

    #[test]
    fn test_progress_follows_completed_epochs() {
        let mut state = RunState::new(RunId::new(), 4);
        state.complete_epoch(&result(1, 2.0));
        assert!((state.progress_percent - 25.0).abs() < f64::EPSILON);
        state.complete_epoch(&result(4, 1.0));
        assert!((state.progress_percent - 100.0).abs() < f64::EPSILON);
        assert_eq!(state.loss_history, vec![2.0, 1.0]);
        state.reset_progress();
        assert!(state.progress_percent.abs() < f64::EPSILON);
        assert_eq!(state.current_epoch, 0);
        assert_eq!(state.loss_history, vec![2.0, 1.0]);
    }

    #[test]
    fn test_fail_keeps_error() {
        let mut state = RunState::new(RunId::new(), 1);
        state.transition(RunPhase::Loading).unwrap();
        state.transition(RunPhase::Training).unwrap();
        state.fail(RunError::storage("disk full")).unwrap();
        assert_eq!(state.phase, RunPhase::Failed);
        assert!(state.error.is_some());
    }
}
