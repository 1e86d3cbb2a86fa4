//! Shared fixtures for tuneforge-training integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;
use tuneforge_training::{
    AdapterSpec, BackendError, BackendResult, Dataset, EpochParams, EpochStats, LoadAttempt, LoadRequest,
    ModelBackend, Observer, RawRunConfig, RunConfig, RunEvent, RunPhase,
};

/// Blocks one epoch until the test releases it.
#[derive(Debug, Default)]
pub struct EpochGate {
    pub entered: Notify,
    pub release: Notify,
}

/// Model handle of the scripted backend: number of epochs trained so far.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    pub epochs_trained: u32,
    pub adapter_rank: Option<u32>,
}

/// Backend whose load failures and per-epoch losses are fixed up front.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    /// Number of initial `load` calls that fail.
    load_failures: u32,
    losses: Mutex<VecDeque<Result<f64, BackendError>>>,
    gate: Option<(u32, Arc<EpochGate>)>,
    panic_at: Option<u32>,
    pub load_calls: AtomicU32,
    pub adapter_calls: AtomicU32,
    pub requests: Mutex<Vec<LoadRequest>>,
    pub saved: Mutex<Vec<PathBuf>>,
}

impl ScriptedBackend {
    pub fn with_losses(losses: &[f64]) -> Self {
        Self { losses: Mutex::new(losses.iter().copied().map(Ok).collect()), ..Self::default() }
    }

    pub fn with_results(results: Vec<Result<f64, BackendError>>) -> Self {
        Self { losses: Mutex::new(results.into()), ..Self::default() }
    }

    pub fn failing_loads(mut self, failures: u32) -> Self {
        self.load_failures = failures;
        self
    }

    pub fn gated_at(mut self, epoch: u32, gate: Arc<EpochGate>) -> Self {
        self.gate = Some((epoch, gate));
        self
    }

    pub fn panicking_at(mut self, epoch: u32) -> Self {
        self.panic_at = Some(epoch);
        self
    }

    pub fn load_calls(&self) -> u32 {
        self.load_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    type Model = ScriptedModel;
    type Tokenizer = ();

    fn id(&self) -> &'static str {
        "scripted"
    }

    async fn load(&self, request: &LoadRequest) -> BackendResult<(ScriptedModel, ())> {
        let call = self.load_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests.lock().unwrap().push(request.clone());
        if call <= self.load_failures {
            return Err(BackendError::Load(format!("connection reset (call {call})")));
        }
        Ok((ScriptedModel::default(), ()))
    }

    async fn apply_adapter(&self, mut model: ScriptedModel, adapter: &AdapterSpec) -> BackendResult<ScriptedModel> {
        self.adapter_calls.fetch_add(1, Ordering::SeqCst);
        model.adapter_rank = Some(adapter.rank);
        Ok(model)
    }

    async fn train_epoch(
        &self,
        model: &mut ScriptedModel,
        _dataset: &Dataset,
        params: &EpochParams,
    ) -> BackendResult<EpochStats> {
        if let Some((epoch, gate)) = &self.gate
            && *epoch == params.epoch
        {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        assert_ne!(self.panic_at, Some(params.epoch), "scripted backend crash");

        let next = self.losses.lock().unwrap().pop_front();
        let loss = next.unwrap_or_else(|| Err(BackendError::Train("no scripted loss left".to_string())))?;
        model.epochs_trained = params.epoch;
        Ok(EpochStats { loss, learning_rate: Some(params.learning_rate) })
    }

    async fn save(&self, model: &ScriptedModel, _tokenizer: &(), path: &Path) -> BackendResult<()> {
        std::fs::create_dir_all(path).map_err(|e| BackendError::Save(e.to_string()))?;
        std::fs::write(path.join("model.txt"), format!("epochs_trained={}", model.epochs_trained))
            .map_err(|e| BackendError::Save(e.to_string()))?;
        self.saved.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }
}

/// Observer that keeps every event.
#[derive(Debug, Default)]
pub struct CollectingObserver {
    events: Mutex<Vec<RunEvent>>,
}

impl CollectingObserver {
    pub fn events(&self) -> Vec<RunEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn load_attempts(&self) -> Vec<LoadAttempt> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                RunEvent::LoadAttempt { attempt, .. } => Some(attempt),
                _ => None,
            })
            .collect()
    }

    pub fn phases(&self) -> Vec<RunPhase> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                RunEvent::PhaseChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect()
    }

    pub fn epoch_samples(&self) -> Vec<(u32, f64, f64)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                RunEvent::EpochSample { epoch, loss, progress_percent, .. } => Some((epoch, loss, progress_percent)),
                _ => None,
            })
            .collect()
    }
}

impl Observer for CollectingObserver {
    fn on_event(&self, event: RunEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Raw settings pointing at a small dataset inside `dir`.
pub fn raw_config(dir: &TempDir, epochs: u32) -> RawRunConfig {
    let dataset = dir.path().join("train.json");
    std::fs::write(&dataset, r#"[{"text": "hello world"}, {"text": "fine tuning"}]"#).unwrap();
    RawRunConfig {
        model_id: "org/tiny-model".to_string(),
        dataset_path: dataset.display().to_string(),
        output_dir: dir.path().join("output").display().to_string(),
        epochs: epochs.to_string(),
        retry_backoff_secs: "0".to_string(),
        ..RawRunConfig::default()
    }
}

pub fn run_config(dir: &TempDir, epochs: u32) -> RunConfig {
    RunConfig::from_raw(&raw_config(dir, epochs)).unwrap()
}

/// Polls until `check` holds or the timeout elapses.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
