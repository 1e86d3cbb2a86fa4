//! Resource loader: acquires the model and tokenizer with bounded retry.

use crate::backend::{AdapterSpec, LoadRequest, ModelBackend};
use crate::config::{ResourceMode, RunConfig};
use crate::error::{BackendError, ResourceError, RunError};
use crate::observer::{Observer, RunEvent};
use crate::signal::SignalListener;
use crate::state::RunId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure,
}

/// One try at loading the model, reported to the observer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadAttempt {
    /// 1-based.
    pub attempt: u32,
    pub max_attempts: u32,
    pub outcome: AttemptOutcome,
    pub error: Option<String>,
    /// Delay applied before the next attempt; `None` when no retry follows.
    pub backoff: Option<Duration>,
}

pub struct LoadedResources<M, T> {
    pub model: M,
    pub tokenizer: T,
    pub attempts: u32,
}

impl<M, T> std::fmt::Debug for LoadedResources<M, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedResources").field("attempts", &self.attempts).finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum LoadOutcome<M, T> {
    Loaded(LoadedResources<M, T>),
    Cancelled,
    Failed(RunError),
}

/// Resolves `model_id` to `<local_model_dir>/<basename>`.
#[must_use]
pub fn resolve_local_model_path(local_model_dir: &Path, model_id: &str) -> PathBuf {
    let name = Path::new(model_id).file_name().map_or_else(|| model_id.into(), |n| n.to_os_string());
    local_model_dir.join(name)
}

/// Loads the model and tokenizer for `config`, then applies the LoRA adapter
/// when enabled.
///
/// Cancellation is checked before every attempt. A missing local model in
/// offline mode fails immediately; backend load errors are retried with
/// linear backoff until the retry policy is exhausted.
pub async fn load_resources<B: ModelBackend>(
    backend: &B,
    config: &RunConfig,
    run_id: &RunId,
    observer: &dyn Observer,
    signal: &SignalListener,
) -> LoadOutcome<B::Model, B::Tokenizer> {
    let policy = config.retry;
    let max_attempts = policy.max_attempts.max(1);
    let mut request = LoadRequest::from_config(config);
    let mut last_error: Option<BackendError> = None;

    info!(
        run_id = %run_id,
        backend = backend.id(),
        model_id = %config.model_id,
        weight_format = %request.weight_format,
        "Loading model and tokenizer"
    );

    for attempt in 1..=max_attempts {
        if signal.is_cancelled() {
            debug!(run_id = %run_id, attempt, "Cancellation observed before load attempt");
            return LoadOutcome::Cancelled;
        }

        if let ResourceMode::Offline { local_model_dir } = &config.resource_mode {
            let local_path = resolve_local_model_path(local_model_dir, &config.model_id);
            if !local_path.exists() {
                warn!(run_id = %run_id, path = %local_path.display(), "Local model directory does not exist");
                let err = ResourceError::LocalModelMissing { path: local_path };
                emit_attempt(observer, run_id, attempt, max_attempts, Some(err.to_string()), None);
                return LoadOutcome::Failed(err.into());
            }
            request.local_path = Some(local_path);
        }

        match backend.load(&request).await {
            Ok((model, tokenizer)) => {
                emit_attempt(observer, run_id, attempt, max_attempts, None, None);
                return match apply_adapter(backend, config, model).await {
                    Ok(model) => LoadOutcome::Loaded(LoadedResources { model, tokenizer, attempts: attempt }),
                    Err(err) => LoadOutcome::Failed(RunError::backend(None, err)),
                };
            }
            Err(err) => {
                let backoff = (attempt < max_attempts).then(|| policy.backoff_for(attempt));
                emit_attempt(observer, run_id, attempt, max_attempts, Some(err.to_string()), backoff);
                last_error = Some(err);

                if let Some(delay) = backoff {
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = signal.cancelled() => {}
                    }
                }
            }
        }
    }

    let last_error = last_error.unwrap_or_else(|| BackendError::Load("no load attempt was made".to_string()));
    LoadOutcome::Failed(ResourceError::ExhaustedRetries { attempts: max_attempts, last_error }.into())
}

async fn apply_adapter<B: ModelBackend>(
    backend: &B,
    config: &RunConfig,
    model: B::Model,
) -> Result<B::Model, BackendError> {
    if !config.lora.enabled {
        return Ok(model);
    }
    let spec = AdapterSpec { rank: config.lora.rank, target_modules: config.lora.target_modules.clone() };
    debug!(rank = spec.rank, modules = ?spec.target_modules, "Applying LoRA adapter");
    backend.apply_adapter(model, &spec).await
}

fn emit_attempt(
    observer: &dyn Observer,
    run_id: &RunId,
    attempt: u32,
    max_attempts: u32,
    error: Option<String>,
    backoff: Option<Duration>,
) {
    let outcome = if error.is_some() { AttemptOutcome::Failure } else { AttemptOutcome::Success };
    observer.on_event(RunEvent::LoadAttempt {
        run_id: run_id.clone(),
        attempt: LoadAttempt { attempt, max_attempts, outcome, error, backoff },
    });
}
