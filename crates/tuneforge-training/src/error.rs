use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub type TrainingResult<T> = std::result::Result<T, TrainingError>;

/// Crate-level error for filesystem, dataset, export and supervisor misuse.
#[derive(Debug, Error)]
pub enum TrainingError {
    #[error(transparent)]
    InvalidConfig(#[from] ValidationError),

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("artifact error: {0}")]
    Artifact(String),

    #[error("run {0} is still active")]
    RunActive(String),

    #[error("no run has been started")]
    NoRun,

    #[error("run worker failed: {0}")]
    Worker(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Configuration field identified by a [`ValidationError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigField {
    ModelId,
    DatasetPath,
    LearningRate,
    BatchSize,
    Epochs,
    MaxLength,
    LoraRank,
    GradientAccumulationSteps,
    WeightDecay,
    QuantizationMode,
    Precision,
    LocalModelDir,
    MaxRetries,
    RetryBackoff,
    Timeout,
    NumProc,
}

impl ConfigField {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ModelId => "model_id",
            Self::DatasetPath => "dataset_path",
            Self::LearningRate => "learning_rate",
            Self::BatchSize => "batch_size",
            Self::Epochs => "epochs",
            Self::MaxLength => "max_length",
            Self::LoraRank => "lora_rank",
            Self::GradientAccumulationSteps => "gradient_accumulation_steps",
            Self::WeightDecay => "weight_decay",
            Self::QuantizationMode => "quantization",
            Self::Precision => "precision",
            Self::LocalModelDir => "local_model_dir",
            Self::MaxRetries => "max_retries",
            Self::RetryBackoff => "retry_backoff_secs",
            Self::Timeout => "timeout_secs",
            Self::NumProc => "num_proc",
        }
    }
}

impl fmt::Display for ConfigField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected raw configuration. Never retried; the run does not start.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("invalid {field}: {message}")]
pub struct ValidationError {
    pub field: ConfigField,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: ConfigField, message: impl Into<String>) -> Self {
        Self { field, message: message.into() }
    }
}

/// Failure reported by a [`crate::backend::ModelBackend`] call.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum BackendError {
    #[error("model load failed: {0}")]
    Load(String),

    #[error("adapter setup failed: {0}")]
    Adapter(String),

    #[error("training step failed: {0}")]
    Train(String),

    #[error("checkpoint save failed: {0}")]
    Save(String),

    #[error("backend reported an invalid loss: {0}")]
    InvalidLoss(String),
}

/// Failure while acquiring the model and tokenizer.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceError {
    #[error("local model not found at {}", .path.display())]
    LocalModelMissing { path: PathBuf },

    #[error("model load failed after {attempts} attempt(s): {last_error}")]
    ExhaustedRetries { attempts: u32, last_error: BackendError },
}

/// Terminal failure of a run, carried in [`crate::state::RunState`].
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunError {
    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error("{}{source}", .epoch.map(|e| format!("epoch {e}: ")).unwrap_or_default())]
    Backend { epoch: Option<u32>, source: BackendError },

    #[error("storage error: {message}")]
    Storage { message: String },
}

impl RunError {
    pub fn backend(epoch: Option<u32>, source: BackendError) -> Self {
        Self::Backend { epoch, source }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into() }
    }

    /// Epoch that was executing when the run failed, if any.
    #[must_use]
    pub fn epoch(&self) -> Option<u32> {
        match self {
            Self::Backend { epoch, .. } => *epoch,
            _ => None,
        }
    }
}
