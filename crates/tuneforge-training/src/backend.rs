//! Model backend capability.
//!
//! The controller never touches weights. Any ML runtime binds to
//! [`ModelBackend`] and is driven through load, adapter, train and save calls.

use crate::config::{NetworkSettings, RunConfig, WeightFormat};
use crate::dataset::Dataset;
use crate::error::BackendError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Parameters for one model/tokenizer load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadRequest {
    pub model_id: String,
    pub weight_format: WeightFormat,
    pub max_length: u32,
    /// Set in offline mode to the resolved local model directory.
    pub local_path: Option<PathBuf>,
    pub network: NetworkSettings,
}

impl LoadRequest {
    #[must_use]
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            model_id: config.model_id.clone(),
            weight_format: config.weight_format(),
            max_length: config.hyperparams.max_length,
            local_path: None,
            network: config.network.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterSpec {
    pub rank: u32,
    pub target_modules: Vec<String>,
}

/// Parameters for one pass over the dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochParams {
    pub epoch: u32,
    pub total_epochs: u32,
    pub batch_size: u32,
    pub gradient_accumulation_steps: u32,
    pub learning_rate: f64,
    pub optimizer: String,
    pub scheduler: String,
    pub weight_decay: f64,
    pub max_length: u32,
    pub packing: bool,
    pub num_proc: u32,
}

impl EpochParams {
    #[must_use]
    pub fn for_epoch(config: &RunConfig, epoch: u32) -> Self {
        let hp = &config.hyperparams;
        Self {
            epoch,
            total_epochs: hp.epochs,
            batch_size: hp.batch_size,
            gradient_accumulation_steps: hp.gradient_accumulation_steps,
            learning_rate: hp.learning_rate,
            optimizer: hp.optimizer.clone(),
            scheduler: hp.scheduler.clone(),
            weight_decay: hp.weight_decay,
            max_length: hp.max_length,
            packing: hp.packing,
            num_proc: hp.num_proc,
        }
    }
}

/// What the backend reports after one epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochStats {
    pub loss: f64,
    /// Learning rate at the end of the epoch, if the scheduler changed it.
    pub learning_rate: Option<f64>,
}

#[async_trait]
pub trait ModelBackend: Send + Sync {
    type Model: Send + Sync + 'static;
    type Tokenizer: Send + Sync + 'static;

    fn id(&self) -> &'static str;

    async fn load(&self, request: &LoadRequest) -> BackendResult<(Self::Model, Self::Tokenizer)>;

    async fn apply_adapter(&self, model: Self::Model, adapter: &AdapterSpec) -> BackendResult<Self::Model>;

    async fn train_epoch(
        &self,
        model: &mut Self::Model,
        dataset: &Dataset,
        params: &EpochParams,
    ) -> BackendResult<EpochStats>;

    async fn save(&self, model: &Self::Model, tokenizer: &Self::Tokenizer, path: &Path) -> BackendResult<()>;
}
