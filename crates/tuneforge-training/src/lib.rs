//! Tuneforge Training
//!
//! Controller for supervised fine-tuning runs:
//! - Validating raw settings into an immutable `RunConfig`
//! - Loading model resources with bounded retry (`loader`)
//! - Driving epochs with checkpointing and early stopping (`controller`)
//! - Starting, pausing, resuming and stopping runs (`RunSupervisor`)
//! - Exporting trained models and importing their settings
//!
//! The ML runtime itself sits behind the `ModelBackend` trait.

pub mod backend;
pub mod checkpoint;
pub mod config;
pub mod controller;
pub mod dataset;
pub mod error;
pub mod export;
pub mod layout;
pub mod loader;
pub mod local_models;
pub mod manifest;
pub mod observer;
pub mod signal;
pub mod state;
pub mod supervisor;

pub use backend::{AdapterSpec, BackendResult, EpochParams, EpochStats, LoadRequest, ModelBackend};
pub use checkpoint::{CheckpointManager, CheckpointRecord};
pub use config::{
    HyperParams, LoraSettings, NetworkSettings, Precision, QuantizationMode, RawRunConfig, ResourceMode, RetryPolicy,
    RunConfig, WeightFormat,
};
pub use controller::EpochLoopController;
pub use dataset::{Dataset, DatasetId, TextRecord};
pub use error::{BackendError, ConfigField, ResourceError, RunError, TrainingError, TrainingResult, ValidationError};
pub use export::{export_model, import_snapshot, ConfigSnapshot, ExportReport};
pub use layout::RunLayout;
pub use loader::{load_resources, AttemptOutcome, LoadAttempt, LoadOutcome, LoadedResources};
pub use local_models::{format_parameter_count, scan_local_models, LocalModel};
pub use manifest::{ExportManifest, ExportedFile, RunManifest};
pub use observer::{BroadcastObserver, Observer, ObserverSet, RunEvent, RunSummary, TracingObserver};
pub use signal::{HoldRelease, RunSignal, SignalListener};
pub use state::{EpochResult, RunId, RunPhase, RunState, SharedRunState, PATIENCE};
pub use supervisor::RunSupervisor;
