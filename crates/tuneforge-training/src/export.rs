//! Export of a trained model and import of its configuration snapshot.

use crate::config::{RawRunConfig, RunConfig};
use crate::error::{TrainingError, TrainingResult};
use crate::layout::RunLayout;
use crate::manifest::{hash_file, write_json, ExportManifest, ExportedFile};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

pub const CONFIG_SNAPSHOT_FILE: &str = "config.json";
pub const EXPORT_MANIFEST_FILE: &str = "export_manifest.json";

/// Training settings saved next to an exported model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub base_model: String,
    pub learning_rate: f64,
    pub batch_size: u32,
    pub epochs: u32,
    pub max_length: u32,
    pub use_lora: bool,
    pub lora_rank: u32,
    pub precision: String,
    pub gradient_accumulation_steps: u32,
}

impl From<&RunConfig> for ConfigSnapshot {
    fn from(config: &RunConfig) -> Self {
        let hp = &config.hyperparams;
        Self {
            base_model: config.model_id.clone(),
            learning_rate: hp.learning_rate,
            batch_size: hp.batch_size,
            epochs: hp.epochs,
            max_length: hp.max_length,
            use_lora: config.lora.enabled,
            lora_rank: config.lora.rank,
            precision: config.precision.to_string(),
            gradient_accumulation_steps: hp.gradient_accumulation_steps,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportReport {
    pub export_dir: PathBuf,
    /// Checkpoint the weights were copied from.
    pub source: PathBuf,
    pub files: Vec<ExportedFile>,
}

/// Picks the checkpoint to export: the best model, else the newest epoch.
pub fn export_source(layout: &RunLayout) -> TrainingResult<PathBuf> {
    let best = layout.best_dir();
    if best.is_dir() {
        return Ok(best);
    }
    layout
        .existing_epochs()?
        .pop()
        .map(|(_, path)| path)
        .ok_or_else(|| TrainingError::Artifact(format!("no checkpoint to export in {}", layout.root().display())))
}

/// Copies the selected checkpoint into `<output>/exported_model`, then writes
/// the config snapshot and a manifest hashing every exported file. A previous
/// export in that directory is replaced.
pub fn export_model(config: &RunConfig) -> TrainingResult<ExportReport> {
    let layout = RunLayout::new(&config.output_dir);
    let source = export_source(&layout)?;
    let export_dir = layout.export_dir();
    if export_dir.exists() {
        debug!(path = %export_dir.display(), "Removing previous export");
        std::fs::remove_dir_all(&export_dir)?;
    }
    std::fs::create_dir_all(&export_dir)?;

    info!(source = %source.display(), target = %export_dir.display(), "Exporting model");

    let mut files = Vec::new();
    for entry in WalkDir::new(&source).sort_by_file_name() {
        let entry = entry.map_err(|e| TrainingError::Artifact(format!("cannot read checkpoint: {e}")))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(&source).unwrap_or(entry.path());
        if relative == Path::new(CONFIG_SNAPSHOT_FILE) {
            // Replaced by the snapshot below.
            continue;
        }
        let target = export_dir.join(relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(entry.path(), &target)?;
        debug!(file = %relative.display(), "Copied");
        files.push(hash_file(&export_dir, &target)?);
    }

    let snapshot_path = export_dir.join(CONFIG_SNAPSHOT_FILE);
    write_json(&snapshot_path, &ConfigSnapshot::from(config))?;
    files.push(hash_file(&export_dir, &snapshot_path)?);

    let manifest = ExportManifest { created_at: Utc::now(), source: source.clone(), files: files.clone() };
    write_json(&export_dir.join(EXPORT_MANIFEST_FILE), &manifest)?;

    info!(files = files.len(), "Export complete");
    Ok(ExportReport { export_dir, source, files })
}

/// Reads `config.json` from `model_dir` and overlays the fields it carries
/// onto `raw`. Absent fields keep their current value. The output directory
/// becomes the parent of `model_dir`.
pub fn import_snapshot(model_dir: &Path, raw: &mut RawRunConfig) -> TrainingResult<()> {
    let path = model_dir.join(CONFIG_SNAPSHOT_FILE);
    if !path.is_file() {
        return Err(TrainingError::Artifact(format!("no {CONFIG_SNAPSHOT_FILE} in {}", model_dir.display())));
    }
    let bytes = std::fs::read(&path)?;
    let value: Value = serde_json::from_slice(&bytes)?;
    let Value::Object(fields) = value else {
        return Err(TrainingError::Artifact(format!("{} is not a JSON object", path.display())));
    };

    for (key, value) in &fields {
        match key.as_str() {
            "base_model" => set_text(&mut raw.model_id, value),
            "learning_rate" => set_text(&mut raw.learning_rate, value),
            "batch_size" => set_text(&mut raw.batch_size, value),
            "epochs" => set_text(&mut raw.epochs, value),
            "max_length" => set_text(&mut raw.max_length, value),
            "lora_rank" => set_text(&mut raw.lora_rank, value),
            "gradient_accumulation_steps" => set_text(&mut raw.gradient_accumulation_steps, value),
            "precision" => set_text(&mut raw.precision, value),
            "use_lora" => {
                if let Some(flag) = as_flag(value) {
                    raw.use_lora = flag;
                }
            }
            // Older snapshots carried a plain fp16 switch.
            "use_fp16" => {
                if let Some(flag) = as_flag(value) {
                    raw.precision = if flag { "fp16" } else { "fp32" }.to_string();
                }
            }
            other => debug!(field = other, "Ignoring unknown snapshot field"),
        }
    }

    if let Some(parent) = model_dir.parent().filter(|p| !p.as_os_str().is_empty()) {
        raw.output_dir = parent.display().to_string();
    }
    info!(path = %path.display(), "Imported model configuration");
    Ok(())
}

fn set_text(slot: &mut String, value: &Value) {
    match value {
        Value::String(s) => slot.clone_from(s),
        Value::Number(n) => *slot = n.to_string(),
        Value::Bool(b) => *slot = b.to_string(),
        _ => {}
    }
}

fn as_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        _ => None,
    }
}
