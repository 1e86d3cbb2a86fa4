//! Discovery of models stored in a local model directory.

use crate::error::{TrainingError, TrainingResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A sub-directory of the local model directory that holds a `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalModel {
    pub name: String,
    pub path: PathBuf,
    pub base_model: Option<String>,
    pub architecture: Option<String>,
    pub parameters: Option<u64>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl LocalModel {
    /// Human readable parameter count, or `unknown`.
    #[must_use]
    pub fn parameters_display(&self) -> String {
        self.parameters.map_or_else(|| "unknown".to_string(), format_parameter_count)
    }
}

/// Lists models under `dir`, sorted by name. Entries whose `config.json`
/// cannot be parsed are skipped.
pub fn scan_local_models(dir: &Path) -> TrainingResult<Vec<LocalModel>> {
    if !dir.is_dir() {
        return Err(TrainingError::Artifact(format!("local model directory does not exist: {}", dir.display())));
    }

    let mut models = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let config_path = path.join("config.json");
        if !path.is_dir() || !config_path.is_file() {
            continue;
        }

        let config = match std::fs::read(&config_path)
            .map_err(TrainingError::from)
            .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).map_err(TrainingError::from))
        {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %config_path.display(), error = %e, "Skipping model with unreadable config");
                continue;
            }
        };

        let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let last_modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok().map(DateTime::<Utc>::from);
        debug!(name = %name, "Found local model");

        models.push(LocalModel {
            name,
            base_model: config.get("base_model").and_then(Value::as_str).map(str::to_string),
            architecture: config
                .get("architectures")
                .and_then(Value::as_array)
                .and_then(|a| a.first())
                .and_then(Value::as_str)
                .map(str::to_string),
            parameters: estimate_parameters(&config),
            last_modified,
            path,
        });
    }

    models.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(models)
}

/// Declared parameter count, or `hidden² · layers · 4 + hidden · vocab`.
#[must_use]
pub fn estimate_parameters(config: &Value) -> Option<u64> {
    for key in ["n_parameters", "num_parameters"] {
        if let Some(value) = config.get(key) {
            return value.as_u64().or_else(|| value.as_f64().filter(|v| *v >= 0.0).map(|v| v as u64));
        }
    }

    let field = |key: &str| config.get(key).and_then(Value::as_u64).filter(|v| *v > 0);
    let hidden = field("hidden_size")?;
    let layers = field("num_hidden_layers")?;
    let vocab = field("vocab_size")?;
    hidden
        .checked_mul(hidden)?
        .checked_mul(layers)?
        .checked_mul(4)?
        .checked_add(hidden.checked_mul(vocab)?)
}

/// `1.1B`, `350.0M`, or a comma-grouped integer below one million.
#[must_use]
pub fn format_parameter_count(count: u64) -> String {
    let value = count as f64;
    if value >= 1e9 {
        format!("{:.1}B", value / 1e9)
    } else if value >= 1e6 {
        format!("{:.1}M", value / 1e6)
    } else {
        let digits = count.to_string();
        let mut out = String::with_capacity(digits.len() + digits.len() / 3);
        for (i, c) in digits.chars().enumerate() {
            if i > 0 && (digits.len() - i) % 3 == 0 {
                out.push(',');
            }
            out.push(c);
        }
        out
    }
}
