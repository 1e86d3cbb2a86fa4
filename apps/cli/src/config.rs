//! CLI configuration file support.
//!
//! Configuration precedence:
//! 1. CLI arguments (handled by clap)
//! 2. Local config file (./.tuneforgerc)
//! 3. Global config file (~/.tuneforge/config.toml)
//! 4. Defaults

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CliConfig {
    /// Log level used when `--log-level` is not given
    #[serde(default)]
    pub log_level: Option<String>,

    /// Default local model directory for offline runs and `models`
    #[serde(default)]
    pub local_model_dir: Option<String>,

    /// Default output directory for checkpoints
    #[serde(default)]
    pub output_dir: Option<String>,

    /// Proxy handed to the backend
    #[serde(default)]
    pub proxy: Option<String>,

    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Default output format (human, json)
    #[serde(default = "default_output_format")]
    pub format: String,
}

fn default_output_format() -> String {
    "human".to_string()
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self { format: default_output_format() }
    }
}

#[derive(Debug, Error)]
pub enum CliConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    #[error("Failed to read configuration file: {0}")]
    ReadError(String),

    #[error("Failed to parse configuration file: {0}")]
    ParseError(String),
}

impl CliConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, CliConfigError> {
        if !path.exists() {
            return Err(CliConfigError::NotFound(path.display().to_string()));
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| CliConfigError::ReadError(format!("{}: {}", path.display(), e)))?;

        toml::from_str(&content).map_err(|e| CliConfigError::ParseError(format!("{}: {}", path.display(), e)))
    }

    pub fn default_global_path() -> PathBuf {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".tuneforge").join("config.toml")
    }

    pub fn default_local_path() -> PathBuf {
        PathBuf::from(".tuneforgerc")
    }

    /// Loads the global config, then the local one on top of it.
    ///
    /// Missing files are skipped. A file that exists but does not parse is
    /// reported on stderr and ignored.
    pub fn discover_and_load() -> Self {
        let mut config = Self::default();
        for path in [Self::default_global_path(), Self::default_local_path()] {
            match Self::load_from_file(&path) {
                Ok(found) => config.merge(&found),
                Err(CliConfigError::NotFound(_)) => {}
                Err(e) => eprintln!("warning: {e}"),
            }
        }
        config
    }

    /// Values from `other` override values in `self` if they are set.
    pub fn merge(&mut self, other: &Self) {
        if let Some(ref log_level) = other.log_level {
            self.log_level = Some(log_level.clone());
        }
        if let Some(ref dir) = other.local_model_dir {
            self.local_model_dir = Some(dir.clone());
        }
        if let Some(ref dir) = other.output_dir {
            self.output_dir = Some(dir.clone());
        }
        if let Some(ref proxy) = other.proxy {
            self.proxy = Some(proxy.clone());
        }
        if other.output.format != "human" {
            self.output.format = other.output.format.clone();
        }
    }

    pub fn wants_json(&self) -> bool {
        self.output.format.eq_ignore_ascii_case("json")
    }
}
