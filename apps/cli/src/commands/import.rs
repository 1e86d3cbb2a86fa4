//! Import command implementation.

use crate::commands::types::RunOptions;
use crate::config::CliConfig;
use anyhow::{Context, Result};
use colored::Colorize;
use std::path::{Path, PathBuf};
use tuneforge_training::import_snapshot;

/// Build run settings from an exported model's `config.json`.
///
/// Starts from `base` (or the defaults), overlays the fields the snapshot
/// carries, and prints the result as TOML or writes it to `write`.
pub fn execute(model_dir: &Path, base: Option<PathBuf>, write: Option<PathBuf>, cli_config: &CliConfig) -> Result<()> {
    let mut raw = RunOptions { config: base, ..RunOptions::default() }.to_raw(cli_config)?;

    import_snapshot(model_dir, &mut raw)
        .with_context(|| format!("Failed to import settings from {}", model_dir.display()))?;

    let rendered = toml::to_string_pretty(&raw).context("Failed to render run settings")?;

    match write {
        Some(path) => {
            std::fs::write(&path, rendered).with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("{} Run settings written to {}", "✓".green(), path.display().to_string().cyan());
        }
        None => print!("{rendered}"),
    }
    Ok(())
}
