//! Models command implementation.

use crate::config::CliConfig;
use anyhow::{Context, Result};
use colored::Colorize;
use std::path::PathBuf;
use tuneforge_training::scan_local_models;

/// List models found in the local model directory.
pub fn execute(dir: Option<String>, json_output: bool, cli_config: &CliConfig) -> Result<()> {
    let dir = dir
        .or_else(|| cli_config.local_model_dir.clone())
        .context("No model directory given; pass --dir or set local_model_dir in the CLI config")?;
    let dir = PathBuf::from(dir);

    let models = scan_local_models(&dir).with_context(|| format!("Failed to scan {}", dir.display()))?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&models)?);
        return Ok(());
    }

    println!();
    println!("{}", format!("Local Models ({})", models.len()).bold().cyan());
    println!("  {}", dir.display().to_string().dimmed());
    println!();

    if models.is_empty() {
        println!("  {}", "No models found.".dimmed());
        println!();
        return Ok(());
    }

    println!("{:<24} {:<28} {:<22} {:<10} {}", "Name", "Base model", "Architecture", "Params", "Modified");
    println!("{}", "─".repeat(100));

    for model in &models {
        let modified =
            model.last_modified.map_or_else(|| "-".to_string(), |t| t.format("%Y-%m-%d %H:%M").to_string());
        println!(
            "{:<24} {:<28} {:<22} {:<10} {}",
            model.name.cyan(),
            model.base_model.as_deref().unwrap_or("-"),
            model.architecture.as_deref().unwrap_or("-").dimmed(),
            model.parameters_display(),
            modified.dimmed()
        );
    }

    println!();
    Ok(())
}
