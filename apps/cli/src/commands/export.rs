//! Export command implementation.

use crate::config::CliConfig;
use anyhow::{Context, Result};
use chrono::Local;
use colored::Colorize;
use std::path::PathBuf;
use tuneforge_training::{export_model, RunLayout, RunManifest};

/// Export the best checkpoint of the run recorded in `<output>/run_manifest.json`.
pub fn execute(output: Option<String>, json_output: bool, cli_config: &CliConfig) -> Result<()> {
    let output = PathBuf::from(output.or_else(|| cli_config.output_dir.clone()).unwrap_or_else(|| "./output".to_string()));
    let layout = RunLayout::new(&output);

    let manifest = RunManifest::read(&layout.manifest_path())
        .with_context(|| format!("No finished run found in {}", output.display()))?;

    // The run directory may have moved since training.
    let mut config = manifest.config.clone();
    config.output_dir.clone_from(&output);

    let report = export_model(&config).context("Failed to export model")?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    println!("{} {}", "✓".green(), "Model exported".bold());
    println!("  Run:      {} ({})", manifest.run_id.to_string().dimmed(), manifest.phase);
    println!("  Finished: {}", manifest.finished_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"));
    if let Some(best) = manifest.best_loss {
        println!("  Best loss: {best:.4}");
    }
    println!("  Source:   {}", report.source.display());
    println!("  Exported: {}", report.export_dir.display().to_string().green());
    for file in &report.files {
        println!("    {}  {}", file.sha256.get(..12).unwrap_or(&file.sha256).dimmed(), file.path.display());
    }
    println!();
    Ok(())
}
