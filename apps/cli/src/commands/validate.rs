//! Validate command implementation.
//!
//! Runs the same checks `train` does before a run starts, without loading a
//! model or reading the dataset.

use crate::commands::types::RunOptions;
use crate::config::CliConfig;
use anyhow::Result;
use colored::Colorize;
use serde_json::json;
use tuneforge_training::{ResourceMode, RunConfig};

pub fn execute(options: &RunOptions, json: bool, cli_config: &CliConfig) -> Result<()> {
    let raw = options.to_raw(cli_config)?;

    let config = match RunConfig::from_raw(&raw) {
        Ok(config) => config,
        Err(e) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&json!({ "valid": false, "error": e }))?);
            } else {
                println!("{} {}", "✗".red(), "Configuration is invalid".bold());
                println!("  Field:  {}", e.field.to_string().yellow());
                println!("  Reason: {}", e.message);
            }
            anyhow::bail!("invalid {}", e.field);
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&json!({ "valid": true, "config": config }))?);
        return Ok(());
    }

    let hp = &config.hyperparams;
    println!("{} {}", "✓".green(), "Configuration is valid".bold());
    println!("  Model:          {}", config.model_id.cyan());
    println!("  Dataset:        {}", config.dataset_path.display());
    println!("  Output:         {}", config.output_dir.display());
    println!(
        "  Schedule:       {} epoch(s), batch {}, grad accum {}, lr {:.2e}",
        hp.epochs, hp.batch_size, hp.gradient_accumulation_steps, hp.learning_rate
    );
    println!("  Weights:        {}", config.weight_format());
    if config.lora.enabled {
        println!("  LoRA:           rank {}", config.lora.rank);
    } else {
        println!("  LoRA:           off");
    }
    match &config.resource_mode {
        ResourceMode::Online => println!("  Resources:      online"),
        ResourceMode::Offline { local_model_dir } => {
            println!("  Resources:      offline ({})", local_model_dir.display());
        }
    }
    Ok(())
}
