//! Shared argument types for tuneforge commands.

use crate::config::CliConfig;
use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use tuneforge_training::RawRunConfig;

/// Run settings accepted by `train` and `validate`.
///
/// Layering: built-in defaults, then the CLI config file, then `--config`,
/// then individual flags.
#[derive(Args, Debug, Clone, Default)]
pub struct RunOptions {
    /// TOML file with run settings
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Base model identifier or path
    #[arg(short, long)]
    pub model: Option<String>,

    /// Training data (JSON array or JSONL of {"text": ...})
    #[arg(short, long)]
    pub dataset: Option<String>,

    /// Output directory for checkpoints
    #[arg(short, long)]
    pub output: Option<String>,

    #[arg(long)]
    pub learning_rate: Option<String>,

    #[arg(long)]
    pub batch_size: Option<String>,

    #[arg(short, long)]
    pub epochs: Option<String>,

    #[arg(long)]
    pub max_length: Option<String>,

    #[arg(long)]
    pub grad_accum: Option<String>,

    #[arg(long)]
    pub optimizer: Option<String>,

    #[arg(long)]
    pub scheduler: Option<String>,

    #[arg(long)]
    pub weight_decay: Option<String>,

    /// none, 4bit or 8bit
    #[arg(long)]
    pub quantization: Option<String>,

    /// fp16, bf16 or fp32
    #[arg(long)]
    pub precision: Option<String>,

    /// Train all weights instead of a LoRA adapter
    #[arg(long)]
    pub no_lora: bool,

    #[arg(long)]
    pub lora_rank: Option<String>,

    /// Load the model from the local model directory only
    #[arg(long)]
    pub offline: bool,

    #[arg(long)]
    pub local_model_dir: Option<String>,

    #[arg(long)]
    pub max_retries: Option<String>,

    /// Base retry backoff in seconds
    #[arg(long)]
    pub retry_backoff: Option<String>,

    #[arg(long)]
    pub proxy: Option<String>,

    /// Connection timeout in seconds
    #[arg(long)]
    pub timeout: Option<String>,

    #[arg(long)]
    pub packing: bool,

    #[arg(long)]
    pub num_proc: Option<String>,
}

impl RunOptions {
    pub fn to_raw(&self, cli_config: &CliConfig) -> Result<RawRunConfig> {
        let mut raw = RawRunConfig::default();
        if let Some(dir) = &cli_config.local_model_dir {
            raw.local_model_dir.clone_from(dir);
        }
        if let Some(dir) = &cli_config.output_dir {
            raw.output_dir.clone_from(dir);
        }
        if let Some(proxy) = &cli_config.proxy {
            raw.proxy.clone_from(proxy);
        }

        if let Some(path) = &self.config {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read run configuration {}", path.display()))?;
            let from_file: RawRunConfig = toml::from_str(&content)
                .with_context(|| format!("Failed to parse run configuration {}", path.display()))?;
            raw = overlay_file(raw, from_file, &content);
        }

        let text_flags = [
            (&self.model, &mut raw.model_id),
            (&self.dataset, &mut raw.dataset_path),
            (&self.output, &mut raw.output_dir),
            (&self.learning_rate, &mut raw.learning_rate),
            (&self.batch_size, &mut raw.batch_size),
            (&self.epochs, &mut raw.epochs),
            (&self.max_length, &mut raw.max_length),
            (&self.grad_accum, &mut raw.gradient_accumulation_steps),
            (&self.optimizer, &mut raw.optimizer),
            (&self.scheduler, &mut raw.scheduler),
            (&self.weight_decay, &mut raw.weight_decay),
            (&self.quantization, &mut raw.quantization),
            (&self.precision, &mut raw.precision),
            (&self.lora_rank, &mut raw.lora_rank),
            (&self.local_model_dir, &mut raw.local_model_dir),
            (&self.max_retries, &mut raw.max_retries),
            (&self.retry_backoff, &mut raw.retry_backoff_secs),
            (&self.proxy, &mut raw.proxy),
            (&self.timeout, &mut raw.timeout_secs),
            (&self.num_proc, &mut raw.num_proc),
        ];
        for (flag, slot) in text_flags {
            if let Some(value) = flag {
                slot.clone_from(value);
            }
        }

        if self.no_lora {
            raw.use_lora = false;
        }
        if self.offline {
            raw.offline = true;
        }
        if self.packing {
            raw.packing = true;
        }
        Ok(raw)
    }
}

/// Keeps CLI-config defaults for keys the run file leaves out.
fn overlay_file(base: RawRunConfig, mut from_file: RawRunConfig, content: &str) -> RawRunConfig {
    let keys: Option<toml::Table> = toml::from_str(content).ok();
    let has = |key: &str| keys.as_ref().is_some_and(|t| t.contains_key(key));
    if !has("local_model_dir") {
        from_file.local_model_dir = base.local_model_dir;
    }
    if !has("output_dir") {
        from_file.output_dir = base.output_dir;
    }
    if !has("proxy") {
        from_file.proxy = base.proxy;
    }
    from_file
}
