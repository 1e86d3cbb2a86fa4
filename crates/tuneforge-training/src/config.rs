//! Run configuration.
//!
//! [`RawRunConfig`] is the untyped form handed over by a form or a settings
//! document. [`RunConfig::from_raw`] turns it into the immutable, validated
//! [`RunConfig`] captured once at run start.

use crate::error::{ConfigField, ValidationError};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Modules wrapped by LoRA adapters when none are configured.
pub const DEFAULT_LORA_TARGET_MODULES: &[&str] =
    &["q_proj", "k_proj", "v_proj", "o_proj", "gate_proj", "up_proj", "down_proj"];

/// Raw configuration values as received from the presentation layer.
///
/// Numeric fields are kept as text; when deserialized they also accept plain
/// TOML/JSON numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawRunConfig {
    pub model_id: String,
    pub dataset_path: String,
    pub output_dir: String,
    #[serde(deserialize_with = "de_text")]
    pub learning_rate: String,
    #[serde(deserialize_with = "de_text")]
    pub batch_size: String,
    #[serde(deserialize_with = "de_text")]
    pub epochs: String,
    #[serde(deserialize_with = "de_text")]
    pub max_length: String,
    #[serde(deserialize_with = "de_text")]
    pub gradient_accumulation_steps: String,
    pub optimizer: String,
    pub scheduler: String,
    #[serde(deserialize_with = "de_text")]
    pub weight_decay: String,
    pub quantization: String,
    pub precision: String,
    pub use_lora: bool,
    #[serde(deserialize_with = "de_text")]
    pub lora_rank: String,
    pub lora_target_modules: Vec<String>,
    pub offline: bool,
    pub local_model_dir: String,
    #[serde(deserialize_with = "de_text")]
    pub max_retries: String,
    #[serde(deserialize_with = "de_text")]
    pub retry_backoff_secs: String,
    pub proxy: String,
    #[serde(deserialize_with = "de_text")]
    pub timeout_secs: String,
    pub packing: bool,
    #[serde(deserialize_with = "de_text")]
    pub num_proc: String,
}

impl Default for RawRunConfig {
    fn default() -> Self {
        Self {
            model_id: "meta-llama/Llama-2-7b-hf".to_string(),
            dataset_path: String::new(),
            output_dir: "./output".to_string(),
            learning_rate: "2e-5".to_string(),
            batch_size: "4".to_string(),
            epochs: "3".to_string(),
            max_length: "512".to_string(),
            gradient_accumulation_steps: "4".to_string(),
            optimizer: "adamw_8bit".to_string(),
            scheduler: "linear".to_string(),
            weight_decay: "0.01".to_string(),
            quantization: "none".to_string(),
            precision: "fp16".to_string(),
            use_lora: true,
            lora_rank: "8".to_string(),
            lora_target_modules: Vec::new(),
            offline: false,
            local_model_dir: String::new(),
            max_retries: "3".to_string(),
            retry_backoff_secs: "5".to_string(),
            proxy: String::new(),
            timeout_secs: "30".to_string(),
            packing: false,
            num_proc: "2".to_string(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

fn de_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Scalar::deserialize(deserializer)? {
        Scalar::Text(s) => s,
        Scalar::Int(i) => i.to_string(),
        Scalar::Float(f) => f.to_string(),
        Scalar::Bool(b) => b.to_string(),
    })
}

/// Weight quantization applied at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QuantizationMode {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "4bit")]
    FourBit,
    #[serde(rename = "8bit")]
    EightBit,
}

impl FromStr for QuantizationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "4bit" | "int4" | "nf4" => Ok(Self::FourBit),
            "8bit" | "int8" => Ok(Self::EightBit),
            other => Err(format!("unknown quantization mode '{other}' (expected none, 4bit or 8bit)")),
        }
    }
}

/// Floating point precision used when no quantization is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    Fp16,
    Bf16,
    Fp32,
}

impl FromStr for Precision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fp16" | "float16" => Ok(Self::Fp16),
            "bf16" | "bfloat16" => Ok(Self::Bf16),
            "fp32" | "float32" => Ok(Self::Fp32),
            other => Err(format!("unknown precision '{other}' (expected fp16, bf16 or fp32)")),
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fp16 => "fp16",
            Self::Bf16 => "bf16",
            Self::Fp32 => "fp32",
        })
    }
}

/// The single active weight representation for a load.
///
/// 4-bit and 8-bit quantization override the precision preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", content = "precision", rename_all = "snake_case")]
pub enum WeightFormat {
    FourBit,
    EightBit,
    Precision(Precision),
}

impl fmt::Display for WeightFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FourBit => f.write_str("4bit"),
            Self::EightBit => f.write_str("8bit"),
            Self::Precision(p) => p.fmt(f),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoraSettings {
    pub enabled: bool,
    pub rank: u32,
    pub target_modules: Vec<String>,
}

/// Where model weights come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ResourceMode {
    Online,
    Offline { local_model_dir: PathBuf },
}

/// Bounded retry with linear backoff (`attempt * base_backoff`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    /// Delay applied after the failed attempt `attempt` (1-based).
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.base_backoff.saturating_mul(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, base_backoff: Duration::from_secs(5) }
    }
}

/// Network values handed to the backend untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSettings {
    pub proxy: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperParams {
    pub learning_rate: f64,
    pub batch_size: u32,
    pub epochs: u32,
    pub max_length: u32,
    pub gradient_accumulation_steps: u32,
    pub optimizer: String,
    pub scheduler: String,
    pub weight_decay: f64,
    pub packing: bool,
    pub num_proc: u32,
}

/// Validated, immutable configuration for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub model_id: String,
    pub dataset_path: PathBuf,
    pub output_dir: PathBuf,
    pub hyperparams: HyperParams,
    pub quantization: QuantizationMode,
    pub precision: Precision,
    pub lora: LoraSettings,
    pub resource_mode: ResourceMode,
    pub retry: RetryPolicy,
    pub network: NetworkSettings,
}

impl RunConfig {
    /// Validate raw input.
    ///
    /// Checks run in a fixed order and the first failure wins: model id,
    /// dataset path, learning rate, batch size, epochs, max length, LoRA rank
    /// (only when LoRA is enabled), gradient accumulation, then the remaining
    /// fields.
    pub fn from_raw(raw: &RawRunConfig) -> Result<Self, ValidationError> {
        let model_id = raw.model_id.trim();
        if model_id.is_empty() {
            return Err(ValidationError::new(ConfigField::ModelId, "model identifier is required"));
        }

        let dataset_path = check_dataset_path(&raw.dataset_path)?;

        let learning_rate = parse_f64(ConfigField::LearningRate, &raw.learning_rate)?;
        if !(learning_rate > 0.0 && learning_rate < 1.0) {
            return Err(ValidationError::new(ConfigField::LearningRate, "must be between 0 and 1 (exclusive)"));
        }

        let batch_size = parse_positive(ConfigField::BatchSize, &raw.batch_size)?;
        let epochs = parse_positive(ConfigField::Epochs, &raw.epochs)?;
        let max_length = parse_positive(ConfigField::MaxLength, &raw.max_length)?;

        let lora_rank = if raw.use_lora { parse_positive(ConfigField::LoraRank, &raw.lora_rank)? } else { 0 };

        let gradient_accumulation_steps =
            parse_positive(ConfigField::GradientAccumulationSteps, &raw.gradient_accumulation_steps)?;

        let weight_decay = parse_f64(ConfigField::WeightDecay, &raw.weight_decay)?;
        if weight_decay < 0.0 {
            return Err(ValidationError::new(ConfigField::WeightDecay, "must be >= 0"));
        }

        let quantization = QuantizationMode::from_str(&raw.quantization)
            .map_err(|e| ValidationError::new(ConfigField::QuantizationMode, e))?;
        let precision =
            Precision::from_str(&raw.precision).map_err(|e| ValidationError::new(ConfigField::Precision, e))?;

        let resource_mode = if raw.offline {
            let dir = raw.local_model_dir.trim();
            if dir.is_empty() {
                return Err(ValidationError::new(
                    ConfigField::LocalModelDir,
                    "a local model directory is required in offline mode",
                ));
            }
            ResourceMode::Offline { local_model_dir: PathBuf::from(dir) }
        } else {
            ResourceMode::Online
        };

        let max_attempts = parse_positive(ConfigField::MaxRetries, &raw.max_retries)?;
        let backoff_secs = parse_f64(ConfigField::RetryBackoff, &raw.retry_backoff_secs)?;
        if backoff_secs < 0.0 {
            return Err(ValidationError::new(ConfigField::RetryBackoff, "must be >= 0"));
        }
        let base_backoff = Duration::try_from_secs_f64(backoff_secs)
            .map_err(|e| ValidationError::new(ConfigField::RetryBackoff, e.to_string()))?;

        let timeout_secs = parse_positive(ConfigField::Timeout, &raw.timeout_secs)?;
        let num_proc = parse_positive(ConfigField::NumProc, &raw.num_proc)?;

        let target_modules = if raw.lora_target_modules.is_empty() {
            DEFAULT_LORA_TARGET_MODULES.iter().map(|m| (*m).to_string()).collect()
        } else {
            raw.lora_target_modules.clone()
        };

        let proxy = raw.proxy.trim();
        let output_dir = if raw.output_dir.trim().is_empty() { "./output" } else { raw.output_dir.trim() };

        Ok(Self {
            model_id: model_id.to_string(),
            dataset_path,
            output_dir: PathBuf::from(output_dir),
            hyperparams: HyperParams {
                learning_rate,
                batch_size,
                epochs,
                max_length,
                gradient_accumulation_steps,
                optimizer: raw.optimizer.trim().to_string(),
                scheduler: raw.scheduler.trim().to_string(),
                weight_decay,
                packing: raw.packing,
                num_proc,
            },
            quantization,
            precision,
            lora: LoraSettings { enabled: raw.use_lora, rank: lora_rank, target_modules },
            resource_mode,
            retry: RetryPolicy { max_attempts, base_backoff },
            network: NetworkSettings {
                proxy: (!proxy.is_empty()).then(|| proxy.to_string()),
                timeout: Duration::from_secs(u64::from(timeout_secs)),
            },
        })
    }

    /// Exactly one of 4-bit, 8-bit or the precision preference is active.
    #[must_use]
    pub fn weight_format(&self) -> WeightFormat {
        match self.quantization {
            QuantizationMode::FourBit => WeightFormat::FourBit,
            QuantizationMode::EightBit => WeightFormat::EightBit,
            QuantizationMode::None => WeightFormat::Precision(self.precision),
        }
    }
}

fn check_dataset_path(raw: &str) -> Result<PathBuf, ValidationError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ValidationError::new(ConfigField::DatasetPath, "a training data file is required"));
    }
    let path = Path::new(raw);
    if !path.is_file() {
        return Err(ValidationError::new(
            ConfigField::DatasetPath,
            format!("training data file does not exist: {}", path.display()),
        ));
    }
    std::fs::File::open(path).map_err(|e| {
        ValidationError::new(ConfigField::DatasetPath, format!("cannot read {}: {e}", path.display()))
    })?;
    Ok(path.to_path_buf())
}

fn parse_f64(field: ConfigField, raw: &str) -> Result<f64, ValidationError> {
    let value: f64 = raw
        .trim()
        .parse()
        .map_err(|_| ValidationError::new(field, format!("'{}' is not a number", raw.trim())))?;
    if !value.is_finite() {
        return Err(ValidationError::new(field, "must be a finite number"));
    }
    Ok(value)
}

fn parse_positive(field: ConfigField, raw: &str) -> Result<u32, ValidationError> {
    let value: i64 = raw
        .trim()
        .parse()
        .map_err(|_| ValidationError::new(field, format!("'{}' is not an integer", raw.trim())))?;
    if value <= 0 {
        return Err(ValidationError::new(field, "must be > 0"));
    }
    u32::try_from(value).map_err(|_| ValidationError::new(field, "value is too large"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn raw_with_dataset(temp: &TempDir) -> RawRunConfig {
        let path = temp.path().join("train.json");
        std::fs::write(&path, r#"[{"text": "hello"}]"#).unwrap();
        RawRunConfig { dataset_path: path.to_string_lossy().to_string(), ..RawRunConfig::default() }
    }

    #[test]
    fn test_defaults_validate() {
        let temp = TempDir::new().unwrap();
        let config = RunConfig::from_raw(&raw_with_dataset(&temp)).unwrap();
        assert_eq!(config.hyperparams.epochs, 3);
        assert_eq!(config.lora.rank, 8);
        assert_eq!(config.lora.target_modules.len(), 7);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_backoff, Duration::from_secs(5));
        assert_eq!(config.resource_mode, ResourceMode::Online);
        assert!(config.network.proxy.is_none());
    }

    #[test]
    fn test_each_single_violation_names_its_field() {
        let temp = TempDir::new().unwrap();
        let base = raw_with_dataset(&temp);

        let cases: [(ConfigField, fn(&mut RawRunConfig)); 16] = [
            (ConfigField::ModelId, (|r: &mut RawRunConfig| r.model_id = "  ".to_string())),
            (ConfigField::DatasetPath, (|r: &mut RawRunConfig| r.dataset_path = "/definitely/missing.json".to_string())),
            (ConfigField::LearningRate, (|r: &mut RawRunConfig| r.learning_rate = "1.0".to_string())),
            (ConfigField::LearningRate, (|r: &mut RawRunConfig| r.learning_rate = "0".to_string())),
            (ConfigField::BatchSize, (|r: &mut RawRunConfig| r.batch_size = "0".to_string())),
            (ConfigField::BatchSize, (|r: &mut RawRunConfig| r.batch_size = "2.5".to_string())),
            (ConfigField::Epochs, (|r: &mut RawRunConfig| r.epochs = "-1".to_string())),
            (ConfigField::MaxLength, (|r: &mut RawRunConfig| r.max_length = "abc".to_string())),
            (ConfigField::LoraRank, (|r: &mut RawRunConfig| r.lora_rank = "0".to_string())),
            (ConfigField::GradientAccumulationSteps, (|r: &mut RawRunConfig| r.gradient_accumulation_steps = "0".to_string())),
            (ConfigField::WeightDecay, (|r: &mut RawRunConfig| r.weight_decay = "-0.1".to_string())),
            (ConfigField::QuantizationMode, (|r: &mut RawRunConfig| r.quantization = "2bit".to_string())),
            (ConfigField::Precision, (|r: &mut RawRunConfig| r.precision = "fp8".to_string())),
            (ConfigField::LocalModelDir, (|r: &mut RawRunConfig| r.offline = true)),
            (ConfigField::MaxRetries, (|r: &mut RawRunConfig| r.max_retries = "0".to_string())),
            (ConfigField::RetryBackoff, (|r: &mut RawRunConfig| r.retry_backoff_secs = "-1".to_string())),
        ];

        for (field, mutate) in cases {
            let mut raw = base.clone();
            mutate(&mut raw);
            let err = RunConfig::from_raw(&raw).unwrap_err();
            assert_eq!(err.field, field, "unexpected field for {raw:?}");
        }
    }

    #[test]
    fn test_first_offending_field_wins() {
        let raw = RawRunConfig {
            model_id: String::new(),
            dataset_path: String::new(),
            batch_size: "0".to_string(),
            ..RawRunConfig::default()
        };
        assert_eq!(RunConfig::from_raw(&raw).unwrap_err().field, ConfigField::ModelId);

        let raw = RawRunConfig { batch_size: "0".to_string(), epochs: "0".to_string(), ..RawRunConfig::default() };
        assert_eq!(RunConfig::from_raw(&raw).unwrap_err().field, ConfigField::DatasetPath);
    }

    #[test]
    fn test_lora_rank_ignored_when_lora_disabled() {
        let temp = TempDir::new().unwrap();
        let raw = RawRunConfig { use_lora: false, lora_rank: "0".to_string(), ..raw_with_dataset(&temp) };
        let config = RunConfig::from_raw(&raw).unwrap();
        assert!(!config.lora.enabled);
    }

    #[test]
    fn test_quantization_overrides_precision() {
        let temp = TempDir::new().unwrap();
        let mut raw = raw_with_dataset(&temp);
        raw.precision = "bf16".to_string();
        assert_eq!(RunConfig::from_raw(&raw).unwrap().weight_format(), WeightFormat::Precision(Precision::Bf16));

        raw.quantization = "4bit".to_string();
        assert_eq!(RunConfig::from_raw(&raw).unwrap().weight_format(), WeightFormat::FourBit);

        raw.quantization = "8bit".to_string();
        assert_eq!(RunConfig::from_raw(&raw).unwrap().weight_format(), WeightFormat::EightBit);
    }

    #[test]
    fn test_raw_config_accepts_numbers_and_strings() {
        let raw: RawRunConfig = serde_json::from_value(serde_json::json!({
            "model_id": "unsloth/Qwen2.5-0.5B",
            "learning_rate": 0.0002,
            "batch_size": 8,
            "epochs": "5",
        }))
        .unwrap();
        assert_eq!(raw.learning_rate, "0.0002");
        assert_eq!(raw.batch_size, "8");
        assert_eq!(raw.epochs, "5");
        assert_eq!(raw.max_length, "512");
    }

    #[test]
    fn test_retry_backoff_is_linear() {
        let policy = RetryPolicy { max_attempts: 3, base_backoff: Duration::from_millis(250) };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(250));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(500));
    }
}
