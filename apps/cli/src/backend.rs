//! Local character-bigram backend.
//!
//! A small but real model: a bigram logit table trained with softmax
//! cross-entropy and SGD. With LoRA enabled only a low-rank delta is trained
//! and merged on save. Lets the CLI drive complete runs without an external
//! ML runtime.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};
use tuneforge_training::{
    AdapterSpec, BackendError, BackendResult, Dataset, EpochParams, EpochStats, LoadRequest, ModelBackend, Precision,
    WeightFormat,
};

const WEIGHTS_FILE: &str = "bigram.json";
const TOKENIZER_FILE: &str = "tokenizer.json";

/// Printable ASCII plus newline. Everything else maps to the last slot.
fn default_vocab() -> Vec<char> {
    let mut vocab: Vec<char> = (' '..='~').collect();
    vocab.push('\n');
    vocab.push('\u{fffd}');
    vocab
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharTokenizer {
    vocab: Vec<char>,
    #[serde(skip)]
    index: HashMap<char, usize>,
}

impl CharTokenizer {
    fn new(vocab: Vec<char>) -> Self {
        let index = vocab.iter().enumerate().map(|(i, c)| (*c, i)).collect();
        Self { vocab, index }
    }

    fn unknown(&self) -> usize {
        self.vocab.len() - 1
    }

    fn encode(&self, text: &str, max_length: usize) -> Vec<usize> {
        text.chars().take(max_length).map(|c| self.index.get(&c).copied().unwrap_or_else(|| self.unknown())).collect()
    }

    fn len(&self) -> usize {
        self.vocab.len()
    }
}

/// Rank-r update `A · B` added to the base logits.
#[derive(Debug, Clone, Default)]
struct LowRank {
    a: Vec<Vec<f64>>,
    b: Vec<Vec<f64>>,
}

impl LowRank {
    fn new(n: usize, rank: usize) -> Self {
        // Deterministic small init for A, zero B: the delta starts at zero.
        let a = (0..n)
            .map(|i| (0..rank).map(|k| (((i * 31 + k * 17) % 13) as f64 / 13.0 - 0.5) * 0.02).collect())
            .collect();
        Self { a, b: vec![vec![0.0; n]; rank] }
    }

    fn delta(&self, row: usize, col: usize) -> f64 {
        self.a[row].iter().zip(&self.b).map(|(a, b_row)| a * b_row[col]).sum()
    }
}

#[derive(Debug, Clone, Default)]
pub struct BigramModel {
    logits: Vec<Vec<f64>>,
    adapter: Option<LowRank>,
    format: Option<WeightFormat>,
}

#[derive(Serialize, Deserialize)]
struct StoredWeights {
    logits: Vec<Vec<f64>>,
    weight_format: Option<WeightFormat>,
}

impl BigramModel {
    fn fresh(n: usize) -> Self {
        Self { logits: vec![vec![0.0; n]; n], adapter: None, format: None }
    }

    fn size(&self) -> usize {
        self.logits.len()
    }

    fn effective_row(&self, row: usize) -> Vec<f64> {
        let base = &self.logits[row];
        match &self.adapter {
            Some(lora) => base.iter().enumerate().map(|(col, v)| v + lora.delta(row, col)).collect(),
            None => base.clone(),
        }
    }

    fn merged(&self) -> Vec<Vec<f64>> {
        (0..self.size()).map(|row| self.effective_row(row)).collect()
    }

    /// One pass over `sequences`. Returns the mean negative log-likelihood.
    fn train_pass(&mut self, sequences: &[Vec<usize>], params: &EpochParams, lr: f64) -> f64 {
        let n = self.size();
        let batch_size = params.batch_size.max(1) as usize;
        let accumulate = params.gradient_accumulation_steps.max(1) as usize;

        let mut grad = vec![vec![0.0; n]; n];
        let mut pending_tokens = 0usize;
        let mut total_nll = 0.0;
        let mut total_tokens = 0usize;

        for (step, batch) in sequences.chunks(batch_size).enumerate() {
            for seq in batch {
                for pair in seq.windows(2) {
                    let (prev, next) = (pair[0], pair[1]);
                    let probs = softmax(&self.effective_row(prev));
                    total_nll -= probs[next].max(f64::MIN_POSITIVE).ln();
                    for (col, p) in probs.iter().enumerate() {
                        grad[prev][col] += p - if col == next { 1.0 } else { 0.0 };
                    }
                    pending_tokens += 1;
                    total_tokens += 1;
                }
            }

            if (step + 1) % accumulate == 0 && pending_tokens > 0 {
                self.apply_gradient(&mut grad, pending_tokens, lr, params.weight_decay);
                pending_tokens = 0;
            }
        }
        if pending_tokens > 0 {
            self.apply_gradient(&mut grad, pending_tokens, lr, params.weight_decay);
        }

        if total_tokens == 0 { 0.0 } else { total_nll / total_tokens as f64 }
    }

    fn apply_gradient(&mut self, grad: &mut [Vec<f64>], tokens: usize, lr: f64, weight_decay: f64) {
        let scale = 1.0 / tokens as f64;
        match &mut self.adapter {
            Some(lora) => {
                let rank = lora.b.len();
                // dL/dA = G · Bᵀ, dL/dB = Aᵀ · G
                let grad_a: Vec<Vec<f64>> = grad
                    .iter()
                    .map(|g_row| {
                        (0..rank).map(|k| g_row.iter().zip(&lora.b[k]).map(|(g, b)| g * b).sum::<f64>()).collect()
                    })
                    .collect();
                let grad_b: Vec<Vec<f64>> = (0..rank)
                    .map(|k| {
                        (0..grad[0].len())
                            .map(|col| grad.iter().zip(&lora.a).map(|(g_row, a_row)| a_row[k] * g_row[col]).sum())
                            .collect()
                    })
                    .collect();
                for (row, g_row) in lora.a.iter_mut().zip(&grad_a) {
                    for (w, g) in row.iter_mut().zip(g_row) {
                        *w -= lr * (g * scale + weight_decay * *w);
                    }
                }
                for (row, g_row) in lora.b.iter_mut().zip(&grad_b) {
                    for (w, g) in row.iter_mut().zip(g_row) {
                        *w -= lr * (g * scale + weight_decay * *w);
                    }
                }
            }
            None => {
                for (row, g_row) in self.logits.iter_mut().zip(grad.iter()) {
                    for (w, g) in row.iter_mut().zip(g_row) {
                        *w -= lr * (g * scale + weight_decay * *w);
                    }
                }
            }
        }
        for row in grad.iter_mut() {
            row.fill(0.0);
        }
    }

    fn apply_format(&mut self, format: WeightFormat) {
        let levels = match format {
            WeightFormat::FourBit => Some(16.0),
            WeightFormat::EightBit => Some(256.0),
            WeightFormat::Precision(Precision::Fp32) => None,
            WeightFormat::Precision(Precision::Fp16 | Precision::Bf16) => {
                for w in self.logits.iter_mut().flatten() {
                    *w = f64::from(*w as f32);
                }
                None
            }
        };
        if let Some(levels) = levels {
            quantize(&mut self.logits, levels);
        }
        self.format = Some(format);
    }
}

fn softmax(row: &[f64]) -> Vec<f64> {
    let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = row.iter().map(|v| (v - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

fn quantize(weights: &mut [Vec<f64>], levels: f64) {
    let (min, max) = weights
        .iter()
        .flatten()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), w| (lo.min(*w), hi.max(*w)));
    let range = max - min;
    if !range.is_finite() || range == 0.0 {
        return;
    }
    let step = range / (levels - 1.0);
    for w in weights.iter_mut().flatten() {
        *w = min + ((*w - min) / step).round() * step;
    }
}

/// Learning rate for `epoch` under the named scheduler.
fn scheduled_lr(params: &EpochParams) -> f64 {
    match params.scheduler.as_str() {
        "linear" => {
            let remaining = f64::from(params.total_epochs - params.epoch + 1) / f64::from(params.total_epochs.max(1));
            params.learning_rate * remaining
        }
        "cosine" => {
            let progress = f64::from(params.epoch - 1) / f64::from(params.total_epochs.max(1));
            params.learning_rate * 0.5 * (1.0 + (std::f64::consts::PI * progress).cos())
        }
        _ => params.learning_rate,
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> BackendResult<T> {
    let bytes = std::fs::read(path).map_err(|e| BackendError::Load(format!("{}: {e}", path.display())))?;
    serde_json::from_slice(&bytes).map_err(|e| BackendError::Load(format!("{}: {e}", path.display())))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> BackendResult<()> {
    let json = serde_json::to_string_pretty(value).map_err(|e| BackendError::Save(e.to_string()))?;
    std::fs::write(path, json).map_err(|e| BackendError::Save(format!("{}: {e}", path.display())))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BigramBackend;

impl BigramBackend {
    fn load_from(dir: &Path) -> BackendResult<(BigramModel, CharTokenizer)> {
        let weights: StoredWeights = read_json(&dir.join(WEIGHTS_FILE))?;
        let tokenizer: CharTokenizer = read_json(&dir.join(TOKENIZER_FILE))?;
        let tokenizer = CharTokenizer::new(tokenizer.vocab);
        if weights.logits.len() != tokenizer.len() || weights.logits.iter().any(|r| r.len() != tokenizer.len()) {
            return Err(BackendError::Load(format!("weights in {} do not match the tokenizer", dir.display())));
        }
        let model = BigramModel { logits: weights.logits, adapter: None, format: weights.weight_format };
        Ok((model, tokenizer))
    }
}

#[async_trait]
impl ModelBackend for BigramBackend {
    type Model = BigramModel;
    type Tokenizer = CharTokenizer;

    fn id(&self) -> &'static str {
        "bigram"
    }

    async fn load(&self, request: &LoadRequest) -> BackendResult<(BigramModel, CharTokenizer)> {
        debug!(proxy = ?request.network.proxy, timeout = ?request.network.timeout, "Bigram backend ignores network settings");

        let source = request.local_path.clone().or_else(|| {
            let candidate = Path::new(&request.model_id);
            candidate.join(WEIGHTS_FILE).is_file().then(|| candidate.to_path_buf())
        });

        let (mut model, tokenizer) = match source {
            Some(dir) => {
                info!(path = %dir.display(), "Loading bigram checkpoint");
                Self::load_from(&dir)?
            }
            None => {
                info!(model_id = %request.model_id, "Initializing new bigram model");
                let tokenizer = CharTokenizer::new(default_vocab());
                (BigramModel::fresh(tokenizer.len()), tokenizer)
            }
        };
        model.apply_format(request.weight_format);
        Ok((model, tokenizer))
    }

    async fn apply_adapter(&self, mut model: BigramModel, adapter: &AdapterSpec) -> BackendResult<BigramModel> {
        let rank = adapter.rank as usize;
        if rank == 0 || rank > model.size() {
            return Err(BackendError::Adapter(format!("rank {rank} is out of range for vocab {}", model.size())));
        }
        model.adapter = Some(LowRank::new(model.size(), rank));
        Ok(model)
    }

    async fn train_epoch(
        &self,
        model: &mut BigramModel,
        dataset: &Dataset,
        params: &EpochParams,
    ) -> BackendResult<EpochStats> {
        let tokenizer = CharTokenizer::new(default_vocab());
        if tokenizer.len() != model.size() {
            return Err(BackendError::Train("model was not built for the default vocabulary".to_string()));
        }
        let max_length = params.max_length as usize;
        let sequences: Vec<Vec<usize>> = dataset.iter().map(|r| tokenizer.encode(&r.text, max_length)).collect();
        let lr = scheduled_lr(params);
        debug!(epoch = params.epoch, lr, optimizer = %params.optimizer, sequences = sequences.len(), "Bigram epoch");

        let mut owned = std::mem::take(model);
        let params = params.clone();
        let (owned, loss) = tokio::task::spawn_blocking(move || {
            let loss = owned.train_pass(&sequences, &params, lr);
            (owned, loss)
        })
        .await
        .map_err(|e| BackendError::Train(format!("training task failed: {e}")))?;
        *model = owned;

        Ok(EpochStats { loss, learning_rate: Some(lr) })
    }

    async fn save(&self, model: &BigramModel, tokenizer: &CharTokenizer, path: &Path) -> BackendResult<()> {
        std::fs::create_dir_all(path).map_err(|e| BackendError::Save(format!("{}: {e}", path.display())))?;
        write_json(&path.join(WEIGHTS_FILE), &StoredWeights { logits: model.merged(), weight_format: model.format })?;
        write_json(&path.join(TOKENIZER_FILE), tokenizer)
    }
}
