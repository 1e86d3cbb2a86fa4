use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

/// Stable identifier for a dataset (content hash).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetId(pub String);

impl std::fmt::Display for DatasetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single training record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextRecord {
    pub text: String,
}

/// A finite, restartable sequence of training records.
#[derive(Debug, Clone)]
pub struct Dataset {
    id: DatasetId,
    records: Vec<TextRecord>,
}

impl Dataset {
    pub fn from_records(records: Vec<TextRecord>) -> TrainingResult<Self> {
        validate_records(&records)?;
        let id = compute_dataset_id(&records)?;
        Ok(Self { id, records })
    }

    /// Reads a JSON array of `{"text": ...}` objects, or JSONL when the file
    /// extension is `.jsonl`.
    pub fn load(path: &Path) -> TrainingResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let is_jsonl = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("jsonl"));

        let records = if is_jsonl { parse_jsonl(&contents)? } else { parse_json_array(&contents)? };
        Self::from_records(records)
    }

    #[must_use]
    pub fn id(&self) -> &DatasetId {
        &self.id
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Starts a fresh pass over the records.
    pub fn iter(&self) -> std::slice::Iter<'_, TextRecord> {
        self.records.iter()
    }
}

impl<'a> IntoIterator for &'a Dataset {
    type Item = &'a TextRecord;
    type IntoIter = std::slice::Iter<'a, TextRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

fn parse_json_array(contents: &str) -> TrainingResult<Vec<TextRecord>> {
    serde_json::from_str::<Vec<TextRecord>>(contents)
        .map_err(|e| TrainingError::Dataset(format!("expected a JSON array of {{\"text\": ...}} records: {e}")))
}

fn parse_jsonl(contents: &str) -> TrainingResult<Vec<TextRecord>> {
    let mut records = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record: TextRecord = serde_json::from_str(line)
            .map_err(|e| TrainingError::Dataset(format!("failed to parse jsonl line {}: {}", idx + 1, e)))?;
        records.push(record);
    }
    Ok(records)
}

pub fn compute_dataset_id(records: &[TextRecord]) -> TrainingResult<DatasetId> {
    let mut hasher = Sha256::new();

    for record in records {
        let bytes = serde_json::to_vec(record)?;
        hasher.update(bytes);
        hasher.update(b"\n");
    }

    Ok(DatasetId(hex::encode(hasher.finalize())))
}

pub fn validate_records(records: &[TextRecord]) -> TrainingResult<()> {
    if records.is_empty() {
        return Err(TrainingError::Dataset("dataset must not be empty".to_string()));
    }
    for (idx, record) in records.iter().enumerate() {
        if record.text.trim().is_empty() {
            return Err(TrainingError::Dataset(format!("record[{idx}] text is empty")));
        }
    }
    Ok(())
}
