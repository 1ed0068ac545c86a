//! Species fingerprints and winner persistence.
//!
//! A species fingerprint identifies "the same phase run on the same input":
//! a SHA-256 over the phase definition and the rendered input. Winners are
//! recorded under it so later runs can learn from earlier ones.

use crate::definition::Phase;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Deterministic hash of a phase's configuration plus its rendered input.
pub fn species_fingerprint(cascade_id: &str, phase: &Phase, rendered_input: &str) -> String {
    let payload = json!({
        "cascade": cascade_id,
        "phase": phase,
        "input": rendered_input,
    });
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// One soundings outcome worth remembering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WinnerRecord {
    pub fingerprint: String,
    pub phase: String,
    pub winner_indices: Vec<usize>,
    pub evaluator: String,
    /// Rewritten prompt of the winner, for rewrite mutations
    #[serde(default)]
    pub rewritten_prompt: Option<String>,
    pub model: String,
    pub recorded_at: DateTime<Utc>,
}

impl WinnerRecord {
    pub fn new(fingerprint: &str, phase: &str, winner_indices: Vec<usize>, evaluator: &str, model: &str) -> Self {
        Self {
            fingerprint: fingerprint.to_string(),
            phase: phase.to_string(),
            winner_indices,
            evaluator: evaluator.to_string(),
            rewritten_prompt: None,
            model: model.to_string(),
            recorded_at: Utc::now(),
        }
    }

    pub fn with_rewritten_prompt(mut self, prompt: Option<String>) -> Self {
        self.rewritten_prompt = prompt;
        self
    }
}

/// Where winners are kept.
pub trait WinnerStore: Send + Sync {
    fn record(&self, record: WinnerRecord) -> Result<()>;

    /// Most recent records for a fingerprint, newest first.
    fn recent(&self, fingerprint: &str, limit: usize) -> Result<Vec<WinnerRecord>>;

    /// Winning rewritten prompts for a fingerprint, newest first.
    fn winning_rewrites(&self, fingerprint: &str, limit: usize) -> Result<Vec<String>> {
        Ok(self
            .recent(fingerprint, usize::MAX)?
            .into_iter()
            .filter_map(|r| r.rewritten_prompt)
            .take(limit)
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct MemoryWinnerStore {
    records: Mutex<HashMap<String, Vec<WinnerRecord>>>,
}

impl MemoryWinnerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WinnerStore for MemoryWinnerStore {
    fn record(&self, record: WinnerRecord) -> Result<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| anyhow::anyhow!("winner store lock poisoned"))?;
        records
            .entry(record.fingerprint.clone())
            .or_default()
            .push(record);
        Ok(())
    }

    fn recent(&self, fingerprint: &str, limit: usize) -> Result<Vec<WinnerRecord>> {
        let records = self
            .records
            .lock()
            .map_err(|_| anyhow::anyhow!("winner store lock poisoned"))?;
        Ok(records
            .get(fingerprint)
            .map(|list| list.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

/// One JSON file per fingerprint under a directory.
#[derive(Debug)]
pub struct JsonWinnerStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonWinnerStore {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create winner directory: {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, fingerprint: &str) -> PathBuf {
        self.dir.join(format!("{}.json", fingerprint))
    }

    fn read(&self, fingerprint: &str) -> Result<Vec<WinnerRecord>> {
        let path = self.path_for(fingerprint);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read winner file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse winner file: {}", path.display()))
    }
}

impl WinnerStore for JsonWinnerStore {
    fn record(&self, record: WinnerRecord) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("winner store lock poisoned"))?;
        let mut records = self.read(&record.fingerprint)?;
        let path = self.path_for(&record.fingerprint);
        records.push(record);
        let json = serde_json::to_string_pretty(&records).context("Failed to serialize winners")?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write winner file: {}", path.display()))
    }

    fn recent(&self, fingerprint: &str, limit: usize) -> Result<Vec<WinnerRecord>> {
        Ok(self
            .read(fingerprint)?
            .into_iter()
            .rev()
            .take(limit)
            .collect())
    }
}

/// Winner-related fields as they appear in log metadata.
pub fn record_metadata(record: &WinnerRecord) -> Value {
    json!({
        "fingerprint": record.fingerprint,
        "winners": record.winner_indices,
        "evaluator": record.evaluator,
        "model": record.model,
    })
}
