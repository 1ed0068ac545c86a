//! Per-run session state: key/value state, append-only history, lineage and errors.
//!
//! A `SessionState` has exactly one writer. Parallel workers receive a
//! [`SessionFork`] (a deep copy plus the positions it was taken at) and hand it
//! back; only the owner merges forks, and only for winners.

use crate::definition::output_key;
use crate::errors::StateError;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::path::Path;

/// Kind of a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    PhaseStart,
    Message,
    ToolResult,
    Validation,
    Ward,
    Soundings,
    Reforge,
    Checkpoint,
    PhaseComplete,
    Error,
}

/// One entry in the append-only history log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub trace_id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub role: String,
    pub kind: EntryKind,
    #[serde(default)]
    pub phase: Option<String>,
    pub content: Value,
    #[serde(default)]
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(trace_id: &str, parent_id: Option<&str>, role: &str, kind: EntryKind) -> Self {
        Self {
            trace_id: trace_id.to_string(),
            parent_id: parent_id.map(str::to_string),
            role: role.to_string(),
            kind,
            phase: None,
            content: Value::Null,
            metadata: Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn with_phase(mut self, phase: &str) -> Self {
        self.phase = Some(phase.to_string());
        self
    }

    pub fn with_content(mut self, content: Value) -> Self {
        self.content = content;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A completed phase and its output, in completion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageEntry {
    pub phase: String,
    pub output: Value,
    /// Phase chosen by the agent through the routing tool, if any
    #[serde(default)]
    pub routed_to: Option<String>,
    pub completed_at: DateTime<Utc>,
}

/// An error recorded against the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    #[serde(default)]
    pub phase: Option<String>,
    pub message: String,
    #[serde(default)]
    pub attempt: Option<u32>,
    #[serde(default)]
    pub candidate: Option<usize>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorEntry {
    pub fn new(phase: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            phase: phase.map(str::to_string),
            message: message.into(),
            attempt: None,
            candidate: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_candidate(mut self, candidate: usize) -> Self {
        self.candidate = Some(candidate);
        self
    }
}

/// Shared mutable state of one cascade run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    #[serde(default)]
    pub parent_session_id: Option<String>,
    #[serde(default)]
    state: Map<String, Value>,
    #[serde(default)]
    history: Vec<HistoryEntry>,
    #[serde(default)]
    lineage: Vec<LineageEntry>,
    #[serde(default)]
    errors: Vec<ErrorEntry>,
    /// Keys written since this copy was forked
    #[serde(skip)]
    dirty: BTreeSet<String>,
}

impl SessionState {
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            ..Default::default()
        }
    }

    pub fn with_parent(mut self, parent_session_id: Option<&str>) -> Self {
        self.parent_session_id = parent_session_id.map(str::to_string);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.state.get(key)
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.dirty.insert(key.to_string());
        self.state.insert(key.to_string(), value);
    }

    pub fn state(&self) -> &Map<String, Value> {
        &self.state
    }

    pub fn append(&mut self, entry: HistoryEntry) {
        self.history.push(entry);
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn lineage(&self) -> &[LineageEntry] {
        &self.lineage
    }

    pub fn record_error(&mut self, error: ErrorEntry) {
        self.errors.push(error);
    }

    pub fn errors(&self) -> &[ErrorEntry] {
        &self.errors
    }

    /// Write a phase's resolved output. Allowed once per phase.
    pub fn commit_phase_output(
        &mut self,
        phase: &str,
        output: Value,
        routed_to: Option<String>,
    ) -> Result<(), StateError> {
        let key = output_key(phase);
        if self.state.contains_key(&key) || self.is_completed(phase) {
            return Err(StateError::OutputAlreadyCommitted {
                phase: phase.to_string(),
            });
        }
        self.set(&key, output.clone());
        self.lineage.push(LineageEntry {
            phase: phase.to_string(),
            output,
            routed_to,
            completed_at: Utc::now(),
        });
        Ok(())
    }

    pub fn is_completed(&self, phase: &str) -> bool {
        self.lineage.iter().any(|l| l.phase == phase)
    }

    pub fn output_of(&self, phase: &str) -> Option<&Value> {
        self.lineage
            .iter()
            .find(|l| l.phase == phase)
            .map(|l| &l.output)
    }

    /// Committed outputs keyed by phase name, as seen by templates.
    pub fn outputs(&self) -> Value {
        let map: Map<String, Value> = self
            .lineage
            .iter()
            .map(|l| (l.phase.clone(), l.output.clone()))
            .collect();
        Value::Object(map)
    }

    /// Lineage as `[{phase, output}]`, as seen by templates.
    pub fn lineage_value(&self) -> Value {
        Value::Array(
            self.lineage
                .iter()
                .map(|l| serde_json::json!({"phase": l.phase, "output": l.output}))
                .collect(),
        )
    }

    /// Deep copy for a worker.
    pub fn fork(&self) -> SessionFork {
        let mut state = self.clone();
        state.dirty.clear();
        SessionFork {
            history_base: self.history.len(),
            errors_base: self.errors.len(),
            state,
        }
    }

    /// Fold a worker's fork back in: keys it wrote, and history and errors it appended.
    pub fn merge(&mut self, fork: SessionFork) {
        let SessionFork {
            state,
            history_base,
            errors_base,
        } = fork;
        for key in &state.dirty {
            if let Some(value) = state.state.get(key) {
                self.set(key, value.clone());
            }
        }
        self.history
            .extend(state.history.into_iter().skip(history_base));
        self.errors.extend(state.errors.into_iter().skip(errors_base));
    }

    /// Save as pretty JSON for later resumption.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize session")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write session file: {}", path.display()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read session file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse session file: {}", path.display()))
    }
}

/// A private deep copy of a session handed to a worker.
#[derive(Debug, Clone)]
pub struct SessionFork {
    pub state: SessionState,
    history_base: usize,
    errors_base: usize,
}

impl SessionFork {
    /// History entries appended since the fork was taken.
    pub fn new_history(&self) -> &[HistoryEntry] {
        &self.state.history[self.history_base.min(self.state.history.len())..]
    }
}
