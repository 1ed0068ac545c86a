use super::{LogEntry, LogSink};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// Append-only JSON-lines log file.
pub struct JsonlLogSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlLogSink {
    /// Create the sink, creating parent directories as needed.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create log directory: {}", parent.display())
            })?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, entry: &LogEntry) -> Result<()> {
        let line = serde_json::to_string(entry).context("Failed to serialize log entry")?;
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("Log file lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open log file: {}", self.path.display()))?;
        writeln!(file, "{}", line).context("Failed to write log entry")
    }

    /// Read every entry back. Malformed lines are skipped.
    pub fn read_entries(&self) -> Result<Vec<LogEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read log file: {}", self.path.display()))?;
        Ok(content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }
}

#[async_trait]
impl LogSink for JsonlLogSink {
    fn record(&self, entry: LogEntry) {
        if let Err(e) = self.append(&entry) {
            warn!(error = %e, path = %self.path.display(), "Dropping log entry");
        }
    }

    async fn cost_for(&self, request_id: &str) -> Option<f64> {
        let entries = self.read_entries().ok()?;
        entries
            .iter()
            .rev()
            .find(|e| e.request_id.as_deref() == Some(request_id) && e.cost.is_some())
            .and_then(|e| e.cost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let sink = JsonlLogSink::new(&dir.path().join("logs").join("run.jsonl")).unwrap();

        sink.record(LogEntry::new("s", "t1", "user").with_content(json!("hello")));
        sink.record(
            LogEntry::new("s", "t2", "assistant")
                .with_content(json!("hi"))
                .with_request("req-9", Some(0.01)),
        );

        let entries = sink.read_entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].content, json!("hello"));
        assert_eq!(sink.cost_for("req-9").await, Some(0.01));
        assert_eq!(sink.cost_for("missing").await, None);
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let dir = TempDir::new().unwrap();
        let sink = JsonlLogSink::new(&dir.path().join("none.jsonl")).unwrap();
        assert!(sink.read_entries().unwrap().is_empty());
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.jsonl");
        fs::write(&path, "not json\n").unwrap();
        let sink = JsonlLogSink::new(&path).unwrap();
        sink.record(LogEntry::new("s", "t", "user"));
        assert_eq!(sink.read_entries().unwrap().len(), 1);
    }
}
