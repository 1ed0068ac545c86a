//! Structured run logging.
//!
//! A [`LogSink`] receives one [`LogEntry`] per notable event (agent turns, tool
//! results, ward verdicts, soundings decisions, heartbeats). Recording is
//! fire-and-forget: sinks swallow their own failures. Cost data can arrive
//! after the fact and is looked up by request id.

mod heartbeat;
mod logger;

pub use heartbeat::Heartbeat;
pub use logger::JsonlLogSink;

use crate::state::ExecutionContext;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

/// One structured log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub session_id: String,
    pub trace_id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub phase: Option<String>,
    pub role: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(session_id: &str, trace_id: &str, role: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            trace_id: trace_id.to_string(),
            parent_id: None,
            phase: None,
            role: role.to_string(),
            content: Value::Null,
            metadata: Value::Null,
            request_id: None,
            cost: None,
            timestamp: Utc::now(),
        }
    }

    /// An entry positioned at the context's trace node.
    pub fn at(ctx: &ExecutionContext, role: &str) -> Self {
        let mut entry = Self::new(&ctx.session_id, &ctx.trace.id, role);
        entry.parent_id = ctx.trace.parent_id.clone();
        entry.phase = ctx.phase.clone();
        entry
    }

    pub fn with_content(mut self, content: Value) -> Self {
        self.content = content;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_request(mut self, request_id: &str, cost: Option<f64>) -> Self {
        self.request_id = Some(request_id.to_string());
        self.cost = cost;
        self
    }
}

/// Destination for structured log entries.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Record an entry. Must not fail the caller.
    fn record(&self, entry: LogEntry);

    /// Cost for a request, if the sink has received it.
    async fn cost_for(&self, _request_id: &str) -> Option<f64> {
        None
    }
}

/// Sink that keeps entries in memory.
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    entries: Mutex<Vec<LogEntry>>,
    late_costs: Mutex<HashMap<String, f64>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate cost data arriving after the request was logged.
    pub fn set_cost(&self, request_id: &str, cost: f64) {
        if let Ok(mut costs) = self.late_costs.lock() {
            costs.insert(request_id.to_string(), cost);
        }
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn entries_with_role(&self, role: &str) -> Vec<LogEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.role == role)
            .collect()
    }
}

#[async_trait]
impl LogSink for MemoryLogSink {
    fn record(&self, entry: LogEntry) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry);
        }
    }

    async fn cost_for(&self, request_id: &str) -> Option<f64> {
        if let Some(cost) = self
            .late_costs
            .lock()
            .ok()
            .and_then(|c| c.get(request_id).copied())
        {
            return Some(cost);
        }
        self.entries.lock().ok().and_then(|entries| {
            entries
                .iter()
                .rev()
                .find(|e| e.request_id.as_deref() == Some(request_id) && e.cost.is_some())
                .and_then(|e| e.cost)
        })
    }
}

/// Sink that forwards entries as `tracing` events.
#[derive(Debug, Default)]
pub struct TracingLogSink;

#[async_trait]
impl LogSink for TracingLogSink {
    fn record(&self, entry: LogEntry) {
        tracing::debug!(
            session_id = %entry.session_id,
            trace_id = %entry.trace_id,
            phase = entry.phase.as_deref().unwrap_or(""),
            role = %entry.role,
            content = %entry.content,
            "cascade event"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_sink_cost_lookup() {
        let sink = MemoryLogSink::new();
        sink.record(LogEntry::new("s", "t", "assistant").with_request("req-1", Some(0.25)));
        sink.record(LogEntry::new("s", "t", "assistant").with_request("req-2", None));

        assert_eq!(sink.cost_for("req-1").await, Some(0.25));
        assert_eq!(sink.cost_for("req-2").await, None);

        sink.set_cost("req-2", 0.5);
        assert_eq!(sink.cost_for("req-2").await, Some(0.5));
    }

    #[test]
    fn test_entry_at_context() {
        let ctx = ExecutionContext::root("blog", "s1").for_phase("draft");
        let entry = LogEntry::at(&ctx, "user").with_content(json!("hi"));
        assert_eq!(entry.phase.as_deref(), Some("draft"));
        assert_eq!(entry.trace_id, ctx.trace.id);
        assert_eq!(entry.parent_id, ctx.trace.parent_id);
    }

    #[test]
    fn test_entries_with_role() {
        let sink = MemoryLogSink::new();
        sink.record(LogEntry::new("s", "t", "user"));
        sink.record(LogEntry::new("s", "t", "ward"));
        assert_eq!(sink.entries_with_role("ward").len(), 1);
        assert_eq!(sink.entries().len(), 2);
    }
}
