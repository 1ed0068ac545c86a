//! Run outcome types.

use crate::state::{ErrorEntry, SessionState};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// How a cascade's phases were scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleMode {
    Sequential,
    Parallel,
}

/// Final status of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunStatus {
    Completed,
    Failed,
    /// A phase signalled blocked; the run stopped immediately
    Blocked { phase: String, reason: String },
    Cancelled,
}

impl RunStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }
}

/// Result of one phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: String,
    pub success: bool,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routed_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

impl PhaseResult {
    pub fn success(phase: &str, attempts: u32, duration: Duration) -> Self {
        Self {
            phase: phase.to_string(),
            success: true,
            attempts,
            routed_to: None,
            error: None,
            duration,
        }
    }

    pub fn failure(phase: &str, error: &str, attempts: u32, duration: Duration) -> Self {
        Self {
            phase: phase.to_string(),
            success: false,
            attempts,
            routed_to: None,
            error: Some(error.to_string()),
            duration,
        }
    }

    pub fn with_route(mut self, route: Option<String>) -> Self {
        self.routed_to = route;
        self
    }
}

/// Per-run tallies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_phases: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    #[serde(default)]
    pub phase_results: HashMap<String, PhaseResult>,
}

impl RunSummary {
    pub fn new(total_phases: usize) -> Self {
        Self {
            total_phases,
            ..Default::default()
        }
    }

    pub fn add_result(&mut self, result: PhaseResult) {
        if result.success {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
        self.phase_results.insert(result.phase.clone(), result);
    }

    pub fn mark_skipped(&mut self, phase: &str) {
        self.skipped += 1;
        self.phase_results.insert(
            phase.to_string(),
            PhaseResult::failure(phase, "skipped due to dependency failure", 0, Duration::ZERO),
        );
    }

    pub fn all_success(&self) -> bool {
        self.failed == 0 && self.skipped == 0
    }
}

/// What the outermost run boundary returns. Never an `Err`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeResult {
    pub cascade_id: String,
    pub session_id: String,
    pub mode: ScheduleMode,
    #[serde(flatten)]
    pub status: RunStatus,
    /// Output of the last completed phase
    pub output: Option<Value>,
    pub errors: Vec<ErrorEntry>,
    pub summary: RunSummary,
    pub session: SessionState,
}

impl CascadeResult {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Committed output of a phase.
    pub fn output_of(&self, phase: &str) -> Option<&Value> {
        self.session.output_of(phase)
    }
}

/// Tracks execution timing.
pub struct ExecutionTimer {
    start: Instant,
}

impl ExecutionTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
