//! Wave bookkeeping: which phases are ready, running, done, failed or skipped.

use crate::dag::builder::{PhaseGraph, PhaseIndex};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Status of a phase during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed { error: String },
    /// Not run because a dependency failed
    Skipped,
}

impl PhaseStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed { .. } | Self::Skipped)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Tracks per-phase status over a [`PhaseGraph`].
#[derive(Debug)]
pub struct DagScheduler {
    graph: PhaseGraph,
    statuses: Vec<PhaseStatus>,
    completed: HashSet<PhaseIndex>,
}

impl DagScheduler {
    pub fn new(graph: PhaseGraph) -> Self {
        let statuses = vec![PhaseStatus::Pending; graph.len()];
        Self {
            graph,
            statuses,
            completed: HashSet::new(),
        }
    }

    pub fn graph(&self) -> &PhaseGraph {
        &self.graph
    }

    pub fn phase_count(&self) -> usize {
        self.graph.len()
    }

    pub fn status(&self, name: &str) -> Option<&PhaseStatus> {
        self.graph.get_index(name).and_then(|i| self.statuses.get(i))
    }

    /// Groups of phases that could run together once earlier groups finish.
    pub fn compute_waves(&self) -> Vec<Vec<String>> {
        let mut waves = Vec::new();
        let mut completed: HashSet<PhaseIndex> = HashSet::new();

        loop {
            let ready: Vec<PhaseIndex> = (0..self.graph.len())
                .filter(|i| !completed.contains(i))
                .filter(|&i| self.graph.dependencies_satisfied(i, &completed))
                .collect();

            if ready.is_empty() {
                break;
            }

            completed.extend(ready.iter().copied());
            waves.push(
                ready
                    .into_iter()
                    .filter_map(|i| self.graph.name(i).map(str::to_string))
                    .collect(),
            );
        }

        waves
    }

    /// Pending phases whose dependencies have all completed, in definition order.
    pub fn get_ready_phases(&self) -> Vec<String> {
        (0..self.graph.len())
            .filter(|&i| self.statuses[i] == PhaseStatus::Pending)
            .filter(|&i| self.graph.dependencies_satisfied(i, &self.completed))
            .filter_map(|i| self.graph.name(i).map(str::to_string))
            .collect()
    }

    pub fn mark_running(&mut self, name: &str) {
        if let Some(idx) = self.graph.get_index(name) {
            self.statuses[idx] = PhaseStatus::Running;
        }
    }

    pub fn mark_completed(&mut self, name: &str) {
        if let Some(idx) = self.graph.get_index(name) {
            self.statuses[idx] = PhaseStatus::Completed;
            self.completed.insert(idx);
        }
    }

    /// Mark a phase failed and skip everything downstream of it.
    /// Returns the names of the skipped phases.
    pub fn mark_failed(&mut self, name: &str, error: &str) -> Vec<String> {
        let Some(idx) = self.graph.get_index(name) else {
            return Vec::new();
        };
        self.statuses[idx] = PhaseStatus::Failed {
            error: error.to_string(),
        };
        let mut skipped = Vec::new();
        self.skip_dependents(idx, &mut skipped);
        skipped
    }

    fn skip_dependents(&mut self, idx: PhaseIndex, skipped: &mut Vec<String>) {
        let dependents = self.graph.dependents(idx).to_vec();
        for dep in dependents {
            if self.statuses[dep] == PhaseStatus::Pending {
                self.statuses[dep] = PhaseStatus::Skipped;
                if let Some(name) = self.graph.name(dep) {
                    skipped.push(name.to_string());
                }
                self.skip_dependents(dep, skipped);
            }
        }
    }

    pub fn all_complete(&self) -> bool {
        self.statuses.iter().all(PhaseStatus::is_terminal)
    }

    pub fn running_count(&self) -> usize {
        self.statuses
            .iter()
            .filter(|s| **s == PhaseStatus::Running)
            .count()
    }
}
