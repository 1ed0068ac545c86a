//! Phase scheduler.
//!
//! Runs a cascade's phases either in parallel waves (when the dependency
//! graph allows it) or strictly sequentially with handoff routing. Every
//! phase runs against a fork of the session; the executor is the single
//! owner that merges forks back and commits outputs.

use crate::dag::builder::{DagBuilder, PhaseGraph, PhaseIndex};
use crate::dag::scheduler::DagScheduler;
use crate::dag::state::{ExecutionTimer, PhaseResult, RunStatus, RunSummary, ScheduleMode};
use crate::definition::Cascade;
use crate::errors::{CascadeError, PhaseError};
use crate::state::{ErrorEntry, ExecutionContext, SessionFork, SessionState};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Resolved output of a phase.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseOutput {
    pub output: Value,
    /// Target chosen through the routing tool
    pub route: Option<String>,
}

/// What a worker hands back after running one phase.
#[derive(Debug)]
pub struct PhaseRun {
    pub phase: String,
    pub session: SessionFork,
    pub outcome: Result<PhaseOutput, PhaseError>,
    pub attempts: u32,
    pub duration: Duration,
}

/// Runs a single phase against a private session fork.
#[async_trait]
pub trait PhaseWorker: Send + Sync {
    async fn run_phase(
        &self,
        index: PhaseIndex,
        session: SessionFork,
        ctx: ExecutionContext,
    ) -> PhaseRun;
}

/// Events emitted while a cascade runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PhaseEvent {
    WaveStarted { wave: usize, phases: Vec<String> },
    /// The phase holds a worker slot and is running.
    Started { phase: String },
    Completed { phase: String, success: bool },
    Skipped { phase: String },
    RunCompleted { status: RunStatus },
}

/// Result of scheduling a whole cascade.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub mode: ScheduleMode,
    pub status: RunStatus,
    pub summary: RunSummary,
}

enum Settled {
    Committed(Option<String>),
    Failed,
    Blocked { phase: String, reason: String },
}

pub struct DagExecutor {
    cascade: Arc<Cascade>,
    graph: PhaseGraph,
    max_parallel: usize,
    event_tx: Option<mpsc::Sender<PhaseEvent>>,
}

impl DagExecutor {
    pub fn new(cascade: Arc<Cascade>, max_parallel: usize) -> Result<Self, CascadeError> {
        let graph = DagBuilder::new(&cascade).build()?;
        Ok(Self {
            cascade,
            graph,
            max_parallel: max_parallel.max(1),
            event_tx: None,
        })
    }

    pub fn with_event_channel(mut self, tx: mpsc::Sender<PhaseEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn graph(&self) -> &PhaseGraph {
        &self.graph
    }

    pub fn mode(&self) -> ScheduleMode {
        if self.graph.is_parallel_eligible() {
            ScheduleMode::Parallel
        } else {
            ScheduleMode::Sequential
        }
    }

    /// Run every phase. Phases already in the session's lineage are not rerun.
    pub async fn execute(
        &self,
        worker: Arc<dyn PhaseWorker>,
        session: &mut SessionState,
        ctx: &ExecutionContext,
    ) -> ExecutionResult {
        let timer = ExecutionTimer::start();
        let mode = self.mode();
        info!(
            cascade = %self.cascade.cascade_id,
            session_id = %ctx.session_id,
            phases = self.graph.len(),
            mode = ?mode,
            "Scheduling cascade"
        );

        let mut summary = RunSummary::new(self.graph.len());
        let status = match mode {
            ScheduleMode::Parallel => {
                self.execute_waves(worker, session, ctx, &mut summary)
                    .await
            }
            ScheduleMode::Sequential => {
                self.execute_sequential(worker.as_ref(), session, ctx, &mut summary)
                    .await
            }
        };
        summary.duration = timer.elapsed();

        self.emit(PhaseEvent::RunCompleted {
            status: status.clone(),
        })
        .await;

        ExecutionResult {
            mode,
            status,
            summary,
        }
    }

    async fn execute_waves(
        &self,
        worker: Arc<dyn PhaseWorker>,
        session: &mut SessionState,
        ctx: &ExecutionContext,
        summary: &mut RunSummary,
    ) -> RunStatus {
        let mut scheduler = DagScheduler::new(self.graph.clone());
        for name in self.graph.names() {
            if session.is_completed(name) {
                scheduler.mark_completed(name);
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut tasks: JoinSet<PhaseRun> = JoinSet::new();
        let mut running: HashMap<tokio::task::Id, String> = HashMap::new();
        let mut stopped: Option<RunStatus> = None;
        let mut wave = 0;

        loop {
            if stopped.is_none() && ctx.is_cancelled() {
                warn!(session_id = %ctx.session_id, "Cancellation observed, no further dispatch");
                stopped = Some(RunStatus::Cancelled);
            }

            if stopped.is_none() {
                let ready = scheduler.get_ready_phases();
                if !ready.is_empty() {
                    self.emit(PhaseEvent::WaveStarted {
                        wave,
                        phases: ready.clone(),
                    })
                    .await;

                    // Trace nodes are allocated before any worker starts.
                    let contexts: Vec<ExecutionContext> =
                        ready.iter().map(|name| ctx.for_phase(name)).collect();

                    for (name, phase_ctx) in ready.into_iter().zip(contexts) {
                        let Some(index) = self.graph.get_index(&name) else {
                            continue;
                        };
                        scheduler.mark_running(&name);

                        let fork = session.fork();
                        let worker = worker.clone();
                        let semaphore = semaphore.clone();
                        let events = self.event_tx.clone();
                        let started = name.clone();
                        let handle = tasks.spawn(async move {
                            let _permit = semaphore.acquire_owned().await.ok();
                            if let Some(tx) = events {
                                tx.send(PhaseEvent::Started { phase: started }).await.ok();
                            }
                            worker.run_phase(index, fork, phase_ctx).await
                        });
                        running.insert(handle.id(), name);
                    }
                    wave += 1;
                }
            }

            // Block until the first in-flight phase finishes.
            let Some(joined) = tasks.join_next_with_id().await else {
                break;
            };

            let run = match joined {
                Ok((id, run)) => {
                    running.remove(&id);
                    run
                }
                Err(join_err) => {
                    let phase = running.remove(&join_err.id()).unwrap_or_default();
                    if join_err.is_cancelled() {
                        continue;
                    }
                    let message = format!("Phase task panicked: {}", join_err);
                    error!(phase = %phase, "{}", message);
                    session.record_error(ErrorEntry::new(Some(&phase), message.clone()));
                    summary.add_result(PhaseResult::failure(&phase, &message, 0, Duration::ZERO));
                    self.skip_downstream(&mut scheduler, &phase, &message, summary)
                        .await;
                    continue;
                }
            };

            if matches!(stopped, Some(RunStatus::Blocked { .. })) {
                continue;
            }

            let phase = run.phase.clone();
            match self.settle(run, session, summary) {
                Settled::Committed(_) => {
                    scheduler.mark_completed(&phase);
                    self.emit(PhaseEvent::Completed {
                        phase,
                        success: true,
                    })
                    .await;
                }
                Settled::Failed => {
                    self.emit(PhaseEvent::Completed {
                        phase: phase.clone(),
                        success: false,
                    })
                    .await;
                    self.skip_downstream(&mut scheduler, &phase, "phase failed", summary)
                        .await;
                }
                Settled::Blocked { phase, reason } => {
                    tasks.abort_all();
                    stopped = Some(RunStatus::Blocked { phase, reason });
                }
            }
        }

        stopped.unwrap_or(if summary.all_success() {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        })
    }

    async fn skip_downstream(
        &self,
        scheduler: &mut DagScheduler,
        phase: &str,
        reason: &str,
        summary: &mut RunSummary,
    ) {
        for skipped in scheduler.mark_failed(phase, reason) {
            warn!(phase = %skipped, failed = %phase, "Skipping phase after dependency failure");
            summary.mark_skipped(&skipped);
            self.emit(PhaseEvent::Skipped { phase: skipped }).await;
        }
    }

    async fn execute_sequential(
        &self,
        worker: &dyn PhaseWorker,
        session: &mut SessionState,
        ctx: &ExecutionContext,
        summary: &mut RunSummary,
    ) -> RunStatus {
        let mut current = match self.resume_point(session) {
            Ok(start) => start,
            Err(e) => return self.fail_run(session, None, e),
        };
        let mut previous: Option<String> = None;

        while let Some(index) = current {
            if ctx.is_cancelled() {
                warn!(session_id = %ctx.session_id, "Cancellation observed between phases");
                return RunStatus::Cancelled;
            }

            let name = self.cascade.phases[index].name.clone();
            if session.is_completed(&name) {
                let err = CascadeError::HandoffCycle {
                    phase: name.clone(),
                    from: previous.unwrap_or_default(),
                };
                return self.fail_run(session, Some(&name), err);
            }

            self.emit(PhaseEvent::Started {
                phase: name.clone(),
            })
            .await;
            let run = worker
                .run_phase(index, session.fork(), ctx.for_phase(&name))
                .await;

            match self.settle(run, session, summary) {
                Settled::Committed(route) => {
                    self.emit(PhaseEvent::Completed {
                        phase: name.clone(),
                        success: true,
                    })
                    .await;
                    current = match self.next_phase(index, route.as_deref()) {
                        Ok(next) => next,
                        Err(e) => return self.fail_run(session, Some(&name), e),
                    };
                    previous = Some(name);
                }
                Settled::Failed => {
                    self.emit(PhaseEvent::Completed {
                        phase: name,
                        success: false,
                    })
                    .await;
                    return RunStatus::Failed;
                }
                Settled::Blocked { phase, reason } => {
                    return RunStatus::Blocked { phase, reason };
                }
            }
        }

        RunStatus::Completed
    }

    /// Where a sequential run starts: the first phase, or the phase after the
    /// last one recorded in the lineage.
    fn resume_point(&self, session: &SessionState) -> Result<Option<PhaseIndex>, CascadeError> {
        if self.graph.is_empty() {
            return Ok(None);
        }
        match session.lineage().last() {
            None => Ok(Some(0)),
            Some(last) => match self.graph.get_index(&last.phase) {
                Some(index) => self.next_phase(index, last.routed_to.as_deref()),
                None => Ok(Some(0)),
            },
        }
    }

    /// Dynamic route, else first static handoff, else the next phase in order.
    pub fn next_phase(
        &self,
        index: PhaseIndex,
        route: Option<&str>,
    ) -> Result<Option<PhaseIndex>, CascadeError> {
        let phase = &self.cascade.phases[index];
        let target = route.or_else(|| phase.handoffs.first().map(String::as_str));
        match target {
            Some(target) => self.graph.get_index(target).map(Some).ok_or_else(|| {
                CascadeError::UnknownHandoff {
                    phase: phase.name.clone(),
                    target: target.to_string(),
                }
            }),
            None if index + 1 < self.graph.len() => Ok(Some(index + 1)),
            None => Ok(None),
        }
    }

    /// Merge a finished phase back into the session and commit its output.
    fn settle(&self, run: PhaseRun, session: &mut SessionState, summary: &mut RunSummary) -> Settled {
        let PhaseRun {
            phase,
            session: fork,
            outcome,
            attempts,
            duration,
        } = run;
        session.merge(fork);

        let err = match outcome {
            Ok(out) => match session.commit_phase_output(&phase, out.output, out.route.clone()) {
                Ok(()) => {
                    info!(phase = %phase, attempts, route = ?out.route, "Phase completed");
                    summary.add_result(
                        PhaseResult::success(&phase, attempts, duration).with_route(out.route.clone()),
                    );
                    return Settled::Committed(out.route);
                }
                Err(e) => PhaseError::from(e),
            },
            Err(err) => err,
        };

        error!(phase = %phase, attempts, error = %err, "Phase failed");
        session.record_error(ErrorEntry::new(Some(&phase), err.to_string()).with_attempt(attempts));
        summary.add_result(PhaseResult::failure(&phase, &err.to_string(), attempts, duration));

        match err {
            PhaseError::Blocked { reason, .. } => Settled::Blocked { phase, reason },
            other if other.is_blocking() => Settled::Blocked {
                reason: other.to_string(),
                phase,
            },
            _ => Settled::Failed,
        }
    }

    fn fail_run(&self, session: &mut SessionState, phase: Option<&str>, err: CascadeError) -> RunStatus {
        error!(phase = phase.unwrap_or(""), error = %err, "Cascade stopped");
        session.record_error(ErrorEntry::new(phase, err.to_string()));
        RunStatus::Failed
    }

    async fn emit(&self, event: PhaseEvent) {
        if let Some(ref tx) = self.event_tx {
            tx.send(event).await.ok();
        }
    }
}
