//! Cascade runner.
//!
//! [`CascadeRunner`] is the outermost run boundary. It owns the cascade
//! library and every external collaborator, hands phases to the scheduler,
//! and always returns a [`CascadeResult`] instead of an error.
//!
//! Sub-cascades (validators that are cascades, or cascades invoked by name)
//! run through the same runner one level deeper; the execution context
//! carries the depth and the configured maximum stops runaway recursion.

mod phase;

use phase::PhaseExecutor;

use crate::agent::{Agent, EmptyToolbox, TokenBudget, Toolbox};
use crate::audit::{Heartbeat, LogEntry, LogSink, TracingLogSink};
use crate::checkpoint::CheckpointGateway;
use crate::config::EngineConfig;
use crate::dag::{CascadeResult, DagExecutor, PhaseEvent, RunStatus, RunSummary, ScheduleMode};
use crate::definition::Cascade;
use crate::errors::{CascadeError, PhaseError};
use crate::soundings::{EvaluatorSettings, Explorer, MemoryWinnerStore, WinnerStore};
use crate::state::{CancelFlag, ErrorEntry, ExecutionContext, SessionState};
use crate::wards::{CodeRunner, SubCascade, ValidatorRegistry, ValidatorResolver};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// State key holding the run input, so resumed runs see the same input.
pub const INPUT_KEY: &str = "input";

/// Releases external resources tied to a session once the run returns.
#[async_trait]
pub trait SessionCleanup: Send + Sync {
    async fn close(&self, session_id: &str) -> anyhow::Result<()>;
}

/// Runs cascades from a library against injected collaborators.
#[derive(Clone)]
pub struct CascadeRunner {
    library: Arc<HashMap<String, Arc<Cascade>>>,
    agent: Arc<dyn Agent>,
    toolbox: Arc<dyn Toolbox>,
    sink: Arc<dyn LogSink>,
    gateway: Option<Arc<dyn CheckpointGateway>>,
    registry: ValidatorRegistry,
    winners: Arc<dyn WinnerStore>,
    config: Arc<EngineConfig>,
    cleanup: Vec<Arc<dyn SessionCleanup>>,
    events: Option<mpsc::Sender<PhaseEvent>>,
}

impl CascadeRunner {
    pub fn new(agent: Arc<dyn Agent>, config: EngineConfig) -> Self {
        Self {
            library: Arc::new(HashMap::new()),
            agent,
            toolbox: Arc::new(EmptyToolbox),
            sink: Arc::new(TracingLogSink),
            gateway: None,
            registry: ValidatorRegistry::new(),
            winners: Arc::new(MemoryWinnerStore::new()),
            config: Arc::new(config),
            cleanup: Vec::new(),
            events: None,
        }
    }

    /// Add a cascade to the library. A later cascade with the same id replaces the earlier one.
    pub fn with_cascade(mut self, cascade: Cascade) -> Self {
        Arc::make_mut(&mut self.library).insert(cascade.cascade_id.clone(), Arc::new(cascade));
        self
    }

    pub fn with_toolbox(mut self, toolbox: Arc<dyn Toolbox>) -> Self {
        self.toolbox = toolbox;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn CheckpointGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_registry(mut self, registry: ValidatorRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_code_runner(mut self, runner: Arc<dyn CodeRunner>) -> Self {
        self.registry = self.registry.with_code_runner(runner);
        self
    }

    pub fn with_winner_store(mut self, store: Arc<dyn WinnerStore>) -> Self {
        self.winners = store;
        self
    }

    pub fn with_cleanup(mut self, hook: Arc<dyn SessionCleanup>) -> Self {
        self.cleanup.push(hook);
        self
    }

    /// Receive scheduling events of top-level runs.
    pub fn with_event_channel(mut self, tx: mpsc::Sender<PhaseEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cascade(&self, cascade_id: &str) -> Option<&Arc<Cascade>> {
        self.library.get(cascade_id)
    }

    /// Run a cascade from the start in a fresh session.
    pub async fn run(&self, cascade_id: &str, input: Value) -> CascadeResult {
        self.run_with_cancel(cascade_id, input, CancelFlag::new())
            .await
    }

    /// Run with a caller-held cancellation flag.
    pub async fn run_with_cancel(&self, cascade_id: &str, input: Value, cancel: CancelFlag) -> CascadeResult {
        let session_id = Uuid::new_v4().to_string();
        let mut session = SessionState::new(&session_id);
        session.set(INPUT_KEY, input);
        let ctx = self.root_context(cascade_id, &session_id, cancel);
        self.run_top_level(cascade_id, session, ctx).await
    }

    /// Continue a saved session. Phases already in its lineage are not rerun.
    pub async fn resume(&self, cascade_id: &str, session: SessionState) -> CascadeResult {
        info!(
            cascade = %cascade_id,
            session_id = %session.session_id,
            completed = session.lineage().len(),
            "Resuming session"
        );
        let ctx = self.root_context(cascade_id, &session.session_id, CancelFlag::new());
        self.run_top_level(cascade_id, session, ctx).await
    }

    fn root_context(&self, cascade_id: &str, session_id: &str, cancel: CancelFlag) -> ExecutionContext {
        let budget = self
            .config
            .engine
            .token_budget
            .map(|limit| Arc::new(TokenBudget::new(limit)));
        ExecutionContext::root(cascade_id, session_id)
            .with_cancel(cancel)
            .with_token_budget(budget)
    }

    async fn run_top_level(&self, cascade_id: &str, session: SessionState, ctx: ExecutionContext) -> CascadeResult {
        let heartbeat = Heartbeat::start(
            self.sink.clone(),
            &ctx.session_id,
            &ctx.trace.id,
            self.config.heartbeat_interval(),
            ctx.cancel.clone(),
        );

        let result = self.execute(cascade_id, session, &ctx, self.events.clone()).await;

        let beats = heartbeat.stop().await;
        for hook in &self.cleanup {
            if let Err(e) = hook.close(&ctx.session_id).await {
                warn!(session_id = %ctx.session_id, error = %e, "Session cleanup failed");
            }
        }
        info!(
            cascade = %cascade_id,
            session_id = %ctx.session_id,
            status = ?result.status,
            heartbeats = beats,
            "Cascade finished"
        );
        result
    }

    /// Schedule every phase of a cascade. Never fails; errors land in the result.
    async fn execute(
        &self,
        cascade_id: &str,
        mut session: SessionState,
        ctx: &ExecutionContext,
        events: Option<mpsc::Sender<PhaseEvent>>,
    ) -> CascadeResult {
        let Some(cascade) = self.library.get(cascade_id).cloned() else {
            return self.failed(cascade_id, session, CascadeError::UnknownCascade(cascade_id.to_string()));
        };

        let mut executor = match DagExecutor::new(cascade.clone(), self.config.engine.max_parallel_phases) {
            Ok(executor) => executor,
            Err(e) => return self.failed(cascade_id, session, e),
        };
        if let Some(tx) = events {
            executor = executor.with_event_channel(tx);
        }

        self.sink.record(
            LogEntry::at(ctx, "cascade_start").with_metadata(json!({
                "cascade": cascade_id,
                "depth": ctx.depth,
                "parent_session_id": ctx.parent_session_id,
                "mode": executor.mode(),
            })),
        );

        let input = session.get(INPUT_KEY).cloned().unwrap_or(Value::Null);
        let resolver = ValidatorResolver::new(cascade.clone(), self.registry.clone())
            .with_sub_cascades(Arc::new(self.clone()));
        let worker = Arc::new(PhaseExecutor::new(
            self.clone(),
            cascade.clone(),
            Arc::new(input),
            resolver,
        ));

        let execution = executor.execute(worker, &mut session, ctx).await;
        let output = session.lineage().last().map(|l| l.output.clone());

        self.sink.record(
            LogEntry::at(ctx, "cascade_complete")
                .with_content(output.clone().unwrap_or(Value::Null))
                .with_metadata(json!({"status": execution.status, "errors": session.errors().len()})),
        );

        CascadeResult {
            cascade_id: cascade_id.to_string(),
            session_id: session.session_id.clone(),
            mode: execution.mode,
            status: execution.status,
            output,
            errors: session.errors().to_vec(),
            summary: execution.summary,
            session,
        }
    }

    fn failed(&self, cascade_id: &str, mut session: SessionState, err: CascadeError) -> CascadeResult {
        error!(cascade = %cascade_id, error = %err, "Cascade could not start");
        session.record_error(ErrorEntry::new(None, err.to_string()));
        CascadeResult {
            cascade_id: cascade_id.to_string(),
            session_id: session.session_id.clone(),
            mode: ScheduleMode::Sequential,
            status: RunStatus::Failed,
            output: None,
            errors: session.errors().to_vec(),
            summary: RunSummary::new(0),
            session,
        }
    }

    /// Explorer whose auxiliary calls use the judge model, else `phase_model`.
    pub(crate) fn explorer(&self, phase_model: &str) -> Explorer {
        let settings = EvaluatorSettings {
            judge_model: self
                .config
                .engine
                .judge_model
                .clone()
                .unwrap_or_else(|| phase_model.to_string()),
            retry: self.config.retry_config(),
            cost_wait: self.config.cost_wait(),
            checkpoint_timeout: self.config.checkpoint_timeout(),
        };
        Explorer::new(
            self.agent.clone(),
            self.sink.clone(),
            self.winners.clone(),
            self.config.catalog(),
            settings,
        )
        .with_gateway(self.gateway.clone())
        .with_safety_multiplier(self.config.soundings.context_safety_multiplier)
    }
}

#[async_trait]
impl SubCascade for CascadeRunner {
    async fn invoke(&self, cascade_id: &str, input: Value, ctx: &ExecutionContext) -> Result<Value, PhaseError> {
        let session_id = Uuid::new_v4().to_string();
        let child_ctx = ctx.for_sub_cascade(cascade_id, &session_id, self.config.engine.max_depth)?;
        let mut session = SessionState::new(&session_id).with_parent(Some(&ctx.session_id));
        session.set(INPUT_KEY, input);

        let result = Box::pin(self.execute(cascade_id, session, &child_ctx, None)).await;
        match result.status {
            RunStatus::Completed => Ok(result.output.unwrap_or(Value::Null)),
            RunStatus::Blocked { phase, reason } => Err(PhaseError::Blocked { phase, reason }),
            status => Err(PhaseError::SubCascade {
                cascade: cascade_id.to_string(),
                message: result
                    .errors
                    .last()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| format!("{:?}", status)),
            }),
        }
    }

    fn has_cascade(&self, cascade_id: &str) -> bool {
        self.library.contains_key(cascade_id)
    }
}
