//! The per-phase state machine.
//!
//! pre-wards → (soundings [→ reforge] | turn/attempt loop) → post-wards →
//! human checkpoint → output. The attempt budget (`rules.max_attempts`) is
//! shared between loop-until retries and post-ward retries.

use super::CascadeRunner;
use crate::agent::{
    AgentRequest, AgentResponse, Message, ROUTE_TOOL, ToolCall, ToolSpec, call_with_retry,
};
use crate::audit::LogEntry;
use crate::checkpoint::{UiField, UiSpec};
use crate::compaction::{ContextManager, ValidationFailure, compress};
use crate::dag::{ExecutionTimer, PhaseIndex, PhaseOutput, PhaseRun, PhaseWorker};
use crate::definition::{Cascade, CandidatesSpec, FactorSpec, HumanInputSpec, ModelsSpec, Phase, Rules};
use crate::errors::PhaseError;
use crate::reforge::Refiner;
use crate::soundings::{CandidatePlan, CandidateResult, CandidateWorker, Round};
use crate::state::{EntryKind, ErrorEntry, ExecutionContext, HistoryEntry, SessionFork, SessionState};
use crate::template::{RenderScope, render, value_to_text};
use crate::wards::{ValidatorResolver, Verdict, WardDecision, WardGate, WardReport};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const CONTINUE_PROMPT: &str = "Continue.";

const DEFAULT_RETRY_INSTRUCTIONS: &str = "Your previous output was rejected: {{ validation_error }}\n\
     Produce a corrected output. This is attempt {{ attempt }}.";

/// What one attempt loop produced.
#[derive(Debug, Clone, Default)]
struct Attempted {
    output: Value,
    route: Option<String>,
    messages: Vec<Message>,
    images: Vec<String>,
    cost: Option<f64>,
    tokens_in: u64,
    tokens_out: u64,
    request_ids: Vec<String>,
}

impl Attempted {
    fn add_usage(&mut self, response: &AgentResponse) {
        self.tokens_in += response.tokens_in;
        self.tokens_out += response.tokens_out;
        self.cost = match (self.cost, response.cost) {
            (Some(a), Some(b)) => Some(a + b),
            (a, b) => a.or(b),
        };
        self.request_ids.push(response.request_id.clone());
    }
}

/// Runs the phases of one cascade for the scheduler.
#[derive(Clone)]
pub struct PhaseExecutor {
    runner: CascadeRunner,
    cascade: Arc<Cascade>,
    input: Arc<Value>,
    resolver: ValidatorResolver,
}

#[async_trait]
impl PhaseWorker for PhaseExecutor {
    async fn run_phase(&self, index: PhaseIndex, mut session: SessionFork, ctx: ExecutionContext) -> PhaseRun {
        let timer = ExecutionTimer::start();
        let phase = &self.cascade.phases[index];
        let mut attempts = 0;
        let outcome = self
            .run(index, phase, &mut session.state, &ctx, &mut attempts)
            .await;

        match &outcome {
            Ok(out) => session.state.append(
                self.entry(&ctx, "system", EntryKind::PhaseComplete, &phase.name)
                    .with_content(out.output.clone())
                    .with_metadata(json!({"attempts": attempts, "route": out.route})),
            ),
            Err(e) => {
                self.runner.sink.record(
                    LogEntry::at(&ctx, "phase_error")
                        .with_content(Value::String(e.to_string()))
                        .with_metadata(json!({"attempts": attempts})),
                );
                session.state.append(
                    self.entry(&ctx, "system", EntryKind::Error, &phase.name)
                        .with_content(Value::String(e.to_string())),
                );
            }
        }

        PhaseRun {
            phase: phase.name.clone(),
            session,
            outcome,
            attempts,
            duration: timer.elapsed(),
        }
    }
}

impl PhaseExecutor {
    pub(super) fn new(
        runner: CascadeRunner,
        cascade: Arc<Cascade>,
        input: Arc<Value>,
        resolver: ValidatorResolver,
    ) -> Self {
        Self {
            runner,
            cascade,
            input,
            resolver,
        }
    }

    async fn run(
        &self,
        index: PhaseIndex,
        phase: &Phase,
        session: &mut SessionState,
        ctx: &ExecutionContext,
        attempts: &mut u32,
    ) -> Result<PhaseOutput, PhaseError> {
        let name = phase.name.as_str();
        info!(phase = %name, depth = ctx.depth, "Phase started");
        session.append(self.entry(ctx, "system", EntryKind::PhaseStart, name));

        let scope = self.scope(session);
        let prompt = render(&phase.instructions, &scope);
        let gate = WardGate::new(&self.resolver, name);

        if !phase.wards.pre.is_empty() {
            let report = gate.check_pre(&phase.wards.pre, &self.input, ctx).await?;
            self.record_wards(session, ctx, name, &report);
            if let WardDecision::Block { validator, reason } | WardDecision::Retry { validator, reason } =
                report.decision
            {
                return Err(PhaseError::Blocked {
                    phase: name.to_string(),
                    reason: format!("pre-ward '{}' failed: {}", validator, reason),
                });
            }
        }

        let model = self.model_for(phase);
        let seed = self.context_messages(phase, session);
        let factor = self.factor(phase, &scope);
        let soundings = phase
            .candidates
            .as_ref()
            .filter(|c| factor > 1 || matches!(c.models, Some(ModelsSpec::PerModel(_))));
        let max_attempts = phase.rules.max_attempts.max(1);

        let mut task = prompt.clone();
        loop {
            let settled = match soundings {
                Some(spec) => {
                    *attempts += 1;
                    self.explore(index, phase, spec, task, &model, seed.clone(), factor, session, ctx)
                        .await?
                }
                None => {
                    self.attempt_loop(phase, &task, &model, seed.clone(), session, ctx, attempts)
                        .await?
                }
            };

            if !phase.wards.post.is_empty() {
                let report = gate
                    .check_post(&phase.wards.post, &value_to_text(&settled.output), &self.input, ctx)
                    .await?;
                self.record_wards(session, ctx, name, &report);
                match report.decision {
                    WardDecision::Pass => {}
                    WardDecision::Block { validator, reason } => {
                        return Err(PhaseError::Blocked {
                            phase: name.to_string(),
                            reason: format!("post-ward '{}' failed: {}", validator, reason),
                        });
                    }
                    WardDecision::Retry { validator, reason } => {
                        let last_reason = format!("post-ward '{}': {}", validator, reason);
                        session.record_error(
                            ErrorEntry::new(Some(name), last_reason.clone()).with_attempt(*attempts),
                        );
                        if *attempts >= max_attempts {
                            return Err(PhaseError::MaxAttemptsExhausted {
                                phase: name.to_string(),
                                attempts: *attempts,
                                last_reason,
                            });
                        }
                        info!(phase = %name, attempt = *attempts, validator = %validator, "Post-ward requested a retry");
                        task = format!(
                            "{}\n\n{}",
                            prompt,
                            retry_instruction(&phase.rules, &reason, *attempts + 1)
                        );
                        continue;
                    }
                }
            }

            if let Some(spec) = &phase.human_input {
                self.human_checkpoint(phase, spec, &settled.output, session, ctx)
                    .await?;
            }

            return Ok(PhaseOutput {
                output: settled.output,
                route: settled.route,
            });
        }
    }

    /// Soundings over the phase body, then reforge when configured.
    #[allow(clippy::too_many_arguments)]
    async fn explore(
        &self,
        index: PhaseIndex,
        phase: &Phase,
        spec: &CandidatesSpec,
        task: String,
        model: &str,
        seed: Vec<Message>,
        factor: usize,
        session: &mut SessionState,
        ctx: &ExecutionContext,
    ) -> Result<Attempted, PhaseError> {
        let explorer = self.runner.explorer(model);
        let validator = spec
            .validator
            .as_deref()
            .map(|v| self.resolver.resolve(v))
            .transpose()?;
        let max_parallel = spec
            .max_parallel
            .unwrap_or(self.runner.config.soundings.max_parallel);
        let tool_chars: usize = self
            .tools_for(phase)
            .iter()
            .map(|t| t.name.len() + t.description.len() + t.parameters.to_string().len())
            .sum();
        let worker: Arc<dyn CandidateWorker> = Arc::new(CandidateRunner {
            exec: self.clone(),
            index,
        });

        let round = Round::new(
            phase,
            &self.cascade.cascade_id,
            task.clone(),
            model,
            &spec.evaluator,
            &self.input,
        )
        .with_factor(factor)
        .with_seed(seed.clone())
        .with_mutation(spec.mutation_mode)
        .with_models(spec.models.as_ref(), spec.model_strategy)
        .with_validator(validator)
        .with_max_parallel(max_parallel)
        .with_instructions(spec.evaluator_instructions.as_deref())
        .with_extra_chars(tool_chars);
        let mut outcome = explorer
            .explore(round, worker.clone(), session, ctx)
            .await?;

        if let Some(reforge) = &spec.reforge
            && reforge.steps > 0
        {
            let threshold = reforge
                .threshold
                .as_deref()
                .map(|v| self.resolver.resolve(v))
                .transpose()?;
            let refiner = Refiner {
                explorer: &explorer,
                spec: reforge,
                phase,
                cascade_id: &self.cascade.cascade_id,
                intent: &task,
                model,
                fallback_evaluator: &spec.evaluator,
                original_input: &self.input,
                seed: &seed,
                max_parallel,
                threshold,
            };
            outcome = refiner.refine(outcome, worker, session, ctx).await?;
        }

        Ok(Attempted {
            output: outcome.output,
            route: outcome.route,
            messages: outcome.messages,
            images: outcome.images,
            ..Default::default()
        })
    }

    /// Attempt loop wrapping the turn loop. `attempts` is the phase-wide counter.
    #[allow(clippy::too_many_arguments)]
    async fn attempt_loop(
        &self,
        phase: &Phase,
        task: &str,
        model: &str,
        seed: Vec<Message>,
        session: &mut SessionState,
        ctx: &ExecutionContext,
        attempts: &mut u32,
    ) -> Result<Attempted, PhaseError> {
        let name = phase.name.as_str();
        let rules = &phase.rules;
        let max_attempts = rules.max_attempts.max(1);
        let max_turns = rules.max_turns.max(1);
        let validator = match &rules.loop_until {
            Some(v) => Some((v.as_str(), self.resolver.resolve(v)?)),
            None => None,
        };

        let mut prefix = seed;
        if let Some((validator_name, _)) = &validator
            && !rules.loop_until_silent
        {
            prefix.push(Message::system(rules.loop_until_prompt.clone().unwrap_or_else(|| {
                format!(
                    "Your output will be checked by the '{}' validator before it is accepted. \
                     Make sure it passes.",
                    validator_name
                )
            })));
        }
        let config = self.runner.config.context;
        let mut manager = ContextManager::new(config, prefix, Message::user(task));
        let tools = self.tools_for(phase);
        let mut usage = Attempted::default();
        let mut retry_base: Option<Vec<Message>> = None;

        loop {
            *attempts += 1;
            let attempt = *attempts;
            manager.reset_history();
            let mut route = None;
            let mut content = String::new();
            let mut images: Vec<String> = Vec::new();
            let mut passed_early = false;

            for turn in 1..=max_turns {
                if turn > 1 {
                    manager.push(Message::user(
                        rules
                            .turn_prompt
                            .clone()
                            .unwrap_or_else(|| CONTINUE_PROMPT.to_string()),
                    ));
                }
                let context = match &retry_base {
                    Some(base) => {
                        let mut context = base.clone();
                        context.extend(compress(manager.history(), &config));
                        context
                    }
                    None => manager.build(),
                };

                let response = self
                    .call(name, model, context, &tools, ctx, attempt, turn, &mut usage)
                    .await?;
                manager.push(response.to_message());
                images.extend(response.images.iter().cloned());
                session.append(
                    self.entry(ctx, "assistant", EntryKind::Message, name)
                        .with_content(Value::String(response.content.clone()))
                        .with_metadata(json!({"attempt": attempt, "turn": turn, "model": response.model})),
                );

                for call in &response.tool_calls {
                    let result = self.dispatch_tool(phase, call, &mut route).await;
                    session.append(
                        self.entry(ctx, "tool", EntryKind::ToolResult, name)
                            .with_content(Value::String(result.clone()))
                            .with_metadata(json!({"tool": call.name, "call_id": call.id})),
                    );
                    manager.push(Message::tool_result(&call.id, result));
                }
                content = response.content;

                if turn < max_turns
                    && rules.per_turn_validation
                    && let Some((_, v)) = &validator
                    && v.evaluate(&content, &self.input, ctx).await?.valid
                {
                    debug!(phase = %name, attempt, turn, "Validator satisfied, ending turns early");
                    passed_early = true;
                    break;
                }
            }

            let verdict = match &validator {
                Some(_) if passed_early => Verdict::pass(),
                Some((_, v)) => v.evaluate(&content, &self.input, ctx).await?,
                None => Verdict::pass(),
            };
            if let Some((validator_name, _)) = &validator {
                session.append(
                    self.entry(ctx, "validator", EntryKind::Validation, name).with_metadata(json!({
                        "validator": validator_name,
                        "attempt": attempt,
                        "valid": verdict.valid,
                        "reason": verdict.reason,
                    })),
                );
            }

            if verdict.valid {
                usage.output = Value::String(content);
                usage.route = route;
                usage.images = images;
                usage.messages = manager.history().to_vec();
                return Ok(usage);
            }

            warn!(phase = %name, attempt, reason = %verdict.reason, "Validation failed");
            session.record_error(
                ErrorEntry::new(Some(name), format!("Validation failed: {}", verdict.reason))
                    .with_attempt(attempt),
            );
            manager.record_failure(ValidationFailure::new(attempt, &content, &verdict.reason));
            if attempt >= max_attempts {
                return Err(PhaseError::MaxAttemptsExhausted {
                    phase: name.to_string(),
                    attempts: attempt,
                    last_reason: verdict.reason,
                });
            }
            retry_base = Some(manager.build_retry(&retry_instruction(rules, &verdict.reason, attempt + 1)));
        }
    }

    /// One model call with transport retry, usage accounting and logging.
    #[allow(clippy::too_many_arguments)]
    async fn call(
        &self,
        phase: &str,
        model: &str,
        context: Vec<Message>,
        tools: &[ToolSpec],
        ctx: &ExecutionContext,
        attempt: u32,
        turn: u32,
        usage: &mut Attempted,
    ) -> Result<AgentResponse, PhaseError> {
        ctx.check_budget()?;
        let request = AgentRequest::new(model, None)
            .with_context(context)
            .with_tools(tools.to_vec());
        let outcome = call_with_retry(self.runner.agent.as_ref(), &request, &self.runner.config.retry_config())
            .await
            .map_err(|(source, tries)| {
                error!(phase = %phase, attempt, turn, tries, error = %source, "Agent call failed");
                PhaseError::AgentExhausted {
                    phase: phase.to_string(),
                    attempts: tries,
                    source,
                }
            })?;

        let response = outcome.response;
        ctx.record_tokens(response.tokens_in + response.tokens_out);
        usage.add_usage(&response);
        self.runner.sink.record(
            LogEntry::at(ctx, "agent")
                .with_content(Value::String(response.content.clone()))
                .with_request(&response.request_id, response.cost)
                .with_metadata(json!({
                    "model": response.model,
                    "attempt": attempt,
                    "turn": turn,
                    "tries": outcome.tries,
                    "tokens_in": response.tokens_in,
                    "tokens_out": response.tokens_out,
                    "tool_calls": response.tool_calls.len(),
                })),
        );
        Ok(response)
    }

    /// Run a tool call and return the text fed back to the model.
    async fn dispatch_tool(&self, phase: &Phase, call: &ToolCall, route: &mut Option<String>) -> String {
        if call.name == ROUTE_TOOL {
            let target = call.arguments.get("target").and_then(Value::as_str).unwrap_or_default();
            if phase.handoffs.iter().any(|h| h == target) {
                info!(phase = %phase.name, target, "Route chosen");
                *route = Some(target.to_string());
                return format!("Routing to '{}' after this phase.", target);
            }
            warn!(phase = %phase.name, target, "Route to unknown target ignored");
            return format!(
                "Unknown target '{}'. Valid targets: {}",
                target,
                phase.handoffs.join(", ")
            );
        }

        if !phase.tools.contains(&call.name) {
            return PhaseError::Tool {
                tool: call.name.clone(),
                message: "not available in this phase".to_string(),
            }
            .to_string();
        }
        match self.runner.toolbox.call(&call.name, &call.arguments).await {
            Ok(result) => result,
            Err(e) => {
                warn!(phase = %phase.name, tool = %call.name, error = %e, "Tool call failed");
                PhaseError::Tool {
                    tool: call.name.clone(),
                    message: e.to_string(),
                }
                .to_string()
            }
        }
    }

    async fn human_checkpoint(
        &self,
        phase: &Phase,
        spec: &HumanInputSpec,
        output: &Value,
        session: &mut SessionState,
        ctx: &ExecutionContext,
    ) -> Result<(), PhaseError> {
        let blocked = |reason: String| PhaseError::Blocked {
            phase: phase.name.clone(),
            reason,
        };
        let Some(gateway) = &self.runner.gateway else {
            return Err(blocked("human input requested but no checkpoint gateway is configured".into()));
        };

        let mut ui = UiSpec::new(&spec.title).with_section("Output", &value_to_text(output));
        for field in &spec.fields {
            ui = ui.with_field(UiField::text(field, field));
        }
        ui = ui.with_field(UiField::confirm("reject", "Reject this output"));
        let timeout = spec
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.runner.config.checkpoint_timeout());

        let id = gateway
            .create(ui, Some(timeout))
            .await
            .map_err(|e| blocked(format!("checkpoint could not be created: {}", e)))?;
        info!(phase = %phase.name, checkpoint = %id, "Waiting for human input");
        let response = gateway
            .wait(&id, Some(timeout))
            .await
            .ok_or_else(|| PhaseError::CheckpointTimeout {
                checkpoint_id: id.clone(),
            })?;
        if response.is_reject() {
            return Err(blocked("rejected at human checkpoint".into()));
        }

        let value = response.into_value();
        session.append(
            self.entry(ctx, "human", EntryKind::Checkpoint, &phase.name)
                .with_content(value.clone())
                .with_metadata(json!({"checkpoint_id": id})),
        );
        session.set(&format!("human_{}", phase.name), value);
        Ok(())
    }

    fn record_wards(&self, session: &mut SessionState, ctx: &ExecutionContext, phase: &str, report: &WardReport) {
        for check in &report.checks {
            session.append(
                self.entry(ctx, "ward", EntryKind::Ward, phase)
                    .with_metadata(serde_json::to_value(check).unwrap_or(Value::Null)),
            );
        }
    }

    fn entry(&self, ctx: &ExecutionContext, role: &str, kind: EntryKind, phase: &str) -> HistoryEntry {
        HistoryEntry::new(&ctx.trace.id, ctx.trace.parent_id.as_deref(), role, kind).with_phase(phase)
    }

    fn scope(&self, session: &SessionState) -> RenderScope {
        RenderScope::new()
            .with("input", (*self.input).clone())
            .with("state", Value::Object(session.state().clone()))
            .with("outputs", session.outputs())
            .with("lineage", session.lineage_value())
    }

    fn model_for(&self, phase: &Phase) -> String {
        phase
            .model
            .clone()
            .or_else(|| self.cascade.model.clone())
            .unwrap_or_else(|| self.runner.config.engine.default_model.clone())
    }

    fn tools_for(&self, phase: &Phase) -> Vec<ToolSpec> {
        let mut tools = self.runner.toolbox.specs(&phase.tools);
        if phase.has_dynamic_routing() {
            tools.push(ToolSpec::route_to(&phase.handoffs));
        }
        tools
    }

    /// Candidate count. A template factor that does not render to a number counts as 1.
    fn factor(&self, phase: &Phase, scope: &RenderScope) -> usize {
        match phase.candidates.as_ref().map(|c| &c.factor) {
            None => 1,
            Some(FactorSpec::Count(n)) => (*n).max(1) as usize,
            Some(FactorSpec::Template(template)) => {
                let rendered = render(template, scope);
                match rendered.trim().parse::<usize>() {
                    Ok(n) => n.max(1),
                    Err(_) => {
                        warn!(phase = %phase.name, rendered = %rendered, "Candidate factor is not a number, using 1");
                        1
                    }
                }
            }
        }
    }

    /// Prior outputs named by the phase's context spec, in definition order.
    fn context_messages(&self, phase: &Phase, session: &SessionState) -> Vec<Message> {
        let Some(spec) = &phase.context else {
            return Vec::new();
        };
        let position = self.cascade.position(&phase.name).unwrap_or(0);
        let earlier = &self.cascade.phases[..position];

        let mut requested: Vec<&str> = Vec::new();
        if spec.auto {
            requested.extend(earlier.iter().map(|p| p.name.as_str()));
        }
        for source in &spec.from {
            match source.as_str() {
                "all" => requested.extend(earlier.iter().map(|p| p.name.as_str())),
                "previous" => requested.extend(earlier.last().map(|p| p.name.as_str())),
                "first" => requested.extend(earlier.first().map(|p| p.name.as_str())),
                name => requested.push(name),
            }
        }
        let mut names: Vec<&str> = Vec::with_capacity(requested.len());
        for name in requested {
            if !names.contains(&name) {
                names.push(name);
            }
        }

        names
            .into_iter()
            .filter_map(|name| {
                session.output_of(name).map(|output| {
                    Message::user(format!("Output of phase '{}':\n{}", name, value_to_text(output)))
                })
            })
            .collect()
    }
}

/// Retry message for the next attempt.
fn retry_instruction(rules: &Rules, reason: &str, attempt: u32) -> String {
    let template = rules
        .retry_instructions
        .as_deref()
        .unwrap_or(DEFAULT_RETRY_INSTRUCTIONS);
    let scope = RenderScope::new()
        .with("validation_error", Value::String(reason.to_string()))
        .with("attempt", json!(attempt));
    render(template, &scope)
}

/// Runs one soundings candidate through the phase's attempt loop.
struct CandidateRunner {
    exec: PhaseExecutor,
    index: PhaseIndex,
}

#[async_trait]
impl CandidateWorker for CandidateRunner {
    async fn run_candidate(
        &self,
        plan: CandidatePlan,
        mut session: SessionFork,
        ctx: ExecutionContext,
    ) -> Result<CandidateResult, PhaseError> {
        let phase = &self.exec.cascade.phases[self.index];
        let mut attempts = 0;
        let attempted = self
            .exec
            .attempt_loop(phase, &plan.prompt, &plan.model, plan.seed, &mut session.state, &ctx, &mut attempts)
            .await?;

        let mut result = CandidateResult::new(plan.index, &plan.model, attempted.output, session);
        result.messages = attempted.messages;
        result.images = attempted.images;
        result.route = attempted.route;
        result.cost = attempted.cost;
        result.tokens_in = attempted.tokens_in;
        result.tokens_out = attempted.tokens_out;
        result.request_ids = attempted.request_ids;
        Ok(result)
    }
}
