//! Fan-out, evaluation and merge for one soundings round.

use super::evaluator::{Evaluator, EvaluatorSettings};
use super::models::{assign_models, estimate_tokens, filter_by_context};
use super::mutation::{self, Mutation};
use super::winners::{WinnerRecord, WinnerStore, record_metadata, species_fingerprint};
use super::CandidateResult;
use crate::agent::{Agent, AgentRequest, Message, call_with_retry, total_size};
use crate::audit::{LogEntry, LogSink};
use crate::checkpoint::CheckpointGateway;
use crate::config::ModelCatalog;
use crate::definition::{EvaluatorSpec, ModelStrategy, ModelsSpec, MutationMode, Phase};
use crate::errors::PhaseError;
use crate::state::{EntryKind, ErrorEntry, ExecutionContext, HistoryEntry, SessionFork, SessionState};
use crate::wards::{Validator, Verdict};
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Previously winning rewrites shown to the rewrite call.
const REWRITE_EXAMPLES: usize = 3;

/// Everything one candidate needs to run.
#[derive(Debug, Clone)]
pub struct CandidatePlan {
    pub index: usize,
    pub model: String,
    /// Prompt after mutation
    pub prompt: String,
    pub mutation: Option<Mutation>,
    /// Context snapshot taken before fan-out
    pub seed: Vec<Message>,
}

/// Runs one candidate against a private session fork.
#[async_trait]
pub trait CandidateWorker: Send + Sync {
    async fn run_candidate(
        &self,
        plan: CandidatePlan,
        session: SessionFork,
        ctx: ExecutionContext,
    ) -> Result<CandidateResult, PhaseError>;
}

/// Parameters of one round.
pub struct Round<'a> {
    pub phase: &'a Phase,
    pub cascade_id: &'a str,
    pub factor: usize,
    /// Rendered baseline prompt
    pub prompt: String,
    pub seed: Vec<Message>,
    /// Model used when no multi-model config is given
    pub model: String,
    pub evaluator: &'a EvaluatorSpec,
    pub mutation: MutationMode,
    pub models: Option<&'a ModelsSpec>,
    pub strategy: ModelStrategy,
    /// Screens candidates before evaluation
    pub validator: Option<Arc<dyn Validator>>,
    pub original_input: &'a Value,
    pub max_parallel: usize,
    pub instructions: Option<&'a str>,
    /// Characters beyond prompt and seed that count toward the context window
    pub extra_chars: usize,
    /// Prefix for candidate trace nodes
    pub label: &'a str,
}

impl<'a> Round<'a> {
    pub fn new(
        phase: &'a Phase,
        cascade_id: &'a str,
        prompt: String,
        model: &str,
        evaluator: &'a EvaluatorSpec,
        original_input: &'a Value,
    ) -> Self {
        Self {
            phase,
            cascade_id,
            factor: 1,
            prompt,
            seed: Vec::new(),
            model: model.to_string(),
            evaluator,
            mutation: MutationMode::None,
            models: None,
            strategy: ModelStrategy::RoundRobin,
            validator: None,
            original_input,
            max_parallel: 1,
            instructions: None,
            extra_chars: 0,
            label: "sounding",
        }
    }

    pub fn with_factor(mut self, factor: usize) -> Self {
        self.factor = factor;
        self
    }

    pub fn with_seed(mut self, seed: Vec<Message>) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_mutation(mut self, mode: MutationMode) -> Self {
        self.mutation = mode;
        self
    }

    pub fn with_models(mut self, models: Option<&'a ModelsSpec>, strategy: ModelStrategy) -> Self {
        self.models = models;
        self.strategy = strategy;
        self
    }

    pub fn with_validator(mut self, validator: Option<Arc<dyn Validator>>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    pub fn with_instructions(mut self, instructions: Option<&'a str>) -> Self {
        self.instructions = instructions;
        self
    }

    pub fn with_extra_chars(mut self, chars: usize) -> Self {
        self.extra_chars = chars;
        self
    }

    pub fn with_label(mut self, label: &'a str) -> Self {
        self.label = label;
        self
    }
}

/// What a round settled on.
#[derive(Debug, Clone)]
pub struct RoundOutcome {
    /// Every successful candidate, ordered by index; sessions already consumed
    pub candidates: Vec<CandidateResult>,
    /// Candidate indices marked as winners
    pub winners: Vec<usize>,
    pub output: Value,
    pub route: Option<String>,
    pub images: Vec<String>,
    pub messages: Vec<Message>,
    pub fingerprint: String,
}

impl RoundOutcome {
    /// The first winner.
    pub fn winner(&self) -> Option<&CandidateResult> {
        let first = *self.winners.first()?;
        self.candidates.iter().find(|c| c.index == first)
    }
}

/// Candidate explorer shared by soundings and reforge.
#[derive(Clone)]
pub struct Explorer {
    agent: Arc<dyn Agent>,
    sink: Arc<dyn LogSink>,
    gateway: Option<Arc<dyn CheckpointGateway>>,
    winners: Arc<dyn WinnerStore>,
    catalog: Arc<ModelCatalog>,
    settings: EvaluatorSettings,
    safety_multiplier: f64,
}

impl Explorer {
    pub fn new(
        agent: Arc<dyn Agent>,
        sink: Arc<dyn LogSink>,
        winners: Arc<dyn WinnerStore>,
        catalog: ModelCatalog,
        settings: EvaluatorSettings,
    ) -> Self {
        Self {
            agent,
            sink,
            gateway: None,
            winners,
            catalog: Arc::new(catalog),
            settings,
            safety_multiplier: 1.0,
        }
    }

    pub fn with_gateway(mut self, gateway: Option<Arc<dyn CheckpointGateway>>) -> Self {
        self.gateway = gateway;
        self
    }

    pub fn with_safety_multiplier(mut self, multiplier: f64) -> Self {
        self.safety_multiplier = multiplier;
        self
    }

    pub fn winner_store(&self) -> &Arc<dyn WinnerStore> {
        &self.winners
    }

    /// Run one round: plan, fan out, screen, evaluate, merge.
    pub async fn explore(
        &self,
        round: Round<'_>,
        worker: Arc<dyn CandidateWorker>,
        session: &mut SessionState,
        ctx: &ExecutionContext,
    ) -> Result<RoundOutcome, PhaseError> {
        let phase = round.phase.name.as_str();
        let fingerprint = species_fingerprint(round.cascade_id, round.phase, &round.prompt);

        let models = self.assign(&round);
        info!(
            phase = %phase,
            candidates = models.len(),
            evaluator = round.evaluator.kind(),
            "Starting soundings"
        );
        let plans = self.plan(&round, models, &fingerprint, ctx).await;
        let planned: HashMap<usize, (String, Option<Mutation>)> = plans
            .iter()
            .map(|p| (p.index, (p.prompt.clone(), p.mutation.clone())))
            .collect();

        // Trace nodes are allocated before any worker starts.
        let traces = ctx.trace.children(round.label, plans.len());
        let semaphore = Arc::new(Semaphore::new(round.max_parallel.max(1)));
        let mut tasks: JoinSet<(usize, Result<CandidateResult, PhaseError>)> = JoinSet::new();
        let mut spawned: HashMap<tokio::task::Id, usize> = HashMap::new();
        for (plan, trace) in plans.into_iter().zip(traces) {
            let index = plan.index;
            let fork = session.fork();
            let candidate_ctx = ctx.for_candidate(index, trace);
            let worker = worker.clone();
            let semaphore = semaphore.clone();
            let handle = tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                (index, worker.run_candidate(plan, fork, candidate_ctx).await)
            });
            spawned.insert(handle.id(), index);
        }

        let mut results: Vec<CandidateResult> = Vec::new();
        let mut failures: Vec<PhaseError> = Vec::new();
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, (_, Ok(mut candidate)))) => {
                    if let Some((prompt, mutation)) = planned.get(&candidate.index) {
                        candidate.prompt = prompt.clone();
                        candidate.mutation = mutation.clone();
                    }
                    results.push(candidate);
                }
                Ok((_, (index, Err(err)))) => {
                    warn!(phase = %phase, candidate = index, error = %err, "Candidate failed");
                    session.record_error(
                        ErrorEntry::new(Some(phase), err.to_string()).with_candidate(index),
                    );
                    failures.push(err);
                }
                Err(join_err) => {
                    let index = spawned.get(&join_err.id()).copied().unwrap_or_default();
                    error!(phase = %phase, candidate = index, "Candidate task panicked: {}", join_err);
                    session.record_error(
                        ErrorEntry::new(Some(phase), format!("Candidate task panicked: {}", join_err))
                            .with_candidate(index),
                    );
                }
            }
        }

        if let Some(blocking) = failures.iter().find(|e| e.is_blocking()) {
            return Err(blocking.clone());
        }
        if results.is_empty() {
            return Err(failures.into_iter().next().unwrap_or(PhaseError::NoCandidates {
                phase: phase.to_string(),
            }));
        }
        results.sort_by_key(|c| c.index);

        self.screen(&round, &mut results, ctx).await;
        let (mut pool, mut rest): (Vec<CandidateResult>, Vec<CandidateResult>) = results
            .into_iter()
            .partition(|c| c.verdict.as_ref().is_none_or(|v| v.valid));
        if pool.is_empty() {
            warn!(phase = %phase, "Every candidate failed screening, evaluating all of them");
            std::mem::swap(&mut pool, &mut rest);
        }

        let evaluator = Evaluator {
            agent: self.agent.as_ref(),
            sink: self.sink.as_ref(),
            gateway: self.gateway.as_deref(),
            catalog: &self.catalog,
            settings: &self.settings,
            phase,
            task: &round.prompt,
            instructions: round.instructions,
        };
        let evaluation = evaluator.evaluate(round.evaluator, &mut pool, ctx).await?;

        // Only winners' forks are folded back; everything else is dropped.
        let mut winners: Vec<usize> = Vec::new();
        let mut images = Vec::new();
        let mut messages = Vec::new();
        for &position in &evaluation.winners {
            let Some(candidate) = pool.get_mut(position) else {
                continue;
            };
            if let Some(fork) = candidate.session.take() {
                session.merge(fork);
            }
            winners.push(candidate.index);
            images.extend(candidate.images.iter().cloned());
            messages.extend(candidate.messages.iter().cloned());
        }
        let first = evaluation.winners.first().and_then(|&p| pool.get(p));
        let output = match (&evaluation.merged, first) {
            (Some(merged), _) => merged.clone(),
            (None, Some(winner)) => winner.output.clone(),
            (None, None) => Value::Null,
        };
        let route = if evaluation.merged.is_some() {
            None
        } else {
            first.and_then(|w| w.route.clone())
        };

        let mut candidates: Vec<CandidateResult> = pool
            .into_iter()
            .chain(rest)
            .map(|mut c| {
                c.session = None;
                c
            })
            .collect();
        candidates.sort_by_key(|c| c.index);

        self.record(&round, &fingerprint, &winners, &candidates, &output, &evaluation.reasoning, session, ctx);
        info!(phase = %phase, winners = ?winners, "Soundings settled");

        Ok(RoundOutcome {
            candidates,
            winners,
            output,
            route,
            images,
            messages,
            fingerprint,
        })
    }

    fn assign(&self, round: &Round<'_>) -> Vec<String> {
        let assigned = {
            let mut rng = rand::thread_rng();
            assign_models(round.factor, &round.model, round.models, round.strategy, &mut rng)
        };
        let required = estimate_tokens(
            round.prompt.chars().count() + total_size(&round.seed) + round.extra_chars,
        );
        filter_by_context(assigned, required, self.safety_multiplier, &self.catalog)
    }

    /// Mutated prompt per candidate. Rewrite calls run concurrently.
    async fn plan(
        &self,
        round: &Round<'_>,
        models: Vec<String>,
        fingerprint: &str,
        ctx: &ExecutionContext,
    ) -> Vec<CandidatePlan> {
        let examples = if round.mutation == MutationMode::Rewrite {
            self.winners
                .winning_rewrites(fingerprint, REWRITE_EXAMPLES)
                .unwrap_or_else(|e| {
                    warn!(error = %e, "Could not read earlier winners");
                    Vec::new()
                })
        } else {
            Vec::new()
        };

        let plans = models.into_iter().enumerate().map(|(index, model)| {
            let examples = &examples;
            async move {
                let (prompt, mutation) = match round.mutation {
                    MutationMode::Rewrite | MutationMode::RewriteFree if index > 0 => {
                        self.rewrite(round, &model, examples, index, ctx).await
                    }
                    mode => match mutation::apply_fixed(mode, index, &round.prompt) {
                        Some((prompt, mutation)) => (prompt, Some(mutation)),
                        None => (round.prompt.clone(), None),
                    },
                };
                CandidatePlan {
                    index,
                    model,
                    prompt,
                    mutation,
                    seed: round.seed.clone(),
                }
            }
        });
        join_all(plans).await
    }

    /// Auxiliary rewrite call. Falls back to the baseline prompt on failure.
    async fn rewrite(
        &self,
        round: &Round<'_>,
        model: &str,
        examples: &[String],
        index: usize,
        ctx: &ExecutionContext,
    ) -> (String, Option<Mutation>) {
        let baseline = (round.prompt.clone(), None);
        if let Err(e) = ctx.check_budget() {
            warn!(candidate = index, error = %e, "Skipping prompt rewrite");
            return baseline;
        }

        let request = AgentRequest::new(model, Some(mutation::rewrite_request(&round.prompt, examples)));
        match call_with_retry(self.agent.as_ref(), &request, &self.settings.retry).await {
            Ok(outcome) => {
                let response = outcome.response;
                ctx.record_tokens(response.tokens_in + response.tokens_out);
                self.sink.record(
                    LogEntry::at(ctx, "mutation")
                        .with_content(Value::String(response.content.clone()))
                        .with_request(&response.request_id, response.cost)
                        .with_metadata(json!({"candidate": index, "mode": round.mutation})),
                );
                let rewritten = response.content.trim();
                if rewritten.is_empty() {
                    warn!(candidate = index, "Empty prompt rewrite, using baseline");
                    return baseline;
                }
                debug!(candidate = index, "Prompt rewritten");
                (
                    rewritten.to_string(),
                    Some(Mutation {
                        mode: round.mutation,
                        applied: rewritten.to_string(),
                    }),
                )
            }
            Err((e, tries)) => {
                warn!(candidate = index, tries, error = %e, "Prompt rewrite failed, using baseline");
                baseline
            }
        }
    }

    /// Attach a verdict to every candidate when a screening validator is set.
    async fn screen(&self, round: &Round<'_>, results: &mut [CandidateResult], ctx: &ExecutionContext) {
        let Some(validator) = &round.validator else {
            return;
        };
        for candidate in results.iter_mut() {
            let verdict = match validator
                .evaluate(&candidate.text(), round.original_input, ctx)
                .await
            {
                Ok(verdict) => verdict,
                Err(e) => Verdict::fail(e.to_string()),
            };
            if !verdict.valid {
                debug!(candidate = candidate.index, reason = %verdict.reason, "Candidate failed screening");
            }
            candidate.verdict = Some(verdict);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        round: &Round<'_>,
        fingerprint: &str,
        winners: &[usize],
        candidates: &[CandidateResult],
        output: &Value,
        reasoning: &Option<String>,
        session: &mut SessionState,
        ctx: &ExecutionContext,
    ) {
        let phase = round.phase.name.as_str();
        for candidate in candidates {
            self.sink.record(
                LogEntry::at(ctx, "sounding_attempt")
                    .with_content(candidate.output.clone())
                    .with_metadata(candidate.metadata(winners.contains(&candidate.index))),
            );
        }

        let winning: Vec<&CandidateResult> = candidates
            .iter()
            .filter(|c| winners.contains(&c.index))
            .collect();
        let rewritten = matches!(round.mutation, MutationMode::Rewrite | MutationMode::RewriteFree)
            .then(|| {
                winning
                    .iter()
                    .find_map(|c| c.mutation.as_ref().map(|m| m.applied.clone()))
            })
            .flatten();
        let model = winning.first().map_or(round.model.as_str(), |c| c.model.as_str());
        let record = WinnerRecord::new(fingerprint, phase, winners.to_vec(), round.evaluator.kind(), model)
            .with_rewritten_prompt(rewritten);

        session.append(
            HistoryEntry::new(&ctx.trace.id, ctx.trace.parent_id.as_deref(), "soundings", EntryKind::Soundings)
                .with_phase(phase)
                .with_content(output.clone())
                .with_metadata(json!({
                    "winner": record_metadata(&record),
                    "label": round.label,
                    "reasoning": reasoning,
                    "candidates": candidates.iter().map(|c| c.metadata(winners.contains(&c.index))).collect::<Vec<_>>(),
                })),
        );

        if let Err(e) = self.winners.record(record) {
            warn!(phase = %phase, error = %e, "Could not persist soundings winner");
        }
    }
}
