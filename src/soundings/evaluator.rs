//! Candidate evaluation policies.
//!
//! Every policy takes the eligible candidates and returns the positions of the
//! winners within that slice. Judge replies label candidates `Attempt 1..N`.

use super::CandidateResult;
use super::pareto::{self, Scored};
use crate::agent::{Agent, AgentRequest, RetryConfig, call_with_retry};
use crate::audit::{LogEntry, LogSink};
use crate::checkpoint::{CheckpointGateway, CheckpointResponse, UiField, UiSpec};
use crate::config::ModelCatalog;
use crate::definition::{AggregateMerge, EvaluatorSpec, ParetoPolicy, TimeoutFallback};
use crate::errors::PhaseError;
use crate::state::ExecutionContext;
use rand::Rng;
use serde_json::{Value, json};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const COST_POLL: Duration = Duration::from_millis(100);

/// Knobs shared by all policies.
#[derive(Debug, Clone)]
pub struct EvaluatorSettings {
    pub judge_model: String,
    pub retry: RetryConfig,
    /// How long to wait for late cost data from the log sink
    pub cost_wait: Duration,
    pub checkpoint_timeout: Duration,
}

/// Result of one evaluation.
#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    /// Positions of the winners in the evaluated slice
    pub winners: Vec<usize>,
    /// Synthetic output (aggregate mode)
    pub merged: Option<Value>,
    /// Judge reply or human response, for the record
    pub reasoning: Option<String>,
}

impl Evaluation {
    fn single(position: usize, reasoning: Option<String>) -> Self {
        Self {
            winners: vec![position],
            merged: None,
            reasoning,
        }
    }
}

pub struct Evaluator<'a> {
    pub agent: &'a dyn Agent,
    pub sink: &'a dyn LogSink,
    pub gateway: Option<&'a dyn CheckpointGateway>,
    pub catalog: &'a ModelCatalog,
    pub settings: &'a EvaluatorSettings,
    pub phase: &'a str,
    /// The task every candidate attempted
    pub task: &'a str,
    /// Extra judge guidance from the phase definition
    pub instructions: Option<&'a str>,
}

impl Evaluator<'_> {
    pub async fn evaluate(
        &self,
        spec: &EvaluatorSpec,
        candidates: &mut [CandidateResult],
        ctx: &ExecutionContext,
    ) -> Result<Evaluation, PhaseError> {
        if candidates.is_empty() {
            return Err(PhaseError::NoCandidates {
                phase: self.phase.to_string(),
            });
        }
        if candidates.len() == 1 && !matches!(spec, EvaluatorSpec::Aggregate { .. }) {
            return Ok(Evaluation::single(0, None));
        }

        let evaluation = match spec {
            EvaluatorSpec::Quality => self.quality(candidates, ctx).await?,
            EvaluatorSpec::CostAware {
                quality_weight,
                cost_weight,
            } => {
                self.cost_aware(candidates, *quality_weight, *cost_weight, ctx)
                    .await?
            }
            EvaluatorSpec::Pareto { policy } => self.pareto(candidates, *policy, ctx).await?,
            EvaluatorSpec::Human {
                prefilter_top_k,
                timeout_secs,
                on_timeout,
            } => {
                self.human(candidates, *prefilter_top_k, *timeout_secs, *on_timeout, ctx)
                    .await?
            }
            EvaluatorSpec::Aggregate { merge } => self.aggregate(candidates, *merge, ctx).await?,
        };

        info!(
            phase = %self.phase,
            evaluator = spec.kind(),
            winners = ?evaluation.winners,
            "Candidates evaluated"
        );
        Ok(evaluation)
    }

    async fn quality(
        &self,
        candidates: &[CandidateResult],
        ctx: &ExecutionContext,
    ) -> Result<Evaluation, PhaseError> {
        let prompt = self.judge_prompt(
            candidates,
            None,
            "Reply with the number of the best attempt first, then one sentence explaining why.",
        );
        let reply = self.judge(prompt, ctx).await?;
        let winner = pareto::parse_winner_index(&reply, candidates.len());
        Ok(Evaluation::single(winner, Some(reply)))
    }

    async fn cost_aware(
        &self,
        candidates: &mut [CandidateResult],
        quality_weight: f64,
        cost_weight: f64,
        ctx: &ExecutionContext,
    ) -> Result<Evaluation, PhaseError> {
        let costs = self.collect_costs(candidates).await;
        let guidance = format!(
            "Weigh quality at {:.0}% and cost at {:.0}% when choosing. A slightly weaker attempt \
             that costs much less can be the better choice.",
            quality_weight * 100.0,
            cost_weight * 100.0
        );
        let prompt = self.judge_prompt(
            candidates,
            Some(&costs),
            &format!(
                "{}\nReply with the number of the best attempt first, then one sentence \
                 explaining why.",
                guidance
            ),
        );
        let reply = self.judge(prompt, ctx).await?;
        Ok(Evaluation::single(
            pareto::parse_winner_index(&reply, candidates.len()),
            Some(reply),
        ))
    }

    async fn pareto(
        &self,
        candidates: &mut [CandidateResult],
        policy: ParetoPolicy,
        ctx: &ExecutionContext,
    ) -> Result<Evaluation, PhaseError> {
        let costs = self.collect_costs(candidates).await;
        let (qualities, reply) = self.score(candidates, ctx).await?;

        let points: Vec<Scored> = qualities
            .iter()
            .zip(&costs)
            .map(|(&quality, &cost)| Scored { quality, cost })
            .collect();
        let front = pareto::frontier(&points);
        for &i in &front {
            candidates[i].on_frontier = true;
        }
        debug!(phase = %self.phase, frontier = ?front, "Pareto frontier computed");

        let chosen = if policy == ParetoPolicy::External {
            match self.present(candidates, &front, None, ctx).await? {
                Presented::Chosen(position, _) => Some(position),
                Presented::Rejected => {
                    return Err(PhaseError::HumanRejected {
                        phase: self.phase.to_string(),
                    });
                }
                Presented::TimedOut(_) | Presented::NoSelection(_) => {
                    warn!(phase = %self.phase, "No external choice, using highest quality");
                    pareto::choose(&points, &front, ParetoPolicy::HighestQuality)
                }
            }
        } else {
            pareto::choose(&points, &front, policy)
        };

        Ok(Evaluation::single(chosen.unwrap_or(0), Some(reply)))
    }

    async fn human(
        &self,
        candidates: &mut [CandidateResult],
        prefilter_top_k: Option<usize>,
        timeout_secs: Option<u64>,
        on_timeout: TimeoutFallback,
        ctx: &ExecutionContext,
    ) -> Result<Evaluation, PhaseError> {
        let mut shown: Vec<usize> = (0..candidates.len()).collect();
        if let Some(k) = prefilter_top_k
            && k > 0
            && k < candidates.len()
        {
            let (scores, _) = self.score(candidates, ctx).await?;
            shown.sort_by(|a, b| scores[*b].total_cmp(&scores[*a]).then(a.cmp(b)));
            shown.truncate(k);
            shown.sort_unstable();
            debug!(phase = %self.phase, shown = ?shown, "Prefiltered candidates for review");
        }

        let timeout = timeout_secs.map(Duration::from_secs);
        match self.present(candidates, &shown, timeout, ctx).await? {
            Presented::Chosen(position, response) => Ok(Evaluation::single(
                position,
                Some(response.into_value().to_string()),
            )),
            Presented::Rejected => Err(PhaseError::HumanRejected {
                phase: self.phase.to_string(),
            }),
            Presented::TimedOut(checkpoint_id) => {
                warn!(phase = %self.phase, fallback = ?on_timeout, "Candidate review timed out");
                self.unanswered(candidates, &shown, on_timeout, checkpoint_id, ctx).await
            }
            Presented::NoSelection(checkpoint_id) => {
                warn!(
                    phase = %self.phase,
                    fallback = ?on_timeout,
                    "Candidate review answer named no shown attempt"
                );
                self.unanswered(candidates, &shown, on_timeout, checkpoint_id, ctx).await
            }
        }
    }

    /// Apply the configured fallback when review produced no usable choice.
    async fn unanswered(
        &self,
        candidates: &[CandidateResult],
        shown: &[usize],
        on_timeout: TimeoutFallback,
        checkpoint_id: String,
        ctx: &ExecutionContext,
    ) -> Result<Evaluation, PhaseError> {
        match on_timeout {
            TimeoutFallback::Abort => Err(PhaseError::CheckpointTimeout { checkpoint_id }),
            TimeoutFallback::First => Ok(Evaluation::single(shown[0], None)),
            TimeoutFallback::Random => {
                let pick = shown[rand::thread_rng().gen_range(0..shown.len())];
                Ok(Evaluation::single(pick, None))
            }
            TimeoutFallback::LlmFallback => {
                let subset: Vec<CandidateResult> = shown.iter().map(|&i| candidates[i].clone()).collect();
                let inner = self.quality(&subset, ctx).await?;
                let winner = inner.winners.first().map_or(shown[0], |&w| shown[w]);
                Ok(Evaluation::single(winner, inner.reasoning))
            }
        }
    }

    async fn aggregate(
        &self,
        candidates: &[CandidateResult],
        merge: AggregateMerge,
        ctx: &ExecutionContext,
    ) -> Result<Evaluation, PhaseError> {
        let merged = match merge {
            AggregateMerge::Concatenate => candidates
                .iter()
                .enumerate()
                .map(|(i, c)| format!("## Attempt {}\n\n{}", i + 1, c.text()))
                .collect::<Vec<_>>()
                .join("\n\n"),
            AggregateMerge::LlmMerge => {
                let mut prompt = format!(
                    "Merge the {} attempts below into a single output that keeps the strongest \
                     parts of each and resolves contradictions. Reply with the merged output only.\n\n\
                     Task:\n{}\n",
                    candidates.len(),
                    self.task
                );
                push_attempts(&mut prompt, candidates, None);
                self.judge(prompt, ctx).await?
            }
        };

        Ok(Evaluation {
            winners: (0..candidates.len()).collect(),
            merged: Some(Value::String(merged)),
            reasoning: None,
        })
    }

    /// Ask the judge for a 0-100 score per candidate.
    async fn score(
        &self,
        candidates: &mut [CandidateResult],
        ctx: &ExecutionContext,
    ) -> Result<(Vec<f64>, String), PhaseError> {
        let prompt = self.judge_prompt(
            candidates,
            None,
            "Score the quality of every attempt from 0 to 100. Reply with one line per attempt \
             in the form `Attempt N: score`.",
        );
        let reply = self.judge(prompt, ctx).await?;
        let scores = pareto::parse_scores(&reply, candidates.len());
        for (candidate, &score) in candidates.iter_mut().zip(&scores) {
            candidate.quality = Some(score);
        }
        Ok((scores, reply))
    }

    /// Show candidates through the checkpoint gateway.
    async fn present(
        &self,
        candidates: &[CandidateResult],
        shown: &[usize],
        timeout: Option<Duration>,
        ctx: &ExecutionContext,
    ) -> Result<Presented, PhaseError> {
        let timeout = timeout.unwrap_or(self.settings.checkpoint_timeout);
        let Some(gateway) = self.gateway else {
            warn!(phase = %self.phase, "No checkpoint gateway configured");
            return Ok(Presented::TimedOut(String::new()));
        };

        let mut ui = UiSpec::new(&format!("Choose the best output for phase '{}'", self.phase));
        for (n, &i) in shown.iter().enumerate() {
            let candidate = &candidates[i];
            let mut heading = format!("Attempt {} ({})", n + 1, candidate.model);
            if let Some(q) = candidate.quality {
                heading.push_str(&format!(", quality {:.0}", q));
            }
            if let Some(c) = candidate.cost {
                heading.push_str(&format!(", cost ${:.4}", c));
            }
            ui = ui.with_section(&heading, &candidate.text());
        }
        ui = ui
            .with_field(UiField::choice(
                "selected",
                "Best attempt",
                (1..=shown.len()).map(|n| n.to_string()).collect(),
            ))
            .with_field(UiField::confirm("reject", "Reject all attempts"));

        let id = gateway
            .create(ui, Some(timeout))
            .await
            .map_err(|e| PhaseError::Validator {
                name: "checkpoint".to_string(),
                message: e.to_string(),
            })?;
        self.sink.record(
            LogEntry::at(ctx, "checkpoint")
                .with_metadata(json!({"checkpoint_id": id, "candidates": shown})),
        );

        let Some(response) = gateway.wait(&id, Some(timeout)).await else {
            self.record_unanswered(ctx, &id, "timed_out", None);
            return Ok(Presented::TimedOut(id));
        };
        if response.is_reject() {
            return Ok(Presented::Rejected);
        }
        match response.selected() {
            Some(n) if (1..=shown.len()).contains(&n) => Ok(Presented::Chosen(shown[n - 1], response)),
            other => {
                self.record_unanswered(ctx, &id, "no_selection", other);
                Ok(Presented::NoSelection(id))
            }
        }
    }

    fn record_unanswered(&self, ctx: &ExecutionContext, checkpoint_id: &str, outcome: &str, selected: Option<usize>) {
        self.sink.record(
            LogEntry::at(ctx, "checkpoint_unanswered").with_metadata(json!({
                "checkpoint_id": checkpoint_id,
                "outcome": outcome,
                "selected": selected,
            })),
        );
    }

    /// Per-candidate cost: sink data (waiting briefly for stragglers), else the
    /// provider-reported cost, else a catalog estimate.
    async fn collect_costs(&self, candidates: &mut [CandidateResult]) -> Vec<f64> {
        let deadline = Instant::now() + self.settings.cost_wait;
        let mut logged: Vec<Option<f64>> = vec![None; candidates.len()];

        loop {
            for (slot, candidate) in logged.iter_mut().zip(candidates.iter()) {
                if slot.is_some() || candidate.request_ids.is_empty() {
                    continue;
                }
                let mut total = 0.0;
                let mut complete = true;
                for id in &candidate.request_ids {
                    match self.sink.cost_for(id).await {
                        Some(cost) => total += cost,
                        None => complete = false,
                    }
                }
                if complete {
                    *slot = Some(total);
                }
            }

            let waiting = logged
                .iter()
                .zip(candidates.iter())
                .any(|(slot, c)| slot.is_none() && !c.request_ids.is_empty());
            let now = Instant::now();
            if !waiting || now >= deadline {
                break;
            }
            tokio::time::sleep(COST_POLL.min(deadline - now)).await;
        }

        candidates
            .iter_mut()
            .zip(logged)
            .map(|(candidate, logged)| {
                let cost = logged.or(candidate.cost).unwrap_or_else(|| {
                    self.catalog
                        .estimate_cost(&candidate.model, candidate.tokens_in, candidate.tokens_out)
                });
                candidate.cost = Some(cost);
                cost
            })
            .collect()
    }

    fn judge_prompt(&self, candidates: &[CandidateResult], costs: Option<&[f64]>, ask: &str) -> String {
        let mut prompt = format!(
            "You are judging {} attempts at the same task.\n\nTask:\n{}\n",
            candidates.len(),
            self.task
        );
        if let Some(instructions) = self.instructions {
            prompt.push_str(&format!("\nAdditional guidance:\n{}\n", instructions));
        }
        push_attempts(&mut prompt, candidates, costs);
        prompt.push('\n');
        prompt.push_str(ask);
        prompt
    }

    /// One auxiliary model call with retry, logged to the sink.
    async fn judge(&self, prompt: String, ctx: &ExecutionContext) -> Result<String, PhaseError> {
        ctx.check_budget()?;
        let request = AgentRequest::new(&self.settings.judge_model, Some(prompt));
        let outcome = call_with_retry(self.agent, &request, &self.settings.retry)
            .await
            .map_err(|(source, attempts)| PhaseError::AgentExhausted {
                phase: self.phase.to_string(),
                attempts,
                source,
            })?;
        let response = outcome.response;
        ctx.record_tokens(response.tokens_in + response.tokens_out);
        self.sink.record(
            LogEntry::at(ctx, "evaluator")
                .with_content(Value::String(response.content.clone()))
                .with_request(&response.request_id, response.cost)
                .with_metadata(json!({"model": response.model})),
        );
        Ok(response.content)
    }
}

enum Presented {
    Chosen(usize, CheckpointResponse),
    Rejected,
    /// No answer in time, or no gateway to ask.
    TimedOut(String),
    /// An answer arrived but named none of the shown attempts.
    NoSelection(String),
}

fn push_attempts(prompt: &mut String, candidates: &[CandidateResult], costs: Option<&[f64]>) {
    for (i, candidate) in candidates.iter().enumerate() {
        match costs {
            Some(costs) => prompt.push_str(&format!(
                "\nAttempt {} (cost: ${:.6}):\n{}\n",
                i + 1,
                costs[i],
                candidate.text()
            )),
            None => prompt.push_str(&format!("\nAttempt {}:\n{}\n", i + 1, candidate.text())),
        }
    }
}
