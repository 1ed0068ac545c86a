//! Iterative refinement of a soundings winner ("reforge").
//!
//! Each step asks a small soundings round to improve the current best output.
//! The step's winner becomes the next step's starting point. A threshold
//! validator, when configured, ends the loop as soon as the current best
//! satisfies it.

use crate::agent::Message;
use crate::definition::{EvaluatorSpec, Phase, ReforgeSpec};
use crate::errors::PhaseError;
use crate::soundings::mutation::approach_hint;
use crate::soundings::{CandidateWorker, Explorer, Round, RoundOutcome};
use crate::state::{EntryKind, ExecutionContext, HistoryEntry, SessionState};
use crate::template::value_to_text;
use crate::wards::Validator;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Refiner<'a> {
    pub explorer: &'a Explorer,
    pub spec: &'a ReforgeSpec,
    pub phase: &'a Phase,
    pub cascade_id: &'a str,
    /// The phase's rendered task
    pub intent: &'a str,
    pub model: &'a str,
    /// Used when the reforge spec has no evaluator of its own
    pub fallback_evaluator: &'a EvaluatorSpec,
    pub original_input: &'a Value,
    pub seed: &'a [Message],
    pub max_parallel: usize,
    pub threshold: Option<Arc<dyn Validator>>,
}

impl Refiner<'_> {
    /// Refine `best` for up to `spec.steps` rounds.
    pub async fn refine(
        &self,
        mut best: RoundOutcome,
        worker: Arc<dyn CandidateWorker>,
        session: &mut SessionState,
        ctx: &ExecutionContext,
    ) -> Result<RoundOutcome, PhaseError> {
        let phase = self.phase.name.as_str();
        let evaluator = self.spec.evaluator.as_ref().unwrap_or(self.fallback_evaluator);

        for step in 1..=self.spec.steps {
            if ctx.is_cancelled() {
                warn!(phase = %phase, step, "Cancellation observed, stopping refinement");
                break;
            }
            if self.satisfied(&best, ctx).await {
                info!(phase = %phase, step, "Refinement threshold met");
                break;
            }

            let mut prompt = refinement_prompt(self.intent, &best.output, &self.spec.honing_prompt);
            if self.spec.mutate {
                prompt = approach_hint(step as usize - 1, &prompt).0;
            }
            let mut seed = self.seed.to_vec();
            if !best.images.is_empty() {
                seed.push(
                    Message::user("Images produced by the current best output.")
                        .with_images(best.images.clone()),
                );
            }

            let label = format!("reforge_{}", step);
            let round = Round::new(
                self.phase,
                self.cascade_id,
                prompt,
                self.model,
                evaluator,
                self.original_input,
            )
            .with_factor(self.spec.factor_per_step.max(1) as usize)
            .with_seed(seed)
            .with_max_parallel(self.max_parallel)
            .with_label(&label);

            let mut outcome = self
                .explorer
                .explore(round, worker.clone(), session, ctx)
                .await?;
            if outcome.route.is_none() {
                outcome.route = best.route.take();
            }
            debug!(phase = %phase, step, winners = ?outcome.winners, "Refinement step settled");

            session.append(
                HistoryEntry::new(&ctx.trace.id, ctx.trace.parent_id.as_deref(), "reforge", EntryKind::Reforge)
                    .with_phase(phase)
                    .with_content(outcome.output.clone())
                    .with_metadata(json!({
                        "step": step,
                        "winners": outcome.winners,
                        "fingerprint": outcome.fingerprint,
                    })),
            );
            best = outcome;
        }

        Ok(best)
    }

    async fn satisfied(&self, best: &RoundOutcome, ctx: &ExecutionContext) -> bool {
        let Some(threshold) = &self.threshold else {
            return false;
        };
        match threshold
            .evaluate(&value_to_text(&best.output), self.original_input, ctx)
            .await
        {
            Ok(verdict) => verdict.valid,
            Err(e) => {
                warn!(phase = %self.phase.name, error = %e, "Refinement threshold check failed");
                false
            }
        }
    }
}

/// Original intent, current best, then the honing directive.
pub fn refinement_prompt(intent: &str, best: &Value, honing: &str) -> String {
    format!(
        "Original task:\n{}\n\nCurrent best output:\n{}\n\n{}",
        intent,
        value_to_text(best),
        honing
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, AgentRequest, AgentResponse, RetryConfig};
    use crate::audit::MemoryLogSink;
    use crate::config::ModelCatalog;
    use crate::errors::AgentError;
    use crate::soundings::{CandidatePlan, CandidateResult, EvaluatorSettings, MemoryWinnerStore};
    use crate::state::SessionFork;
    use crate::wards::{FunctionValidator, Verdict};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    struct FirstJudge;

    #[async_trait]
    impl Agent for FirstJudge {
        async fn run(&self, request: AgentRequest) -> Result<AgentResponse, AgentError> {
            Ok(AgentResponse::text(&request.model, "1"))
        }
    }

    /// Appends "+" to the current best it sees and emits an image.
    struct Polisher {
        seeds: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl CandidateWorker for Polisher {
        async fn run_candidate(
            &self,
            plan: CandidatePlan,
            session: SessionFork,
            _ctx: ExecutionContext,
        ) -> Result<CandidateResult, PhaseError> {
            self.seeds.lock().unwrap().push(plan.seed.len());
            let current = plan
                .prompt
                .split("Current best output:\n")
                .nth(1)
                .and_then(|rest| rest.split("\n\n").next())
                .unwrap_or_default()
                .to_string();
            let mut result =
                CandidateResult::new(plan.index, &plan.model, json!(format!("{}+", current)), session);
            result.images = vec!["img.png".into()];
            Ok(result)
        }
    }

    fn explorer() -> Explorer {
        Explorer::new(
            Arc::new(FirstJudge),
            Arc::new(MemoryLogSink::new()),
            Arc::new(MemoryWinnerStore::new()),
            ModelCatalog::default(),
            EvaluatorSettings {
                judge_model: "judge".into(),
                retry: RetryConfig::IMMEDIATE,
                cost_wait: Duration::ZERO,
                checkpoint_timeout: Duration::from_secs(1),
            },
        )
    }

    fn start() -> RoundOutcome {
        RoundOutcome {
            candidates: Vec::new(),
            winners: vec![0],
            output: json!("v"),
            route: Some("publish".into()),
            images: Vec::new(),
            messages: Vec::new(),
            fingerprint: String::new(),
        }
    }

    #[test]
    fn test_refinement_prompt_layout() {
        let prompt = refinement_prompt("Write", &json!("draft"), "Polish it.");
        assert_eq!(prompt, "Original task:\nWrite\n\nCurrent best output:\ndraft\n\nPolish it.");
    }

    #[tokio::test]
    async fn test_each_step_builds_on_previous_winner() {
        let explorer = explorer();
        let phase = Phase::new("draft", "Write");
        let spec = ReforgeSpec::new(3);
        let evaluator = EvaluatorSpec::Quality;
        let input = json!({});
        let refiner = Refiner {
            explorer: &explorer,
            spec: &spec,
            phase: &phase,
            cascade_id: "blog",
            intent: "Write",
            model: "m",
            fallback_evaluator: &evaluator,
            original_input: &input,
            seed: &[],
            max_parallel: 2,
            threshold: None,
        };
        let worker = Arc::new(Polisher {
            seeds: Mutex::new(Vec::new()),
        });
        let mut session = SessionState::new("s");
        let ctx = ExecutionContext::root("blog", "s");

        let refined = refiner
            .refine(start(), worker.clone(), &mut session, &ctx)
            .await
            .unwrap();
        assert_eq!(refined.output, json!("v+++"));
        assert_eq!(refined.route.as_deref(), Some("publish"));
        assert_eq!(
            session
                .history()
                .iter()
                .filter(|e| e.kind == EntryKind::Reforge)
                .count(),
            3
        );
        // First step has no images to carry; later steps get one extra seed message.
        let seeds = worker.seeds.lock().unwrap().clone();
        assert_eq!(seeds.iter().filter(|&&n| n == 0).count(), 2);
        assert_eq!(seeds.iter().filter(|&&n| n == 1).count(), 4);
    }

    #[tokio::test]
    async fn test_threshold_stops_early() {
        let explorer = explorer();
        let phase = Phase::new("draft", "Write");
        let spec = ReforgeSpec::new(5);
        let evaluator = EvaluatorSpec::Quality;
        let input = json!({});
        let threshold: Arc<dyn Validator> = Arc::new(FunctionValidator::new(|content, _| {
            if content.ends_with("++") {
                Verdict::pass()
            } else {
                Verdict::fail("keep going")
            }
        }));
        let refiner = Refiner {
            explorer: &explorer,
            spec: &spec,
            phase: &phase,
            cascade_id: "blog",
            intent: "Write",
            model: "m",
            fallback_evaluator: &evaluator,
            original_input: &input,
            seed: &[],
            max_parallel: 1,
            threshold: Some(threshold),
        };
        let mut session = SessionState::new("s");
        let ctx = ExecutionContext::root("blog", "s");

        let refined = refiner
            .refine(
                start(),
                Arc::new(Polisher {
                    seeds: Mutex::new(Vec::new()),
                }),
                &mut session,
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(refined.output, json!("v++"));
    }
}
