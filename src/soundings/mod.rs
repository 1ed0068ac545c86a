//! Candidate exploration ("soundings").
//!
//! When a phase asks for more than one candidate, the explorer fans the phase
//! body out over a bounded worker pool, each worker on a private fork of the
//! session, then picks a winner and merges only the winner's fork back.
//!
//! ## Pipeline
//!
//! 1. **Models** - one model per candidate (phase model, list, or per-model counts),
//!    then models whose context window is too small are dropped
//! 2. **Mutation** - candidate 0 is the baseline; the rest are rewritten,
//!    augmented or given an approach hint
//! 3. **Fan-out** - trace nodes are allocated first, then workers run concurrently
//! 4. **Filter** - an optional validator screens candidates before judging
//! 5. **Evaluate** - quality, cost-aware, Pareto, human or aggregate
//! 6. **Merge** - winners' forks are merged; everything else is dropped
//!
//! Winners are persisted by species fingerprint so rewrite mutations can learn
//! from earlier runs.

mod evaluator;
mod explorer;
pub mod models;
pub mod mutation;
pub mod pareto;
mod winners;

pub use evaluator::{Evaluation, Evaluator, EvaluatorSettings};
pub use explorer::{CandidatePlan, CandidateWorker, Explorer, Round, RoundOutcome};
pub use mutation::Mutation;
pub use winners::{
    JsonWinnerStore, MemoryWinnerStore, WinnerRecord, WinnerStore, species_fingerprint,
};

use crate::agent::Message;
use crate::state::SessionFork;
use crate::template::value_to_text;
use crate::wards::Verdict;
use serde_json::{Value, json};

/// What one candidate produced.
#[derive(Debug, Clone)]
pub struct CandidateResult {
    pub index: usize,
    pub output: Value,
    /// Messages generated during the attempt
    pub messages: Vec<Message>,
    pub images: Vec<String>,
    pub model: String,
    /// Prompt the candidate actually ran
    pub prompt: String,
    pub mutation: Option<Mutation>,
    /// Route chosen through the routing tool, if any
    pub route: Option<String>,
    /// Provider-reported cost, summed over the attempt's calls
    pub cost: Option<f64>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub request_ids: Vec<String>,
    pub quality: Option<f64>,
    pub on_frontier: bool,
    pub verdict: Option<Verdict>,
    /// The worker's private session; `None` once merged or dropped
    pub session: Option<SessionFork>,
}

impl CandidateResult {
    pub fn new(index: usize, model: &str, output: Value, session: SessionFork) -> Self {
        Self {
            index,
            output,
            messages: Vec::new(),
            images: Vec::new(),
            model: model.to_string(),
            prompt: String::new(),
            mutation: None,
            route: None,
            cost: None,
            tokens_in: 0,
            tokens_out: 0,
            request_ids: Vec::new(),
            quality: None,
            on_frontier: false,
            verdict: None,
            session: Some(session),
        }
    }

    /// Output as prompt text.
    pub fn text(&self) -> String {
        value_to_text(&self.output)
    }

    /// Summary for log metadata.
    pub fn metadata(&self, is_winner: bool) -> Value {
        json!({
            "candidate": self.index,
            "model": self.model,
            "mutation": self.mutation,
            "is_winner": is_winner,
            "cost": self.cost,
            "quality": self.quality,
            "on_frontier": self.on_frontier,
            "valid": self.verdict.as_ref().map(|v| v.valid),
            "tokens_in": self.tokens_in,
            "tokens_out": self.tokens_out,
        })
    }
}
