//! Per-phase context manager.

use super::CompressionConfig;
use super::tiers::{compress, take_chars};
use crate::agent::Message;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// A rejected output remembered for loop-retry mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationFailure {
    pub attempt: u32,
    pub output: String,
    pub reason: String,
}

impl ValidationFailure {
    pub fn new(attempt: u32, output: &str, reason: &str) -> Self {
        Self {
            attempt,
            output: output.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Holds one phase's full turn history and builds the bounded copy sent to the model.
///
/// The full history is never altered; compression only affects what
/// [`build`](Self::build) and [`build_retry`](Self::build_retry) return.
#[derive(Debug, Clone)]
pub struct ContextManager {
    config: CompressionConfig,
    system: Vec<Message>,
    task: Message,
    history: Vec<Message>,
    failures: VecDeque<ValidationFailure>,
}

impl ContextManager {
    pub fn new(config: CompressionConfig, system: Vec<Message>, task: Message) -> Self {
        Self {
            config,
            system,
            task,
            history: Vec::new(),
            failures: VecDeque::new(),
        }
    }

    /// Seed the turn history, e.g. with media carried over from an earlier step.
    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    pub fn push(&mut self, message: Message) {
        self.history.push(message);
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn system(&self) -> &[Message] {
        &self.system
    }

    pub fn task(&self) -> &Message {
        &self.task
    }

    /// Record a rejected output. Only the most recent `loop_history_limit` are kept.
    pub fn record_failure(&mut self, failure: ValidationFailure) {
        self.failures.push_back(failure);
        while self.failures.len() > self.config.loop_history_limit {
            self.failures.pop_front();
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &ValidationFailure> {
        self.failures.iter()
    }

    /// Context for a normal turn: system, task, tier-compressed history.
    pub fn build(&self) -> Vec<Message> {
        let mut out = self.system.clone();
        out.push(self.task.clone());
        out.extend(compress(&self.history, &self.config));
        out
    }

    /// Context for a validation retry: the accreted history is dropped and
    /// rebuilt from the task plus the recent failures.
    pub fn build_retry(&self, retry_instruction: &str) -> Vec<Message> {
        loop_retry_context(
            &self.system,
            &self.task,
            self.failures.iter(),
            retry_instruction,
            &self.config,
        )
    }

    /// Start a fresh attempt: clear turn history, keep failures.
    pub fn reset_history(&mut self) {
        self.history.clear();
    }
}

/// Minimal retry context: system prompts, the original task, the last
/// `loop_history_limit` failures and the retry instruction.
pub fn loop_retry_context<'a>(
    system: &[Message],
    task: &Message,
    failures: impl DoubleEndedIterator<Item = &'a ValidationFailure>,
    retry_instruction: &str,
    config: &CompressionConfig,
) -> Vec<Message> {
    let mut recent: Vec<&ValidationFailure> =
        failures.rev().take(config.loop_history_limit).collect();
    recent.reverse();

    let mut out = system.to_vec();
    out.push(task.clone());
    for failure in recent {
        out.push(Message::assistant(truncate_marked(
            &failure.output,
            config.loop_output_chars,
        )));
        out.push(Message::user(format!(
            "Attempt {} was rejected: {}",
            failure.attempt,
            truncate_marked(&failure.reason, config.loop_output_chars)
        )));
    }
    out.push(Message::user(retry_instruction));
    out
}

fn truncate_marked(text: &str, max: usize) -> String {
    let size = text.chars().count();
    if size <= max {
        text.to_string()
    } else {
        format!("{}... [truncated, {} chars]", take_chars(text, max), size)
    }
}
