//! Explicit execution context passed through every engine call.

use super::trace::TraceNode;
use crate::agent::TokenBudget;
use crate::errors::PhaseError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cooperative cancellation flag shared by a run and its sub-runs.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Where a call sits: session, trace position, recursion depth, and shared guards.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub session_id: String,
    pub parent_session_id: Option<String>,
    pub cascade_id: String,
    pub trace: TraceNode,
    pub depth: u32,
    pub phase: Option<String>,
    pub candidate: Option<usize>,
    pub cancel: CancelFlag,
    pub token_budget: Option<Arc<TokenBudget>>,
}

impl ExecutionContext {
    /// Context for a top-level run.
    pub fn root(cascade_id: &str, session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            parent_session_id: None,
            cascade_id: cascade_id.to_string(),
            trace: TraceNode::root(cascade_id),
            depth: 0,
            phase: None,
            candidate: None,
            cancel: CancelFlag::new(),
            token_budget: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_token_budget(mut self, budget: Option<Arc<TokenBudget>>) -> Self {
        self.token_budget = budget;
        self
    }

    pub fn with_trace(mut self, trace: TraceNode) -> Self {
        self.trace = trace;
        self
    }

    /// Context for one phase of this run, under a fresh trace child.
    pub fn for_phase(&self, phase: &str) -> Self {
        let mut ctx = self.clone();
        ctx.trace = self.trace.child(phase);
        ctx.phase = Some(phase.to_string());
        ctx.candidate = None;
        ctx
    }

    /// Context for one candidate, using a pre-allocated trace node.
    pub fn for_candidate(&self, index: usize, trace: TraceNode) -> Self {
        let mut ctx = self.clone();
        ctx.trace = trace;
        ctx.candidate = Some(index);
        ctx
    }

    /// Context for a nested cascade run one level deeper.
    ///
    /// The child always records this session as its parent, even when the
    /// session id is reused.
    pub fn for_sub_cascade(
        &self,
        cascade_id: &str,
        session_id: &str,
        max_depth: u32,
    ) -> Result<Self, PhaseError> {
        let depth = self.depth + 1;
        if depth > max_depth {
            return Err(PhaseError::DepthExceeded {
                depth,
                max: max_depth,
            });
        }
        Ok(Self {
            session_id: session_id.to_string(),
            parent_session_id: Some(self.session_id.clone()),
            cascade_id: cascade_id.to_string(),
            trace: self.trace.child(cascade_id),
            depth,
            phase: None,
            candidate: None,
            cancel: self.cancel.clone(),
            token_budget: self.token_budget.clone(),
        })
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Check the shared token budget, if any.
    pub fn check_budget(&self) -> Result<(), PhaseError> {
        match &self.token_budget {
            Some(budget) => budget.check(),
            None => Ok(()),
        }
    }

    pub fn record_tokens(&self, tokens: u64) {
        if let Some(budget) = &self.token_budget {
            budget.record(tokens);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let ctx = ExecutionContext::root("c", "s").with_cancel(flag.clone());
        let phase_ctx = ctx.for_phase("draft");
        assert!(!phase_ctx.is_cancelled());
        flag.cancel();
        assert!(phase_ctx.is_cancelled());
    }

    #[test]
    fn test_sub_cascade_depth_is_bounded() {
        let ctx = ExecutionContext::root("c", "s");
        let child = ctx.for_sub_cascade("v", "s2", 1).unwrap();
        assert_eq!(child.depth, 1);
        assert_eq!(child.parent_session_id.as_deref(), Some("s"));
        assert_eq!(child.trace.parent_id.as_deref(), Some(ctx.trace.id.as_str()));

        let err = child.for_sub_cascade("v", "s3", 1).unwrap_err();
        assert_eq!(err, PhaseError::DepthExceeded { depth: 2, max: 1 });
    }

    #[test]
    fn test_reused_session_id_updates_parent() {
        let first = ExecutionContext::root("c", "a");
        let second = ExecutionContext::root("c", "b");
        let child_a = first.for_sub_cascade("v", "shared", 5).unwrap();
        let child_b = second.for_sub_cascade("v", "shared", 5).unwrap();
        assert_eq!(child_a.parent_session_id.as_deref(), Some("a"));
        assert_eq!(child_b.parent_session_id.as_deref(), Some("b"));
    }

    #[test]
    fn test_budget_check_without_budget() {
        let ctx = ExecutionContext::root("c", "s");
        ctx.record_tokens(1_000_000);
        assert!(ctx.check_budget().is_ok());

        let ctx = ctx.with_token_budget(Some(Arc::new(TokenBudget::new(10))));
        ctx.record_tokens(10);
        assert!(ctx.check_budget().is_err());
    }
}
