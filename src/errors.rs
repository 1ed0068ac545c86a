//! Typed error hierarchy for the cascade engine.
//!
//! Four enums cover the subsystems:
//! - `AgentError`: failures reported by the external Agent (some are transient)
//! - `StateError`: violations of the session-state write discipline
//! - `PhaseError`: per-phase execution failures (fatal for the phase)
//! - `CascadeError`: definition and run-level failures

use thiserror::Error;

/// Errors returned by an [`Agent`](crate::agent::Agent) call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AgentError {
    #[error("Agent call timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Agent returned an empty response")]
    EmptyResponse,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Agent error: {0}")]
    Fatal(String),
}

impl AgentError {
    /// Whether the error is an infrastructure hiccup worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AgentError::Timeout { .. } | AgentError::EmptyResponse | AgentError::Connection(_)
        )
    }
}

/// Errors from the session-state store.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StateError {
    #[error("Output for phase '{phase}' was already committed")]
    OutputAlreadyCommitted { phase: String },
}

/// Errors from a single phase execution.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PhaseError {
    #[error("Phase {phase} blocked: {reason}")]
    Blocked { phase: String, reason: String },

    #[error("Phase {phase} exhausted {attempts} attempts: {last_reason}")]
    MaxAttemptsExhausted {
        phase: String,
        attempts: u32,
        last_reason: String,
    },

    #[error("Agent call for phase {phase} failed after {attempts} tries: {source}")]
    AgentExhausted {
        phase: String,
        attempts: u32,
        #[source]
        source: AgentError,
    },

    #[error("Cascade depth {depth} exceeds the maximum of {max}")]
    DepthExceeded { depth: u32, max: u32 },

    #[error("Token budget of {limit} exhausted ({used} used)")]
    TokenBudgetExceeded { limit: u64, used: u64 },

    #[error("All candidates rejected by reviewer for phase {phase}")]
    HumanRejected { phase: String },

    #[error("Checkpoint {checkpoint_id} timed out")]
    CheckpointTimeout { checkpoint_id: String },

    #[error("Validator '{name}' failed to run: {message}")]
    Validator { name: String, message: String },

    #[error("Unknown validator '{0}'")]
    UnknownValidator(String),

    #[error("Phase {phase} produced no candidates")]
    NoCandidates { phase: String },

    #[error("Template for phase {phase} is invalid: {message}")]
    Template { phase: String, message: String },

    #[error("Tool '{tool}' failed: {message}")]
    Tool { tool: String, message: String },

    #[error("Sub-cascade '{cascade}' did not complete: {message}")]
    SubCascade { cascade: String, message: String },

    #[error(transparent)]
    State(#[from] StateError),
}

impl PhaseError {
    /// Whether this error should abort the whole cascade immediately.
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            PhaseError::Blocked { .. } | PhaseError::HumanRejected { .. }
        )
    }
}

/// Errors from loading or running a cascade.
#[derive(Debug, Error)]
pub enum CascadeError {
    #[error("Duplicate phase name: {0}")]
    DuplicatePhase(String),

    #[error("Phase {phase} hands off to unknown phase {target}")]
    UnknownHandoff { phase: String, target: String },

    #[error("Phase {phase} was already completed; handoff from {from} would run it twice")]
    HandoffCycle { phase: String, from: String },

    #[error("Unknown sub-cascade '{0}'")]
    UnknownCascade(String),

    #[error("Cascade cancelled")]
    Cancelled,

    #[error(transparent)]
    Phase(#[from] PhaseError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_error_transient_classification() {
        assert!(AgentError::Timeout { secs: 30 }.is_transient());
        assert!(AgentError::EmptyResponse.is_transient());
        assert!(AgentError::Connection("reset".into()).is_transient());
        assert!(!AgentError::Fatal("bad request".into()).is_transient());
    }

    #[test]
    fn phase_error_blocked_is_blocking() {
        let err = PhaseError::Blocked {
            phase: "draft".into(),
            reason: "input empty".into(),
        };
        assert!(err.is_blocking());
        assert!(err.to_string().contains("input empty"));

        let exhausted = PhaseError::MaxAttemptsExhausted {
            phase: "draft".into(),
            attempts: 3,
            last_reason: "too short".into(),
        };
        assert!(!exhausted.is_blocking());
        assert!(exhausted.to_string().contains('3'));
    }

    #[test]
    fn phase_error_converts_from_state_error() {
        let inner = StateError::OutputAlreadyCommitted {
            phase: "draft".into(),
        };
        let err: PhaseError = inner.into();
        match &err {
            PhaseError::State(StateError::OutputAlreadyCommitted { phase }) => {
                assert_eq!(phase, "draft")
            }
            _ => panic!("Expected PhaseError::State"),
        }
    }

    #[test]
    fn cascade_error_wraps_phase_error() {
        let err: CascadeError = PhaseError::DepthExceeded { depth: 6, max: 5 }.into();
        assert!(matches!(
            err,
            CascadeError::Phase(PhaseError::DepthExceeded { depth: 6, max: 5 })
        ));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&AgentError::EmptyResponse);
        assert_std_error(&PhaseError::UnknownValidator("x".into()));
        assert_std_error(&CascadeError::Cancelled);
    }
}
