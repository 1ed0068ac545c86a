//! Validation gate.
//!
//! Wards are validators attached to a phase's input (pre) or output (post).
//! Each carries a severity:
//!
//! | Mode       | Pre-phase          | Post-phase                              |
//! |------------|--------------------|-----------------------------------------|
//! | `blocking` | abort the cascade  | abort the cascade                       |
//! | `retry`    | same as blocking   | rerun the attempt loop if attempts remain |
//! | `advisory` | log only           | log only                                |
//!
//! Validators themselves live in [`validators`].

pub mod validators;

pub use validators::{
    CascadeValidator, CodeRunner, FunctionValidator, PolyglotValidator, SubCascade, Validator,
    ValidatorRegistry, ValidatorResolver, Verdict, extract_json,
};

use crate::definition::{Ward, WardMode};
use crate::errors::PhaseError;
use crate::state::ExecutionContext;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

/// Where a ward runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WardStage {
    Pre,
    Post,
}

/// One ward evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WardCheck {
    pub validator: String,
    pub stage: WardStage,
    pub mode: WardMode,
    pub valid: bool,
    pub reason: String,
}

/// What the gate decided.
#[derive(Debug, Clone, PartialEq)]
pub enum WardDecision {
    Pass,
    /// Abort the phase and the cascade
    Block { validator: String, reason: String },
    /// Rerun the attempt loop with this reason fed back
    Retry { validator: String, reason: String },
}

/// All checks performed plus the resulting decision.
#[derive(Debug, Clone)]
pub struct WardReport {
    pub checks: Vec<WardCheck>,
    pub decision: WardDecision,
}

impl WardReport {
    pub fn passed(&self) -> bool {
        self.decision == WardDecision::Pass
    }
}

/// Runs a phase's wards in order against one piece of content.
pub struct WardGate<'a> {
    resolver: &'a ValidatorResolver,
    phase: &'a str,
}

impl<'a> WardGate<'a> {
    pub fn new(resolver: &'a ValidatorResolver, phase: &'a str) -> Self {
        Self { resolver, phase }
    }

    /// Check the phase input before any turn runs. Retry wards count as blocking.
    pub async fn check_pre(
        &self,
        wards: &[Ward],
        input: &Value,
        ctx: &ExecutionContext,
    ) -> Result<WardReport, PhaseError> {
        let content = crate::template::value_to_text(input);
        self.check(WardStage::Pre, wards, &content, input, ctx).await
    }

    /// Check the settled output of the attempt loop.
    pub async fn check_post(
        &self,
        wards: &[Ward],
        output: &str,
        original_input: &Value,
        ctx: &ExecutionContext,
    ) -> Result<WardReport, PhaseError> {
        self.check(WardStage::Post, wards, output, original_input, ctx)
            .await
    }

    async fn check(
        &self,
        stage: WardStage,
        wards: &[Ward],
        content: &str,
        original_input: &Value,
        ctx: &ExecutionContext,
    ) -> Result<WardReport, PhaseError> {
        let mut checks = Vec::with_capacity(wards.len());

        for ward in wards {
            let validator = self.resolver.resolve(&ward.validator)?;
            let verdict = validator.evaluate(content, original_input, ctx).await?;
            checks.push(WardCheck {
                validator: ward.validator.clone(),
                stage,
                mode: ward.mode,
                valid: verdict.valid,
                reason: verdict.reason.clone(),
            });

            if verdict.valid {
                continue;
            }

            let decision = match (stage, ward.mode) {
                (_, WardMode::Advisory) => {
                    warn!(
                        phase = %self.phase,
                        validator = %ward.validator,
                        stage = ?stage,
                        reason = %verdict.reason,
                        "Advisory ward failed"
                    );
                    continue;
                }
                (WardStage::Pre, _) | (WardStage::Post, WardMode::Blocking) => WardDecision::Block {
                    validator: ward.validator.clone(),
                    reason: verdict.reason,
                },
                (WardStage::Post, WardMode::Retry) => WardDecision::Retry {
                    validator: ward.validator.clone(),
                    reason: verdict.reason,
                },
            };

            info!(phase = %self.phase, validator = %ward.validator, stage = ?stage, decision = ?decision, "Ward failed");
            return Ok(WardReport { checks, decision });
        }

        Ok(WardReport {
            checks,
            decision: WardDecision::Pass,
        })
    }
}
