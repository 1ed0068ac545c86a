//! Validator sources.
//!
//! A validator answers one question about a piece of content: is it valid, and
//! if not, why. Three sources produce validators:
//!
//! - a callable registered with the [`ValidatorRegistry`]
//! - a sub-cascade whose final output is a `{valid, reason}` object
//! - inline code handed to an external [`CodeRunner`]
//!
//! All of them are normalized to [`Verdict`].

use crate::definition::{Cascade, ValidatorDef};
use crate::errors::PhaseError;
use crate::state::ExecutionContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;

/// The normalized validator answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub valid: bool,
    #[serde(default)]
    pub reason: String,
}

impl Verdict {
    pub fn pass() -> Self {
        Self {
            valid: true,
            reason: String::new(),
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: reason.into(),
        }
    }

    /// Read a verdict from a validator's final output.
    ///
    /// Accepts an object, a JSON string, or text with a JSON object embedded
    /// in it. Anything else is an invalid verdict.
    pub fn from_output(output: &Value) -> Self {
        match output {
            Value::Object(_) => serde_json::from_value(output.clone())
                .unwrap_or_else(|_| Self::fail("Validator output has no 'valid' field")),
            Value::String(text) => extract_json(text)
                .map(|v| Self::from_output(&v))
                .unwrap_or_else(|| Self::fail(format!("Validator output is not a verdict: {}", text))),
            Value::Bool(valid) => Self {
                valid: *valid,
                reason: String::new(),
            },
            other => Self::fail(format!("Validator output is not a verdict: {}", other)),
        }
    }
}

/// Find the first JSON object in free text.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&trimmed[start..=end])
        .ok()
        .filter(Value::is_object)
}

/// Checks content against some rule.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn evaluate(
        &self,
        content: &str,
        original_input: &Value,
        ctx: &ExecutionContext,
    ) -> Result<Verdict, PhaseError>;
}

/// Runs a named cascade to completion and returns its final output.
#[async_trait]
pub trait SubCascade: Send + Sync {
    async fn invoke(
        &self,
        cascade_id: &str,
        input: Value,
        ctx: &ExecutionContext,
    ) -> Result<Value, PhaseError>;

    /// Whether a cascade with this id can be invoked.
    fn has_cascade(&self, cascade_id: &str) -> bool;
}

/// Executes inline validator code.
#[async_trait]
pub trait CodeRunner: Send + Sync {
    /// Run `code` with `input` available to it and return its stdout.
    async fn execute(&self, language: &str, code: &str, input: &Value) -> anyhow::Result<String>;
}

type CheckFn = dyn Fn(&str, &Value) -> Verdict + Send + Sync;

/// A plain function validator.
pub struct FunctionValidator {
    check: Box<CheckFn>,
}

impl FunctionValidator {
    pub fn new<F>(check: F) -> Self
    where
        F: Fn(&str, &Value) -> Verdict + Send + Sync + 'static,
    {
        Self {
            check: Box::new(check),
        }
    }
}

#[async_trait]
impl Validator for FunctionValidator {
    async fn evaluate(
        &self,
        content: &str,
        original_input: &Value,
        _ctx: &ExecutionContext,
    ) -> Result<Verdict, PhaseError> {
        Ok((self.check)(content, original_input))
    }
}

/// Validates by running a sub-cascade on `{content, original_input}`.
pub struct CascadeValidator {
    cascade_id: String,
    runner: Arc<dyn SubCascade>,
}

impl CascadeValidator {
    pub fn new(cascade_id: &str, runner: Arc<dyn SubCascade>) -> Self {
        Self {
            cascade_id: cascade_id.to_string(),
            runner,
        }
    }
}

#[async_trait]
impl Validator for CascadeValidator {
    async fn evaluate(
        &self,
        content: &str,
        original_input: &Value,
        ctx: &ExecutionContext,
    ) -> Result<Verdict, PhaseError> {
        let input = json!({"content": content, "original_input": original_input});
        let output = self.runner.invoke(&self.cascade_id, input, ctx).await?;
        Ok(Verdict::from_output(&output))
    }
}

/// Validates by executing inline code; stdout must hold a verdict object.
pub struct PolyglotValidator {
    language: String,
    code: String,
    runner: Arc<dyn CodeRunner>,
}

impl PolyglotValidator {
    pub fn new(language: &str, code: &str, runner: Arc<dyn CodeRunner>) -> Self {
        Self {
            language: language.to_string(),
            code: code.to_string(),
            runner,
        }
    }
}

#[async_trait]
impl Validator for PolyglotValidator {
    async fn evaluate(
        &self,
        content: &str,
        original_input: &Value,
        _ctx: &ExecutionContext,
    ) -> Result<Verdict, PhaseError> {
        let input = json!({"content": content, "original_input": original_input});
        let stdout = self
            .runner
            .execute(&self.language, &self.code, &input)
            .await
            .map_err(|e| PhaseError::Validator {
                name: format!("{} code", self.language),
                message: e.to_string(),
            })?;
        Ok(Verdict::from_output(&Value::String(stdout)))
    }
}

/// Validators registered by the embedding application.
#[derive(Default, Clone)]
pub struct ValidatorRegistry {
    validators: HashMap<String, Arc<dyn Validator>>,
    code_runner: Option<Arc<dyn CodeRunner>>,
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, name: &str, validator: Arc<dyn Validator>) -> Self {
        self.validators.insert(name.to_string(), validator);
        self
    }

    /// Register a plain function.
    pub fn register_fn<F>(self, name: &str, check: F) -> Self
    where
        F: Fn(&str, &Value) -> Verdict + Send + Sync + 'static,
    {
        self.register(name, Arc::new(FunctionValidator::new(check)))
    }

    pub fn with_code_runner(mut self, runner: Arc<dyn CodeRunner>) -> Self {
        self.code_runner = Some(runner);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Validator>> {
        self.validators.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.validators.contains_key(name)
    }
}

/// Resolves validator references for one cascade.
///
/// Lookup order: the cascade's inline definitions, then registered callables,
/// then a sub-cascade of the same name.
#[derive(Clone)]
pub struct ValidatorResolver {
    cascade: Arc<Cascade>,
    registry: ValidatorRegistry,
    sub_cascades: Option<Arc<dyn SubCascade>>,
}

impl ValidatorResolver {
    pub fn new(cascade: Arc<Cascade>, registry: ValidatorRegistry) -> Self {
        Self {
            cascade,
            registry,
            sub_cascades: None,
        }
    }

    pub fn with_sub_cascades(mut self, runner: Arc<dyn SubCascade>) -> Self {
        self.sub_cascades = Some(runner);
        self
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Validator>, PhaseError> {
        if let Some(def) = self.cascade.validators.get(name) {
            return self.from_def(name, def);
        }
        if let Some(validator) = self.registry.get(name) {
            return Ok(validator);
        }
        match &self.sub_cascades {
            Some(runner) if runner.has_cascade(name) => {
                Ok(Arc::new(CascadeValidator::new(name, runner.clone())))
            }
            _ => Err(PhaseError::UnknownValidator(name.to_string())),
        }
    }

    fn from_def(&self, name: &str, def: &ValidatorDef) -> Result<Arc<dyn Validator>, PhaseError> {
        match def {
            ValidatorDef::Function { name: function } => self
                .registry
                .get(function)
                .ok_or_else(|| PhaseError::UnknownValidator(function.clone())),
            ValidatorDef::Cascade { cascade } => match &self.sub_cascades {
                Some(runner) => Ok(Arc::new(CascadeValidator::new(cascade, runner.clone()))),
                None => Err(PhaseError::Validator {
                    name: name.to_string(),
                    message: "sub-cascade validators need a cascade runner".to_string(),
                }),
            },
            ValidatorDef::Polyglot { language, code } => match &self.registry.code_runner {
                Some(runner) => Ok(Arc::new(PolyglotValidator::new(language, code, runner.clone()))),
                None => Err(PhaseError::Validator {
                    name: name.to_string(),
                    message: "no code runner registered".to_string(),
                }),
            },
        }
    }
}
