//! Cascade and phase definitions.
//!
//! This module provides:
//! - `Cascade`, the immutable workflow definition
//! - `Phase` and its nested specs (rules, candidates, wards, context, handoffs)
//! - JSON/YAML loading for already-authored definitions
//!
//! Phases are read-only during execution; the runner only ever borrows them.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// An immutable workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cascade {
    /// Identifier of the cascade (used for sub-cascade lookup and logging)
    pub cascade_id: String,
    #[serde(default)]
    pub description: String,
    /// Ordered phase definitions
    pub phases: Vec<Phase>,
    /// Inline validator definitions, referenced by name from wards and loop_until
    #[serde(default)]
    pub validators: HashMap<String, ValidatorDef>,
    /// Model used when a phase does not name one
    #[serde(default)]
    pub model: Option<String>,
}

impl Cascade {
    /// Create a cascade from phases.
    pub fn new(cascade_id: &str, phases: Vec<Phase>) -> Self {
        Self {
            cascade_id: cascade_id.to_string(),
            description: String::new(),
            phases,
            validators: HashMap::new(),
            model: None,
        }
    }

    /// Register an inline validator definition.
    pub fn with_validator(mut self, name: &str, def: ValidatorDef) -> Self {
        self.validators.insert(name.to_string(), def);
        self
    }

    /// Set the cascade-wide default model.
    pub fn with_model(mut self, model: &str) -> Self {
        self.model = Some(model.to_string());
        self
    }

    /// Look up a phase by name.
    pub fn phase(&self, name: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.name == name)
    }

    /// Position of a phase in definition order.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.name == name)
    }

    /// Load a cascade from a `.json`, `.yaml` or `.yml` file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read cascade file: {}", path.display()))?;

        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"));

        if is_yaml {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse cascade YAML: {}", path.display()))
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse cascade JSON: {}", path.display()))
        }
    }
}

/// A single named step of a cascade.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Phase {
    /// Unique name within the cascade
    pub name: String,
    /// Instruction template rendered against the run input and prior outputs
    pub instructions: String,
    /// Model identifier (falls back to the cascade model, then the engine default)
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub rules: Rules,
    /// Candidate exploration settings
    #[serde(default)]
    pub candidates: Option<CandidatesSpec>,
    #[serde(default)]
    pub wards: WardsSpec,
    /// Static next-phase targets; with two or more the agent may choose via `route_to`
    #[serde(default)]
    pub handoffs: Vec<String>,
    #[serde(default)]
    pub context: Option<ContextSpec>,
    /// Tool names offered to the agent
    #[serde(default)]
    pub tools: Vec<String>,
    /// Human checkpoint after the output settles
    #[serde(default)]
    pub human_input: Option<HumanInputSpec>,
}

impl Phase {
    /// Create a phase with default rules.
    pub fn new(name: &str, instructions: &str) -> Self {
        Self {
            name: name.to_string(),
            instructions: instructions.to_string(),
            model: None,
            rules: Rules::default(),
            candidates: None,
            wards: WardsSpec::default(),
            handoffs: Vec::new(),
            context: None,
            tools: Vec::new(),
            human_input: None,
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = Some(model.to_string());
        self
    }

    pub fn with_rules(mut self, rules: Rules) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_candidates(mut self, candidates: CandidatesSpec) -> Self {
        self.candidates = Some(candidates);
        self
    }

    pub fn with_wards(mut self, wards: WardsSpec) -> Self {
        self.wards = wards;
        self
    }

    pub fn with_handoffs(mut self, targets: &[&str]) -> Self {
        self.handoffs = targets.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_context_from(mut self, sources: &[&str]) -> Self {
        self.context = Some(ContextSpec {
            from: sources.iter().map(|s| s.to_string()).collect(),
            auto: false,
        });
        self
    }

    pub fn with_tools(mut self, tools: &[&str]) -> Self {
        self.tools = tools.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_human_input(mut self, spec: HumanInputSpec) -> Self {
        self.human_input = Some(spec);
        self
    }

    /// Whether the agent chooses among handoffs through the routing tool.
    pub fn has_dynamic_routing(&self) -> bool {
        self.handoffs.len() >= 2
    }

    /// State key under which this phase's output is committed.
    pub fn output_key(&self) -> String {
        output_key(&self.name)
    }
}

/// State key under which a phase's output is committed.
pub fn output_key(phase: &str) -> String {
    format!("output_{}", phase)
}

/// Turn and attempt limits plus the optional loop-until validator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rules {
    #[serde(default = "default_one")]
    pub max_turns: u32,
    #[serde(default = "default_one")]
    pub max_attempts: u32,
    /// Validator reference that must pass before the phase settles
    #[serde(default)]
    pub loop_until: Option<String>,
    /// Do not announce the validator to the model
    #[serde(default)]
    pub loop_until_silent: bool,
    /// Override for the validator announcement
    #[serde(default)]
    pub loop_until_prompt: Option<String>,
    /// Check the validator after every non-final turn
    #[serde(default)]
    pub per_turn_validation: bool,
    /// Message sent on turns after the first
    #[serde(default)]
    pub turn_prompt: Option<String>,
    /// Retry template; `{{ validation_error }}` and `{{ attempt }}` are available
    #[serde(default)]
    pub retry_instructions: Option<String>,
}

fn default_one() -> u32 {
    1
}

impl Default for Rules {
    fn default() -> Self {
        Self {
            max_turns: 1,
            max_attempts: 1,
            loop_until: None,
            loop_until_silent: false,
            loop_until_prompt: None,
            per_turn_validation: false,
            turn_prompt: None,
            retry_instructions: None,
        }
    }
}

impl Rules {
    pub fn with_max_turns(mut self, turns: u32) -> Self {
        self.max_turns = turns;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_loop_until(mut self, validator: &str) -> Self {
        self.loop_until = Some(validator.to_string());
        self
    }
}

/// Number of candidates: a literal count or a template rendering to one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FactorSpec {
    Count(u32),
    Template(String),
}

impl Default for FactorSpec {
    fn default() -> Self {
        FactorSpec::Count(1)
    }
}

/// How non-baseline candidates alter the prompt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationMode {
    #[default]
    None,
    Rewrite,
    RewriteFree,
    Augment,
    Approach,
}

/// Model choice per candidate when a list of models is configured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStrategy {
    #[default]
    RoundRobin,
    Random,
}

/// Multi-model configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ModelsSpec {
    /// Candidates are spread over these models
    List(Vec<String>),
    /// Exact candidate count per model (overrides the factor)
    PerModel(BTreeMap<String, u32>),
}

/// Winner selection among Pareto-frontier members.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParetoPolicy {
    Cheapest,
    HighestQuality,
    #[default]
    BestRatio,
    External,
}

/// Fallback when a human selection times out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutFallback {
    #[default]
    Abort,
    Random,
    First,
    LlmFallback,
}

/// How aggregate mode combines candidate outputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateMerge {
    #[default]
    Concatenate,
    LlmMerge,
}

/// Evaluation policy, one per phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum EvaluatorSpec {
    #[default]
    Quality,
    CostAware {
        #[serde(default = "default_quality_weight")]
        quality_weight: f64,
        #[serde(default = "default_cost_weight")]
        cost_weight: f64,
    },
    Pareto {
        #[serde(default)]
        policy: ParetoPolicy,
    },
    Human {
        /// LLM-prefilter to this many candidates before presenting
        #[serde(default)]
        prefilter_top_k: Option<usize>,
        #[serde(default)]
        timeout_secs: Option<u64>,
        #[serde(default)]
        on_timeout: TimeoutFallback,
    },
    Aggregate {
        #[serde(default)]
        merge: AggregateMerge,
    },
}

fn default_quality_weight() -> f64 {
    0.7
}

fn default_cost_weight() -> f64 {
    0.3
}

impl EvaluatorSpec {
    /// Short name used in logs and winner records.
    pub fn kind(&self) -> &'static str {
        match self {
            EvaluatorSpec::Quality => "quality",
            EvaluatorSpec::CostAware { .. } => "cost_aware",
            EvaluatorSpec::Pareto { .. } => "pareto",
            EvaluatorSpec::Human { .. } => "human",
            EvaluatorSpec::Aggregate { .. } => "aggregate",
        }
    }
}

/// Candidate exploration ("soundings") settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CandidatesSpec {
    #[serde(default)]
    pub factor: FactorSpec,
    #[serde(default)]
    pub max_parallel: Option<usize>,
    #[serde(default)]
    pub mutation_mode: MutationMode,
    #[serde(default)]
    pub evaluator: EvaluatorSpec,
    /// Extra guidance appended to the judge prompt
    #[serde(default)]
    pub evaluator_instructions: Option<String>,
    #[serde(default)]
    pub reforge: Option<ReforgeSpec>,
    #[serde(default)]
    pub models: Option<ModelsSpec>,
    #[serde(default)]
    pub model_strategy: ModelStrategy,
    /// Validator applied to each candidate before evaluation
    #[serde(default)]
    pub validator: Option<String>,
}

impl CandidatesSpec {
    pub fn with_factor(factor: u32) -> Self {
        Self {
            factor: FactorSpec::Count(factor),
            ..Default::default()
        }
    }

    pub fn with_evaluator(mut self, evaluator: EvaluatorSpec) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_mutation(mut self, mode: MutationMode) -> Self {
        self.mutation_mode = mode;
        self
    }

    pub fn with_models(mut self, models: ModelsSpec) -> Self {
        self.models = Some(models);
        self
    }

    pub fn with_reforge(mut self, reforge: ReforgeSpec) -> Self {
        self.reforge = Some(reforge);
        self
    }

    pub fn with_validator(mut self, validator: &str) -> Self {
        self.validator = Some(validator.to_string());
        self
    }
}

/// Iterative refinement of a soundings winner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReforgeSpec {
    pub steps: u32,
    /// Directive sent with the current best output
    #[serde(default = "default_honing_prompt")]
    pub honing_prompt: String,
    #[serde(default = "default_reforge_factor")]
    pub factor_per_step: u32,
    /// Evaluator for refinement rounds (defaults to the phase evaluator)
    #[serde(default)]
    pub evaluator: Option<EvaluatorSpec>,
    /// Add an approach hint to each refinement candidate
    #[serde(default)]
    pub mutate: bool,
    /// Validator that ends refinement early once satisfied
    #[serde(default)]
    pub threshold: Option<String>,
}

fn default_honing_prompt() -> String {
    "Refine the current best output. Keep what works, fix weaknesses, and improve clarity and \
     correctness without changing the task."
        .to_string()
}

fn default_reforge_factor() -> u32 {
    2
}

impl ReforgeSpec {
    pub fn new(steps: u32) -> Self {
        Self {
            steps,
            honing_prompt: default_honing_prompt(),
            factor_per_step: default_reforge_factor(),
            evaluator: None,
            mutate: false,
            threshold: None,
        }
    }
}

/// Severity of a ward failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WardMode {
    #[default]
    Blocking,
    Retry,
    Advisory,
}

/// A validator attached to a phase's input or output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ward {
    pub validator: String,
    #[serde(default)]
    pub mode: WardMode,
}

impl Ward {
    pub fn new(validator: &str, mode: WardMode) -> Self {
        Self {
            validator: validator.to_string(),
            mode,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WardsSpec {
    #[serde(default)]
    pub pre: Vec<Ward>,
    #[serde(default)]
    pub post: Vec<Ward>,
}

impl WardsSpec {
    pub fn is_empty(&self) -> bool {
        self.pre.is_empty() && self.post.is_empty()
    }
}

/// Which prior outputs a phase sees.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContextSpec {
    /// Phase names or the keywords `all`, `previous`, `first`
    #[serde(default)]
    pub from: Vec<String>,
    /// Include every earlier completed output
    #[serde(default)]
    pub auto: bool,
}

/// Human checkpoint attached to a phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HumanInputSpec {
    pub title: String,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Inline validator definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ValidatorDef {
    /// A callable registered with the runner under `name`
    Function { name: String },
    /// A sub-cascade from the runner's library
    Cascade { cascade: String },
    /// Code executed by the external code runner
    Polyglot { language: String, code: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_phase_defaults() {
        let phase = Phase::new("draft", "Write a draft about {{ input.topic }}");
        assert_eq!(phase.rules.max_turns, 1);
        assert_eq!(phase.rules.max_attempts, 1);
        assert!(phase.candidates.is_none());
        assert!(!phase.has_dynamic_routing());
        assert_eq!(phase.output_key(), "output_draft");
    }

    #[test]
    fn test_dynamic_routing_needs_two_handoffs() {
        assert!(!Phase::new("a", "x").with_handoffs(&["b"]).has_dynamic_routing());
        assert!(Phase::new("a", "x").with_handoffs(&["b", "c"]).has_dynamic_routing());
    }

    #[test]
    fn test_cascade_json_roundtrip_fields() {
        let json = r#"{
            "cascade_id": "blog",
            "phases": [
                {
                    "name": "draft",
                    "instructions": "Write",
                    "rules": {"max_attempts": 3, "loop_until": "long_enough"},
                    "candidates": {
                        "factor": 3,
                        "mutation_mode": "augment",
                        "evaluator": {"mode": "pareto", "policy": "cheapest"},
                        "models": {"model-a": 2, "model-b": 1}
                    },
                    "wards": {"pre": [{"validator": "non_empty"}]}
                },
                {
                    "name": "polish",
                    "instructions": "Polish {{ outputs.draft }}",
                    "candidates": {"factor": "{{ input.n }}"}
                }
            ],
            "validators": {
                "long_enough": {"type": "polyglot", "language": "python", "code": "print(1)"}
            }
        }"#;

        let cascade: Cascade = serde_json::from_str(json).unwrap();
        let draft = cascade.phase("draft").unwrap();
        assert_eq!(draft.rules.max_attempts, 3);
        assert_eq!(draft.rules.max_turns, 1);
        assert_eq!(draft.wards.pre[0].mode, WardMode::Blocking);

        let candidates = draft.candidates.as_ref().unwrap();
        assert_eq!(candidates.factor, FactorSpec::Count(3));
        assert_eq!(candidates.mutation_mode, MutationMode::Augment);
        assert_eq!(
            candidates.evaluator,
            EvaluatorSpec::Pareto {
                policy: ParetoPolicy::Cheapest
            }
        );
        assert!(matches!(candidates.models, Some(ModelsSpec::PerModel(_))));

        let polish = cascade.phase("polish").unwrap();
        assert_eq!(
            polish.candidates.as_ref().unwrap().factor,
            FactorSpec::Template("{{ input.n }}".to_string())
        );
        assert!(matches!(
            cascade.validators.get("long_enough"),
            Some(ValidatorDef::Polyglot { .. })
        ));
        assert_eq!(cascade.position("polish"), Some(1));
    }

    #[test]
    fn test_load_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "cascade_id: demo\nphases:\n  - name: one\n    instructions: hi\n    handoffs: [two]\n  - name: two\n    instructions: bye\n"
        )
        .unwrap();

        let cascade = Cascade::load(file.path()).unwrap();
        assert_eq!(cascade.cascade_id, "demo");
        assert_eq!(cascade.phases.len(), 2);
        assert_eq!(cascade.phases[0].handoffs, vec!["two"]);
    }

    #[test]
    fn test_load_missing_file_has_context() {
        let err = Cascade::load(Path::new("/nonexistent/cascade.json")).unwrap_err();
        assert!(err.to_string().contains("Failed to read cascade file"));
    }
}
