//! Engine configuration.
//!
//! Settings are read from `cascade.toml`, then environment overrides are
//! applied, then builder methods (file → environment → code).
//!
//! # Configuration File Format
//!
//! ```toml
//! [engine]
//! max_parallel_phases = 4
//! max_depth = 5
//! default_model = "gpt-4o-mini"
//! judge_model = "gpt-4o"
//! token_budget = 2000000
//! heartbeat_interval_ms = 5000
//!
//! [retry]
//! max_retries = 3
//! initial_delay_ms = 500
//!
//! [context]
//! window_turns = 2
//! loop_history_limit = 3
//!
//! [soundings]
//! max_parallel = 4
//! context_safety_multiplier = 1.2
//! cost_wait_ms = 1500
//!
//! [checkpoint]
//! default_timeout_secs = 600
//!
//! [models."gpt-4o"]
//! context_limit = 128000
//! input_price = 2.5
//! output_price = 10.0
//! ```

use crate::agent::RetryConfig;
use crate::compaction::CompressionConfig;
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// File name looked up by [`EngineConfig::load_or_default`].
pub const CONFIG_FILE: &str = "cascade.toml";

/// Core scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// Bound on concurrently running phases in a parallel wave
    #[serde(default = "default_max_parallel")]
    pub max_parallel_phases: usize,
    /// Maximum sub-cascade nesting depth
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    #[serde(default = "default_model")]
    pub default_model: String,
    /// Model for judge, rewrite and merge calls (defaults to the phase model)
    #[serde(default)]
    pub judge_model: Option<String>,
    /// Best-effort token ceiling shared by a whole run
    #[serde(default)]
    pub token_budget: Option<u64>,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_interval_ms: u64,
}

fn default_max_parallel() -> usize {
    4
}

fn default_max_depth() -> u32 {
    5
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_heartbeat_ms() -> u64 {
    5000
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_parallel_phases: default_max_parallel(),
            max_depth: default_max_depth(),
            default_model: default_model(),
            judge_model: None,
            token_budget: None,
            heartbeat_interval_ms: default_heartbeat_ms(),
        }
    }
}

/// Backoff for transient agent failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetrySection {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
        }
    }
}

/// Candidate exploration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoundingsSection {
    /// Worker pool bound when a phase does not set its own
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Required context is multiplied by this before comparing against model limits
    #[serde(default = "default_safety_multiplier")]
    pub context_safety_multiplier: f64,
    /// How long cost-aware evaluation waits for late cost data
    #[serde(default = "default_cost_wait_ms")]
    pub cost_wait_ms: u64,
}

fn default_safety_multiplier() -> f64 {
    1.2
}

fn default_cost_wait_ms() -> u64 {
    1500
}

impl Default for SoundingsSection {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            context_safety_multiplier: default_safety_multiplier(),
            cost_wait_ms: default_cost_wait_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSection {
    #[serde(default = "default_checkpoint_timeout")]
    pub default_timeout_secs: u64,
}

fn default_checkpoint_timeout() -> u64 {
    600
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_checkpoint_timeout(),
        }
    }
}

/// Limits and pricing of one model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Context window in tokens
    #[serde(default)]
    pub context_limit: Option<u64>,
    /// USD per million input tokens
    #[serde(default)]
    pub input_price: f64,
    /// USD per million output tokens
    #[serde(default)]
    pub output_price: f64,
}

/// Known models. Unknown models have no limit and cost nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelCatalog {
    models: BTreeMap<String, ModelInfo>,
}

impl ModelCatalog {
    pub fn new(models: BTreeMap<String, ModelInfo>) -> Self {
        Self { models }
    }

    pub fn with_model(mut self, name: &str, info: ModelInfo) -> Self {
        self.models.insert(name.to_string(), info);
        self
    }

    pub fn get(&self, model: &str) -> Option<&ModelInfo> {
        self.models.get(model)
    }

    pub fn context_limit(&self, model: &str) -> Option<u64> {
        self.get(model).and_then(|m| m.context_limit)
    }

    pub fn estimate_cost(&self, model: &str, tokens_in: u64, tokens_out: u64) -> f64 {
        match self.get(model) {
            Some(info) => {
                (tokens_in as f64 * info.input_price + tokens_out as f64 * info.output_price)
                    / 1_000_000.0
            }
            None => 0.0,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub context: CompressionConfig,
    #[serde(default)]
    pub soundings: SoundingsSection,
    #[serde(default)]
    pub checkpoint: CheckpointSection,
    #[serde(default)]
    pub models: BTreeMap<String, ModelInfo>,
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse cascade.toml")
    }

    /// Load `cascade.toml` from a directory, or defaults if it does not exist.
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize cascade.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `CASCADE_*` overrides from the process environment.
    pub fn with_env(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `CASCADE_*` overrides from an arbitrary lookup.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CASCADE_MAX_PARALLEL") {
            self.engine.max_parallel_phases = v
                .parse()
                .with_context(|| format!("Invalid CASCADE_MAX_PARALLEL '{}'", v))?;
        }
        if let Some(v) = lookup("CASCADE_MAX_DEPTH") {
            self.engine.max_depth = v
                .parse()
                .with_context(|| format!("Invalid CASCADE_MAX_DEPTH '{}'", v))?;
        }
        if let Some(v) = lookup("CASCADE_DEFAULT_MODEL") {
            self.engine.default_model = v;
        }
        if let Some(v) = lookup("CASCADE_JUDGE_MODEL") {
            self.engine.judge_model = Some(v);
        }
        if let Some(v) = lookup("CASCADE_TOKEN_BUDGET") {
            self.engine.token_budget = Some(
                v.parse()
                    .with_context(|| format!("Invalid CASCADE_TOKEN_BUDGET '{}'", v))?,
            );
        }
        Ok(self)
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.engine.max_parallel_phases = max_parallel;
        self
    }

    pub fn with_default_model(mut self, model: &str) -> Self {
        self.engine.default_model = model.to_string();
        self
    }

    pub fn with_model(mut self, name: &str, info: ModelInfo) -> Self {
        self.models.insert(name.to_string(), info);
        self
    }

    pub fn retry_config(&self) -> RetryConfig {
        self.retry.to_retry_config()
    }

    pub fn catalog(&self) -> ModelCatalog {
        ModelCatalog::new(self.models.clone())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.engine.heartbeat_interval_ms)
    }

    pub fn cost_wait(&self) -> Duration {
        Duration::from_millis(self.soundings.cost_wait_ms)
    }

    pub fn checkpoint_timeout(&self) -> Duration {
        Duration::from_secs(self.checkpoint.default_timeout_secs)
    }

    /// Check the configuration. Hard errors are returned as `Err`; suspicious
    /// values come back as warnings.
    pub fn validate(&self) -> Result<Vec<String>> {
        if self.engine.max_parallel_phases == 0 {
            bail!("engine.max_parallel_phases must be at least 1");
        }
        if self.soundings.max_parallel == 0 {
            bail!("soundings.max_parallel must be at least 1");
        }
        if self.soundings.context_safety_multiplier < 1.0 {
            bail!(
                "soundings.context_safety_multiplier must be >= 1.0 (got {})",
                self.soundings.context_safety_multiplier
            );
        }
        if !(self.retry.backoff_multiplier > 0.0 && self.retry.backoff_multiplier.is_finite()) {
            bail!(
                "retry.backoff_multiplier must be a positive number (got {})",
                self.retry.backoff_multiplier
            );
        }
        self.context.validate()?;

        let mut warnings = Vec::new();
        if self.engine.max_depth == 0 {
            warnings.push("engine.max_depth is 0: sub-cascades and cascade validators cannot run".to_string());
        }
        if self.engine.max_depth > 20 {
            warnings.push(format!(
                "engine.max_depth {} is very high; runaway recursion will be slow to stop",
                self.engine.max_depth
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            warnings.push(format!(
                "retry.backoff_multiplier {} shrinks delays between retries",
                self.retry.backoff_multiplier
            ));
        }
        if self.engine.token_budget == Some(0) {
            warnings.push("engine.token_budget is 0: every agent call will be refused".to_string());
        }
        for (name, info) in &self.models {
            if info.input_price < 0.0 || info.output_price < 0.0 {
                warnings.push(format!("models.\"{}\" has a negative price", name));
            }
            if info.context_limit == Some(0) {
                warnings.push(format!("models.\"{}\" has a zero context limit", name));
            }
        }
        Ok(warnings)
    }
}
