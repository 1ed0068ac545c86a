//! Interface to the external language-model client.
//!
//! The engine never talks to a model provider directly. It hands an
//! [`AgentRequest`] to an [`Agent`] implementation and gets back text, tool
//! calls, media, cost and token usage. Everything here is the boundary:
//!
//! - [`Agent`]: one model call
//! - [`Toolbox`]: executes tool calls the model asks for
//! - [`TokenBudget`]: best-effort shared token counter
//! - [`retry`]: transient-failure retry with exponential backoff

mod message;
pub mod retry;

pub use message::{Message, Role, ToolCall, total_size};
pub use retry::{RetryConfig, RetryOutcome, call_with_retry};

use crate::errors::{AgentError, PhaseError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Name of the built-in routing tool offered to phases with several handoffs.
pub const ROUTE_TOOL: &str = "route_to";

/// Description of a tool offered to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl ToolSpec {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters: serde_json::Value::Null,
        }
    }

    /// The routing tool listing the allowed targets.
    pub fn route_to(targets: &[String]) -> Self {
        Self {
            name: ROUTE_TOOL.to_string(),
            description: format!(
                "Choose the next phase. Valid targets: {}",
                targets.join(", ")
            ),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {"target": {"type": "string", "enum": targets}},
                "required": ["target"]
            }),
        }
    }
}

/// One model call.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentRequest {
    pub model: String,
    /// New user input for this call; `None` when the context already encodes the task
    pub input: Option<String>,
    pub context: Vec<Message>,
    pub tools: Vec<ToolSpec>,
}

impl AgentRequest {
    pub fn new(model: &str, input: Option<String>) -> Self {
        Self {
            model: model.to_string(),
            input,
            context: Vec::new(),
            tools: Vec::new(),
        }
    }

    pub fn with_context(mut self, context: Vec<Message>) -> Self {
        self.context = context;
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    /// Rough size of the request in characters (input + context + tool specs).
    pub fn size(&self) -> usize {
        let input = self.input.as_deref().map_or(0, |i| i.chars().count());
        let tools: usize = self
            .tools
            .iter()
            .map(|t| t.name.len() + t.description.len() + t.parameters.to_string().len())
            .sum();
        input + total_size(&self.context) + tools
    }
}

/// What a model call returns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub images: Vec<String>,
    /// Provider-reported cost in USD, when known at return time
    #[serde(default)]
    pub cost: Option<f64>,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    pub model: String,
    #[serde(default)]
    pub request_id: String,
}

impl AgentResponse {
    /// A plain text response.
    pub fn text(model: &str, content: &str) -> Self {
        Self {
            content: content.to_string(),
            model: model.to_string(),
            request_id: uuid::Uuid::new_v4().to_string(),
            ..Default::default()
        }
    }

    pub fn with_tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.tool_calls = calls;
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }

    pub fn with_usage(mut self, tokens_in: u64, tokens_out: u64) -> Self {
        self.tokens_in = tokens_in;
        self.tokens_out = tokens_out;
        self
    }

    /// A response with no text, no tool calls and no media.
    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty() && self.tool_calls.is_empty() && self.images.is_empty()
    }

    /// The assistant message this response adds to the context.
    pub fn to_message(&self) -> Message {
        Message::assistant(self.content.clone())
            .with_tool_calls(self.tool_calls.clone())
            .with_images(self.images.clone())
    }
}

/// The language-model client.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn run(&self, request: AgentRequest) -> Result<AgentResponse, AgentError>;
}

/// Executes tool calls emitted by the model.
#[async_trait]
pub trait Toolbox: Send + Sync {
    async fn call(&self, name: &str, arguments: &serde_json::Value) -> anyhow::Result<String>;

    /// Specs for the named tools; unknown names are skipped.
    fn specs(&self, names: &[String]) -> Vec<ToolSpec>;
}

/// A toolbox with no tools.
pub struct EmptyToolbox;

#[async_trait]
impl Toolbox for EmptyToolbox {
    async fn call(&self, name: &str, _arguments: &serde_json::Value) -> anyhow::Result<String> {
        anyhow::bail!("No tool named '{}'", name)
    }

    fn specs(&self, _names: &[String]) -> Vec<ToolSpec> {
        Vec::new()
    }
}

/// Shared token counter. Checked before each call, not locked across calls:
/// concurrent callers may overshoot the limit by one call each.
#[derive(Debug)]
pub struct TokenBudget {
    limit: u64,
    used: AtomicU64,
}

impl TokenBudget {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            used: AtomicU64::new(0),
        }
    }

    pub fn check(&self) -> Result<(), PhaseError> {
        let used = self.used();
        if used >= self.limit {
            return Err(PhaseError::TokenBudgetExceeded {
                limit: self.limit,
                used,
            });
        }
        Ok(())
    }

    pub fn record(&self, tokens: u64) {
        self.used.fetch_add(tokens, Ordering::Relaxed);
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_response_detection() {
        assert!(AgentResponse::text("m", "   ").is_empty());
        assert!(!AgentResponse::text("m", "ok").is_empty());
        let tool_only = AgentResponse::text("m", "")
            .with_tool_calls(vec![ToolCall::new("1", "search", serde_json::json!({}))]);
        assert!(!tool_only.is_empty());
    }

    #[test]
    fn test_request_size_includes_context() {
        let request = AgentRequest::new("m", Some("abcd".into()))
            .with_context(vec![Message::system("12345")]);
        assert_eq!(request.size(), 9);
    }

    #[test]
    fn test_route_tool_lists_targets() {
        let spec = ToolSpec::route_to(&["review".to_string(), "publish".to_string()]);
        assert_eq!(spec.name, ROUTE_TOOL);
        assert!(spec.description.contains("review, publish"));
    }

    #[test]
    fn test_token_budget_is_best_effort() {
        let budget = TokenBudget::new(100);
        assert!(budget.check().is_ok());
        budget.record(60);
        assert!(budget.check().is_ok());
        budget.record(60);
        assert_eq!(budget.used(), 120);
        assert!(matches!(
            budget.check(),
            Err(PhaseError::TokenBudgetExceeded { limit: 100, used: 120 })
        ));
    }

    #[tokio::test]
    async fn test_empty_toolbox_rejects_calls() {
        let result = EmptyToolbox.call("search", &serde_json::json!({})).await;
        assert!(result.is_err());
        assert!(EmptyToolbox.specs(&["search".to_string()]).is_empty());
    }
}
