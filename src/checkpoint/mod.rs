//! Human checkpoints.
//!
//! The engine describes what it needs as a [`UiSpec`], hands it to a
//! [`CheckpointGateway`] and blocks on the answer. A checkpoint is created,
//! optionally answered by an external actor, consumed once by the waiting
//! caller and then discarded.

mod memory;

pub use memory::InMemoryCheckpointGateway;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Kind of input a field asks for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FieldKind {
    Text,
    Confirm,
    Choice { options: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiField {
    pub name: String,
    pub label: String,
    #[serde(flatten)]
    pub kind: FieldKind,
}

impl UiField {
    pub fn text(name: &str, label: &str) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            kind: FieldKind::Text,
        }
    }

    pub fn confirm(name: &str, label: &str) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            kind: FieldKind::Confirm,
        }
    }

    pub fn choice(name: &str, label: &str, options: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            kind: FieldKind::Choice { options },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiSection {
    pub heading: String,
    pub body: String,
}

/// What the renderer should show.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UiSpec {
    pub title: String,
    #[serde(default)]
    pub sections: Vec<UiSection>,
    #[serde(default)]
    pub fields: Vec<UiField>,
}

impl UiSpec {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            ..Default::default()
        }
    }

    pub fn with_section(mut self, heading: &str, body: &str) -> Self {
        self.sections.push(UiSection {
            heading: heading.to_string(),
            body: body.to_string(),
        });
        self
    }

    pub fn with_field(mut self, field: UiField) -> Self {
        self.fields.push(field);
        self
    }
}

/// A pending request for input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub ui: UiSpec,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    pub created_at: DateTime<Utc>,
}

/// The answer map returned by the renderer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointResponse(pub Map<String, Value>);

impl CheckpointResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.0.insert(key.to_string(), value);
        self
    }

    /// Selected candidate index, from a `selected` field given as number or numeric text.
    pub fn selected(&self) -> Option<usize> {
        match self.0.get("selected")? {
            Value::Number(n) => n.as_u64().map(|n| n as usize),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Whether the responder rejected everything.
    pub fn is_reject(&self) -> bool {
        matches!(self.0.get("reject"), Some(Value::Bool(true)))
            || matches!(self.0.get("action"), Some(Value::String(a)) if a == "reject")
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

/// The external checkpoint service.
#[async_trait]
pub trait CheckpointGateway: Send + Sync {
    /// Register a checkpoint and return its id.
    async fn create(&self, ui: UiSpec, timeout: Option<Duration>) -> anyhow::Result<String>;

    /// Block until answered; `None` on timeout or when the id is unknown.
    async fn wait(&self, id: &str, timeout: Option<Duration>) -> Option<CheckpointResponse>;
}
