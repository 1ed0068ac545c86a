//! Hierarchical trace identities.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A node in the trace tree: its own id, its parent's id and its depth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceNode {
    pub id: String,
    pub parent_id: Option<String>,
    pub depth: u32,
    pub name: String,
}

impl TraceNode {
    /// A root node for a cascade run.
    pub fn root(name: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id: None,
            depth: 0,
            name: name.to_string(),
        }
    }

    pub fn child(&self, name: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id: Some(self.id.clone()),
            depth: self.depth + 1,
            name: name.to_string(),
        }
    }

    /// Allocate `count` children named `<prefix>_<i>` in order.
    ///
    /// Fan-out points call this before dispatching workers so the tree shape
    /// does not depend on completion order.
    pub fn children(&self, prefix: &str, count: usize) -> Vec<Self> {
        (0..count)
            .map(|i| self.child(&format!("{}_{}", prefix, i)))
            .collect()
    }
}
