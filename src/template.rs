//! Instruction template rendering.
//!
//! Placeholders use `{{ path }}` syntax where `path` is a dotted lookup into
//! the render scope: `input`, `state`, `outputs` and `lineage`. The scanner
//! half of this module reports which phase outputs a template refers to, which
//! is what the dependency analyzer builds its graph from.

use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::LazyLock;
use tracing::debug;

static PLACEHOLDER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").unwrap());

static OUTPUT_REF_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:outputs\.([A-Za-z0-9_\-]+)|state\.output_([A-Za-z0-9_\-]+))").unwrap()
});

/// Values visible to a template.
#[derive(Debug, Clone, Default)]
pub struct RenderScope {
    root: Map<String, Value>,
}

impl RenderScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.root.insert(key.to_string(), value);
        self
    }

    pub fn insert(&mut self, key: &str, value: Value) {
        self.root.insert(key.to_string(), value);
    }

    /// Resolve a dotted path; numeric segments index arrays.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let mut current = self.root.get(segments.next()?)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

/// Render a template. Strings render raw, other JSON values render compactly,
/// unknown paths render empty.
pub fn render(template: &str, scope: &RenderScope) -> String {
    PLACEHOLDER_REGEX
        .replace_all(template, |caps: &regex::Captures| {
            let path = caps[1].trim();
            match scope.lookup(path) {
                Some(value) => value_to_text(value),
                None => {
                    debug!(path, "Template placeholder did not resolve");
                    String::new()
                }
            }
        })
        .into_owned()
}

/// Text form of a JSON value as it appears in prompts.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Whether the text contains any placeholder.
pub fn is_template(text: &str) -> bool {
    PLACEHOLDER_REGEX.is_match(text)
}

/// Phase names whose outputs the template refers to, in sorted order.
pub fn referenced_outputs(template: &str) -> BTreeSet<String> {
    let mut refs = BTreeSet::new();
    for placeholder in PLACEHOLDER_REGEX.captures_iter(template) {
        for caps in OUTPUT_REF_REGEX.captures_iter(&placeholder[1]) {
            if let Some(name) = caps.get(1).or_else(|| caps.get(2)) {
                refs.insert(name.as_str().to_string());
            }
        }
    }
    refs
}
