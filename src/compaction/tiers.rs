//! Tiered compression of older turns.

use super::CompressionConfig;
use crate::agent::{Message, Role};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

static ERROR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(error|errors|exception|traceback|panicked|failed|failure)\b").unwrap()
});

/// Index where the full-fidelity window starts: the `window_turns`-th
/// assistant message counted from the end.
pub fn window_start(history: &[Message], window_turns: usize) -> usize {
    if window_turns == 0 {
        return history.len();
    }
    let mut seen = 0;
    for (i, msg) in history.iter().enumerate().rev() {
        if msg.role == Role::Assistant {
            seen += 1;
            if seen == window_turns {
                return i;
            }
        }
    }
    0
}

/// Compress everything before the trailing window. The input is not modified.
pub fn compress(history: &[Message], config: &CompressionConfig) -> Vec<Message> {
    let split = window_start(history, config.window_turns);
    history
        .iter()
        .enumerate()
        .map(|(i, msg)| {
            if i < split {
                compress_message(msg, config)
            } else {
                msg.clone()
            }
        })
        .collect()
}

/// Apply the first matching tier. A transform is kept only when it shortens the message.
pub fn compress_message(msg: &Message, config: &CompressionConfig) -> Message {
    if mentions_error(&msg.content) {
        return msg.clone();
    }

    let replacement = match msg.role {
        Role::Tool if msg.size() > config.min_tool_result_chars => {
            Some(tool_placeholder(&msg.content))
        }
        Role::Assistant if msg.has_tool_calls() => {
            let names: Vec<&str> = msg.tool_calls.iter().map(|c| c.name.as_str()).collect();
            let preview = take_chars(&msg.content, config.preview_chars);
            Some(if preview.trim().is_empty() {
                format!("called tools: [{}]", names.join(", "))
            } else {
                format!("called tools: [{}] {}", names.join(", "), preview.trim())
            })
        }
        Role::Assistant if msg.size() > config.reasoning_max_chars => Some(format!(
            "{}\n[truncated: original {} chars]",
            take_chars(&msg.content, config.reasoning_max_chars),
            msg.size()
        )),
        _ => None,
    };

    match replacement {
        Some(content) if content.chars().count() < msg.size() => {
            let mut compressed = msg.clone();
            compressed.content = content;
            compressed
        }
        _ => msg.clone(),
    }
}

pub fn mentions_error(text: &str) -> bool {
    ERROR_REGEX.is_match(text)
}

/// Placeholder for an elided tool result: type, size and content hash.
pub fn tool_placeholder(content: &str) -> String {
    let kind = if serde_json::from_str::<serde_json::Value>(content).is_ok() {
        "json"
    } else {
        "text"
    };
    format!(
        "[tool result omitted: type={}, size={} chars, sha256={}]",
        kind,
        content.chars().count(),
        content_hash(content)
    )
}

/// First 16 hex digits of the SHA-256 of the content.
pub fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    digest.iter().take(8).map(|b| format!("{:02x}", b)).collect()
}

pub(crate) fn take_chars(text: &str, n: usize) -> String {
    text.chars().take(n).collect()
}
