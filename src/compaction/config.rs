//! Compression thresholds.

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Thresholds for the context compressor (`[context]` in `cascade.toml`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Trailing assistant turns kept at full fidelity
    #[serde(default = "default_window_turns")]
    pub window_turns: usize,
    /// Tool results longer than this are replaced by a placeholder
    #[serde(default = "default_min_tool_result_chars")]
    pub min_tool_result_chars: usize,
    /// Reasoning longer than this is truncated
    #[serde(default = "default_reasoning_max_chars")]
    pub reasoning_max_chars: usize,
    /// Text preview kept on collapsed tool-calling messages
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
    /// Failures replayed in loop-retry mode
    #[serde(default = "default_loop_history_limit")]
    pub loop_history_limit: usize,
    /// Characters kept from each replayed failed output
    #[serde(default = "default_loop_output_chars")]
    pub loop_output_chars: usize,
}

fn default_window_turns() -> usize {
    2
}

fn default_min_tool_result_chars() -> usize {
    400
}

fn default_reasoning_max_chars() -> usize {
    1200
}

fn default_preview_chars() -> usize {
    160
}

fn default_loop_history_limit() -> usize {
    3
}

fn default_loop_output_chars() -> usize {
    600
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            window_turns: default_window_turns(),
            min_tool_result_chars: default_min_tool_result_chars(),
            reasoning_max_chars: default_reasoning_max_chars(),
            preview_chars: default_preview_chars(),
            loop_history_limit: default_loop_history_limit(),
            loop_output_chars: default_loop_output_chars(),
        }
    }
}

impl CompressionConfig {
    pub fn with_window_turns(mut self, turns: usize) -> Self {
        self.window_turns = turns;
        self
    }

    pub fn with_loop_history_limit(mut self, limit: usize) -> Self {
        self.loop_history_limit = limit;
        self
    }

    /// Reject settings that would make compression meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.loop_output_chars == 0 {
            anyhow::bail!("context.loop_output_chars must be greater than 0");
        }
        if self.reasoning_max_chars == 0 {
            anyhow::bail!("context.reasoning_max_chars must be greater than 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CompressionConfig::default();
        assert_eq!(config.window_turns, 2);
        assert_eq!(config.min_tool_result_chars, 400);
        assert_eq!(config.loop_history_limit, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: CompressionConfig = toml::from_str("window_turns = 5").unwrap();
        assert_eq!(config.window_turns, 5);
        assert_eq!(config.preview_chars, 160);
    }

    #[test]
    fn test_validate_rejects_zero_output_chars() {
        let config = CompressionConfig {
            loop_output_chars: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
