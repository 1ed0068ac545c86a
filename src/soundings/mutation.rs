//! Prompt mutation for non-baseline candidates.

use crate::definition::MutationMode;
use serde::{Deserialize, Serialize};

/// Prefixes for `augment` mode.
pub const AUGMENT_FRAGMENTS: &[&str] = &[
    "Before answering, restate the task in one sentence to make sure you understood it.",
    "Work step by step and check each step before moving on.",
    "Be concise: prefer the shortest answer that fully solves the task.",
    "Consider at least two different ways to solve this before committing to one.",
    "Pay special attention to edge cases and unstated assumptions.",
    "Write for an expert reader; skip the basics.",
];

/// Suffixes for `approach` mode.
pub const APPROACH_HINTS: &[&str] = &[
    "Approach: start from a concrete example and generalize from it.",
    "Approach: work backwards from what a perfect result would look like.",
    "Approach: break the problem into independent parts and solve each one.",
    "Approach: list the constraints first, then find a solution that meets all of them.",
    "Approach: draft quickly, then critique and revise the draft once.",
    "Approach: explain it as if teaching someone new to the subject.",
];

/// How a candidate's prompt differs from the baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub mode: MutationMode,
    /// Fragment or hint that was applied, or the rewritten prompt
    pub applied: String,
}

/// Fixed-fragment mutation for `augment` and `approach` modes.
///
/// Candidate 0 is always the baseline, and the rewrite modes are handled by
/// the explorer because they need a model call. Both return `None` here.
pub fn apply_fixed(mode: MutationMode, index: usize, prompt: &str) -> Option<(String, Mutation)> {
    if index == 0 {
        return None;
    }
    let slot = index - 1;
    match mode {
        MutationMode::Augment => {
            let fragment = AUGMENT_FRAGMENTS[slot % AUGMENT_FRAGMENTS.len()];
            Some((
                format!("{}\n\n{}", fragment, prompt),
                Mutation {
                    mode,
                    applied: fragment.to_string(),
                },
            ))
        }
        MutationMode::Approach => Some(approach_hint(slot, prompt)),
        MutationMode::None | MutationMode::Rewrite | MutationMode::RewriteFree => None,
    }
}

/// Append the `slot`-th approach hint.
pub fn approach_hint(slot: usize, prompt: &str) -> (String, Mutation) {
    let hint = APPROACH_HINTS[slot % APPROACH_HINTS.len()];
    (
        format!("{}\n\n{}", prompt, hint),
        Mutation {
            mode: MutationMode::Approach,
            applied: hint.to_string(),
        },
    )
}

/// Instruction for the auxiliary rewrite call.
///
/// `examples` are rewrites that won earlier runs of the same phase and input.
pub fn rewrite_request(prompt: &str, examples: &[String]) -> String {
    let mut request = String::from(
        "Rewrite the task prompt below so it asks for exactly the same outcome in a different \
         way. Keep every requirement and constraint. Reply with the rewritten prompt only.\n",
    );

    if !examples.is_empty() {
        request.push_str(
            "\nRewrites of this same task that produced winning results before. Learn from \
             what made them effective; do not copy them verbatim.\n",
        );
        for (i, example) in examples.iter().enumerate() {
            request.push_str(&format!("\n<example {}>\n{}\n</example {}>\n", i + 1, example, i + 1));
        }
    }

    request.push_str(&format!("\n<prompt>\n{}\n</prompt>", prompt));
    request
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baseline_is_never_mutated() {
        for mode in [
            MutationMode::Augment,
            MutationMode::Approach,
            MutationMode::Rewrite,
        ] {
            assert!(apply_fixed(mode, 0, "task").is_none());
        }
    }

    #[test]
    fn test_augment_prepends() {
        let (prompt, mutation) = apply_fixed(MutationMode::Augment, 1, "Write a haiku").unwrap();
        assert!(prompt.starts_with(AUGMENT_FRAGMENTS[0]));
        assert!(prompt.ends_with("Write a haiku"));
        assert_eq!(mutation.mode, MutationMode::Augment);
    }

    #[test]
    fn test_approach_appends_and_cycles() {
        let (prompt, _) = apply_fixed(MutationMode::Approach, 2, "Solve it").unwrap();
        assert!(prompt.starts_with("Solve it"));
        assert!(prompt.ends_with(APPROACH_HINTS[1]));

        let wrap = APPROACH_HINTS.len() + 1;
        let (_, m) = apply_fixed(MutationMode::Approach, wrap, "x").unwrap();
        assert_eq!(m.applied, APPROACH_HINTS[0]);
    }

    #[test]
    fn test_rewrite_request_includes_examples() {
        let plain = rewrite_request("Summarize", &[]);
        assert!(!plain.contains("<example"));
        assert!(plain.contains("<prompt>\nSummarize\n</prompt>"));

        let learned = rewrite_request("Summarize", &["Give a summary".to_string()]);
        assert!(learned.contains("<example 1>\nGive a summary"));
        assert!(learned.contains("do not copy them verbatim"));
    }
}
