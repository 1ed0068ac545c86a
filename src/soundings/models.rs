//! Model assignment and context-window filtering for candidates.

use crate::config::ModelCatalog;
use crate::definition::{ModelStrategy, ModelsSpec};
use rand::Rng;
use std::collections::BTreeSet;
use tracing::warn;

/// Rough token estimate from a character count.
pub fn estimate_tokens(chars: usize) -> u64 {
    (chars as u64).div_ceil(4)
}

/// One model per candidate.
///
/// A per-model map expands to exactly that many candidates per model and
/// overrides `factor`. A list is spread round-robin or at random. Without
/// multi-model config every candidate uses `default_model`.
pub fn assign_models<R: Rng + ?Sized>(
    factor: usize,
    default_model: &str,
    models: Option<&ModelsSpec>,
    strategy: ModelStrategy,
    rng: &mut R,
) -> Vec<String> {
    match models {
        Some(ModelsSpec::PerModel(counts)) => counts
            .iter()
            .flat_map(|(model, count)| std::iter::repeat_n(model.clone(), *count as usize))
            .collect(),
        Some(ModelsSpec::List(list)) if !list.is_empty() => (0..factor)
            .map(|i| match strategy {
                ModelStrategy::RoundRobin => list[i % list.len()].clone(),
                ModelStrategy::Random => list[rng.gen_range(0..list.len())].clone(),
            })
            .collect(),
        _ => vec![default_model.to_string(); factor],
    }
}

/// Drop models whose context window cannot hold the request.
///
/// Only applies when two or more distinct models are assigned. Slots held by
/// a dropped model are reassigned round-robin over the models that remain.
/// If every model would be dropped the assignment is returned unchanged.
pub fn filter_by_context(
    assigned: Vec<String>,
    required_tokens: u64,
    safety_multiplier: f64,
    catalog: &ModelCatalog,
) -> Vec<String> {
    let distinct: BTreeSet<&String> = assigned.iter().collect();
    if distinct.len() < 2 {
        return assigned;
    }

    let needed = (required_tokens as f64 * safety_multiplier).ceil() as u64;
    let fits = |model: &str| catalog.context_limit(model).is_none_or(|limit| limit >= needed);

    let viable: Vec<String> = distinct
        .iter()
        .filter(|m| fits(m))
        .map(|m| m.to_string())
        .collect();

    if viable.is_empty() {
        warn!(
            needed,
            "No assigned model has a large enough context window, keeping all"
        );
        return assigned;
    }
    if viable.len() == distinct.len() {
        return assigned;
    }

    for dropped in distinct.iter().filter(|m| !fits(m)) {
        warn!(model = %dropped, needed, "Dropping model with insufficient context window");
    }

    let mut next = 0;
    assigned
        .into_iter()
        .map(|model| {
            if fits(&model) {
                model
            } else {
                let replacement = viable[next % viable.len()].clone();
                next += 1;
                replacement
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelInfo;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::BTreeMap;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn test_default_model_for_every_candidate() {
        let models = assign_models(3, "base", None, ModelStrategy::RoundRobin, &mut rng());
        assert_eq!(models, vec!["base", "base", "base"]);
    }

    #[test]
    fn test_round_robin_list() {
        let spec = ModelsSpec::List(vec!["a".into(), "b".into()]);
        let models = assign_models(5, "base", Some(&spec), ModelStrategy::RoundRobin, &mut rng());
        assert_eq!(models, vec!["a", "b", "a", "b", "a"]);
    }

    #[test]
    fn test_random_list_stays_in_list() {
        let spec = ModelsSpec::List(vec!["a".into(), "b".into(), "c".into()]);
        let models = assign_models(20, "base", Some(&spec), ModelStrategy::Random, &mut rng());
        assert_eq!(models.len(), 20);
        assert!(models.iter().all(|m| ["a", "b", "c"].contains(&m.as_str())));
    }

    #[test]
    fn test_per_model_map_overrides_factor() {
        let spec = ModelsSpec::PerModel(BTreeMap::from([("a".into(), 2), ("b".into(), 1)]));
        let models = assign_models(10, "base", Some(&spec), ModelStrategy::RoundRobin, &mut rng());
        assert_eq!(models, vec!["a", "a", "b"]);
    }

    fn catalog() -> ModelCatalog {
        ModelCatalog::default()
            .with_model(
                "small",
                ModelInfo {
                    context_limit: Some(1000),
                    ..Default::default()
                },
            )
            .with_model(
                "large",
                ModelInfo {
                    context_limit: Some(100_000),
                    ..Default::default()
                },
            )
    }

    #[test]
    fn test_filter_replaces_small_model() {
        let assigned = vec!["small".to_string(), "large".to_string(), "small".to_string()];
        let filtered = filter_by_context(assigned, 900, 1.2, &catalog());
        assert_eq!(filtered, vec!["large", "large", "large"]);
    }

    #[test]
    fn test_filter_keeps_unknown_models() {
        let assigned = vec!["small".to_string(), "mystery".to_string()];
        let filtered = filter_by_context(assigned, 5000, 1.0, &catalog());
        assert_eq!(filtered, vec!["mystery", "mystery"]);
    }

    #[test]
    fn test_filter_keeps_all_when_nothing_fits() {
        let assigned = vec!["small".to_string(), "large".to_string()];
        let filtered = filter_by_context(assigned.clone(), 1_000_000, 1.0, &catalog());
        assert_eq!(filtered, assigned);
    }

    #[test]
    fn test_filter_skipped_for_single_model() {
        let assigned = vec!["small".to_string(); 2];
        let filtered = filter_by_context(assigned.clone(), 1_000_000, 1.0, &catalog());
        assert_eq!(filtered, assigned);
    }

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(0), 0);
        assert_eq!(estimate_tokens(5), 2);
        assert_eq!(estimate_tokens(8), 2);
    }
}
