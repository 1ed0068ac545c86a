//! Quality/cost Pareto frontier.

use crate::definition::ParetoPolicy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

static SCORE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)attempt\s+(\d+)\s*[:=\-]\s*(\d+(?:\.\d+)?)").unwrap());

static FIRST_INT_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());

/// A candidate as the frontier sees it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scored {
    pub quality: f64,
    pub cost: f64,
}

/// Parse `Attempt N: score` lines. Attempt numbers are 1-based in the text
/// and 0-based in the result; scores are clamped to 0..=100 and attempts
/// outside `1..=count` are ignored. Unscored candidates get 0.
pub fn parse_scores(reply: &str, count: usize) -> Vec<f64> {
    let mut scores: HashMap<usize, f64> = HashMap::new();
    for caps in SCORE_REGEX.captures_iter(reply) {
        let (Ok(n), Ok(score)) = (caps[1].parse::<usize>(), caps[2].parse::<f64>()) else {
            continue;
        };
        if (1..=count).contains(&n) {
            scores.entry(n - 1).or_insert(score.clamp(0.0, 100.0));
        }
    }
    (0..count).map(|i| scores.get(&i).copied().unwrap_or(0.0)).collect()
}

/// First integer in a judge reply, read as a 1-based attempt number and
/// clamped into range. Returns 0 when there is no integer.
pub fn parse_winner_index(reply: &str, count: usize) -> usize {
    if count == 0 {
        return 0;
    }
    FIRST_INT_REGEX
        .find(reply)
        .and_then(|m| m.as_str().parse::<usize>().ok())
        .map_or(0, |n| n.clamp(1, count) - 1)
}

/// Whether `a` dominates `b`: no worse on both axes and strictly better on one.
pub fn dominates(a: Scored, b: Scored) -> bool {
    a.quality >= b.quality && a.cost <= b.cost && (a.quality > b.quality || a.cost < b.cost)
}

/// Indices of the non-dominated candidates, ascending.
pub fn frontier(points: &[Scored]) -> Vec<usize> {
    (0..points.len())
        .filter(|&i| {
            !points
                .iter()
                .enumerate()
                .any(|(j, &p)| j != i && dominates(p, points[i]))
        })
        .collect()
}

/// Pick one frontier member by policy. `External` is resolved by the caller;
/// here it behaves like `HighestQuality`.
pub fn choose(points: &[Scored], frontier: &[usize], policy: ParetoPolicy) -> Option<usize> {
    let cmp = |a: &usize, b: &usize| -> std::cmp::Ordering {
        let (pa, pb) = (points[*a], points[*b]);
        match policy {
            ParetoPolicy::Cheapest => pb
                .cost
                .total_cmp(&pa.cost)
                .then(pa.quality.total_cmp(&pb.quality)),
            ParetoPolicy::HighestQuality | ParetoPolicy::External => pa
                .quality
                .total_cmp(&pb.quality)
                .then(pb.cost.total_cmp(&pa.cost)),
            ParetoPolicy::BestRatio => ratio(pa).total_cmp(&ratio(pb)),
        }
    };
    // max_by returns the last maximum; iterate in reverse so ties go to the lowest index.
    frontier.iter().rev().copied().max_by(|a, b| cmp(a, b))
}

fn ratio(p: Scored) -> f64 {
    p.quality / p.cost.max(1e-9)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pts(raw: &[(f64, f64)]) -> Vec<Scored> {
        raw.iter()
            .map(|&(quality, cost)| Scored { quality, cost })
            .collect()
    }

    #[test]
    fn test_parse_scores() {
        let reply = "Attempt 1: 80\nattempt 3 = 95.5\nAttempt 9: 50\nAttempt 2: 300";
        assert_eq!(parse_scores(reply, 3), vec![80.0, 100.0, 95.5]);
        assert_eq!(parse_scores("nothing", 2), vec![0.0, 0.0]);
    }

    #[test]
    fn test_parse_winner_index() {
        assert_eq!(parse_winner_index("Attempt 2 is best", 3), 1);
        assert_eq!(parse_winner_index("I pick 7", 3), 2);
        assert_eq!(parse_winner_index("0", 3), 0);
        assert_eq!(parse_winner_index("no idea", 3), 0);
    }

    #[test]
    fn test_frontier_and_policies() {
        // 0 dominated by 1; 3 dominated by 2
        let points = pts(&[(50.0, 2.0), (60.0, 1.0), (90.0, 3.0), (80.0, 3.5), (40.0, 0.5)]);
        let front = frontier(&points);
        assert_eq!(front, vec![1, 2, 4]);

        assert_eq!(choose(&points, &front, ParetoPolicy::Cheapest), Some(4));
        assert_eq!(choose(&points, &front, ParetoPolicy::HighestQuality), Some(2));
        assert_eq!(choose(&points, &front, ParetoPolicy::BestRatio), Some(4));
    }

    #[test]
    fn test_equal_points_are_all_on_frontier() {
        let points = pts(&[(70.0, 1.0), (70.0, 1.0)]);
        assert_eq!(frontier(&points), vec![0, 1]);
        assert_eq!(choose(&points, &[0, 1], ParetoPolicy::HighestQuality), Some(0));
    }

    #[test]
    fn test_frontier_properties_over_generated_sets() {
        for seed in 0..50u64 {
            let points: Vec<Scored> = (0..8u64)
                .map(|i| Scored {
                    quality: ((seed * 31 + i * 17) % 101) as f64,
                    cost: ((seed * 7 + i * 13) % 11) as f64 / 10.0,
                })
                .collect();
            let front = frontier(&points);
            assert!(!front.is_empty());
            for &f in &front {
                for (j, &p) in points.iter().enumerate() {
                    assert!(j == f || !dominates(p, points[f]));
                }
            }
            for i in (0..points.len()).filter(|i| !front.contains(i)) {
                assert!(front.iter().any(|&f| dominates(points[f], points[i])));
            }
        }
    }
}
