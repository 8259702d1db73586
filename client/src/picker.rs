//! Provider selection: score candidates on smoothed success rate,
//! latency and price, then pick uniformly among the near-best.

use rand::seq::SliceRandom;

use fabric_common::protocol::NodeSummary;

use crate::delegate::DelegationError;

/// Scores within this margin of the best form the tie bucket.
const TIE_MARGIN: f64 = 0.5;

/// Higher is better. Laplace smoothing avoids zero-division and
/// cold-start bias; nodes with no latency data are treated as if they
/// averaged one second.
pub fn score_node(node: &NodeSummary) -> f64 {
    let total = node.success_count + node.fail_count;
    let success_rate = (node.success_count + 1) as f64 / (total + 2) as f64;
    let avg_latency = if node.avg_latency_ms == 0 {
        1000
    } else {
        node.avg_latency_ms
    } as f64;
    let price = node.price_points.max(1) as f64;
    success_rate * 100.0 - (avg_latency / 1000.0) * 10.0 - price * 2.0
}

/// Pick the best candidate, breaking near-ties randomly so load spreads
/// across equivalent providers.
pub fn pick_node<'a>(
    nodes: &'a [NodeSummary],
    max_price_points: Option<u64>,
) -> Result<&'a NodeSummary, DelegationError> {
    let candidates: Vec<&NodeSummary> = nodes
        .iter()
        .filter(|n| max_price_points.map(|max| n.price_points <= max).unwrap_or(true))
        .collect();
    if candidates.is_empty() {
        return Err(DelegationError::NoEligibleNodes);
    }

    let top_score = candidates
        .iter()
        .map(|n| score_node(n))
        .fold(f64::NEG_INFINITY, f64::max);
    let bucket: Vec<&NodeSummary> = candidates
        .into_iter()
        .filter(|n| score_node(n) >= top_score - TIE_MARGIN)
        .collect();
    Ok(bucket
        .choose(&mut rand::thread_rng())
        .copied()
        .expect("tie bucket always contains the top candidate"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, success: u64, fail: u64, avg_latency_ms: u64, price: u64) -> NodeSummary {
        NodeSummary {
            node_id: id.to_string(),
            success_count: success,
            fail_count: fail,
            avg_latency_ms,
            price_points: price,
            online: true,
            ..Default::default()
        }
    }

    #[test]
    fn laplace_smoothing_matches_formula() {
        // fresh node: (0+1)/(0+2) = 0.5 rate, 1000ms default, price 1
        let fresh = node("fresh", 0, 0, 0, 1);
        assert!((score_node(&fresh) - (50.0 - 10.0 - 2.0)).abs() < 1e-9);

        // seasoned node: 9/10 rate, 500ms, price 2
        let seasoned = node("seasoned", 8, 0, 500, 2);
        assert!((score_node(&seasoned) - (90.0 - 5.0 - 4.0)).abs() < 1e-9);
    }

    #[test]
    fn reliable_cheap_fast_wins() {
        let nodes = vec![
            node("slow", 10, 0, 5000, 1),
            node("failing", 1, 9, 100, 1),
            node("good", 10, 0, 100, 1),
        ];
        for _ in 0..20 {
            assert_eq!(pick_node(&nodes, None).unwrap().node_id, "good");
        }
    }

    #[test]
    fn near_ties_spread_across_the_bucket() {
        // identical scores: the pick must eventually hit both
        let nodes = vec![node("a", 5, 0, 100, 1), node("b", 5, 0, 100, 1)];
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            seen.insert(pick_node(&nodes, None).unwrap().node_id.clone());
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn price_cap_filters_candidates() {
        let nodes = vec![node("cheap", 0, 0, 0, 2), node("pricey", 100, 0, 10, 50)];
        assert_eq!(pick_node(&nodes, Some(10)).unwrap().node_id, "cheap");
        assert!(matches!(
            pick_node(&nodes, Some(1)),
            Err(DelegationError::NoEligibleNodes)
        ));
    }

    #[test]
    fn empty_candidate_list_is_an_error() {
        assert!(matches!(
            pick_node(&[], None),
            Err(DelegationError::NoEligibleNodes)
        ));
    }
}
