use visitflow_core::settings::BranchWeights;
use visitflow_core::types::Edge;

const VARIANT_LETTERS: [&str; 3] = ["a", "b", "c"];

/// Pick a variant index for a uniform `draw` in `[0, 1)`.
///
/// Weights are scaled against their sum (at least 1) and walked in order; the
/// first variant whose cumulative boundary exceeds the draw wins.
pub fn pick_variant(weights: &[u32], draw: f64) -> usize {
    let total = weights.iter().sum::<u32>().max(1) as f64;
    let r = draw * total;
    let mut cumulative = 0.0;
    for (i, w) in weights.iter().enumerate() {
        cumulative += *w as f64;
        if r < cumulative {
            return i;
        }
    }
    0
}

/// Resolve a chosen variant to one outgoing edge.
///
/// Edge labels match case-insensitively against the variant letter or its
/// configured label; otherwise the variant's position among the edges is used.
pub fn select_edge<'a>(split: &BranchWeights, variant: usize, edges: &[&'a Edge]) -> Option<&'a Edge> {
    if edges.is_empty() {
        return None;
    }
    let letter = VARIANT_LETTERS.get(variant).copied().unwrap_or("a");
    let custom = split
        .labels
        .get(variant)
        .and_then(|l| l.as_deref())
        .map(str::to_lowercase);

    let labeled = edges.iter().find(|edge| {
        edge.label.as_deref().map_or(false, |label| {
            let label = label.trim().to_lowercase();
            label == letter
                || label == format!("variant {}", letter)
                || custom.as_deref() == Some(label.as_str())
        })
    });

    labeled
        .copied()
        .or_else(|| edges.get(variant.min(edges.len() - 1)).copied())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn split(weights: Vec<u32>) -> BranchWeights {
        let labels = vec![None; weights.len()];
        BranchWeights { weights, labels }
    }

    #[test]
    fn test_pick_variant_boundaries() {
        assert_eq!(pick_variant(&[70, 30], 0.0), 0);
        assert_eq!(pick_variant(&[70, 30], 0.699), 0);
        assert_eq!(pick_variant(&[70, 30], 0.7), 1);
        assert_eq!(pick_variant(&[70, 30], 0.999), 1);
        assert_eq!(pick_variant(&[0, 100], 0.0), 1);
        assert_eq!(pick_variant(&[0, 0], 0.5), 0);
    }

    #[test]
    fn test_selection_frequency_matches_weights() {
        let mut rng = StdRng::seed_from_u64(7);
        for weights in [vec![70, 30], vec![50, 50], vec![20, 30, 50], vec![90, 10]] {
            let n = 10_000;
            let mut counts = vec![0usize; weights.len()];
            for _ in 0..n {
                counts[pick_variant(&weights, rng.gen::<f64>())] += 1;
            }
            let total: u32 = weights.iter().sum();
            for (i, w) in weights.iter().enumerate() {
                let observed = counts[i] as f64 / n as f64;
                let expected = *w as f64 / total as f64;
                assert!(
                    (observed - expected).abs() < 0.03,
                    "variant {} observed {:.3} expected {:.3}",
                    i,
                    observed,
                    expected
                );
            }
        }
    }

    #[test]
    fn test_select_edge_by_label() {
        let edges = [
            Edge::labeled("s", "banner", "B"),
            Edge::labeled("s", "modal", "a"),
        ];
        let refs: Vec<&Edge> = edges.iter().collect();
        let s = split(vec![70, 30]);
        assert_eq!(select_edge(&s, 0, &refs).unwrap().target, "modal");
        assert_eq!(select_edge(&s, 1, &refs).unwrap().target, "banner");
    }

    #[test]
    fn test_select_edge_custom_label_and_fallback() {
        let edges = [
            Edge::new("s", "first"),
            Edge::labeled("s", "second", "Control"),
        ];
        let refs: Vec<&Edge> = edges.iter().collect();
        let s = BranchWeights {
            weights: vec![50, 50, 0],
            labels: vec![Some("control".into()), None, None],
        };
        assert_eq!(select_edge(&s, 0, &refs).unwrap().target, "second");
        assert_eq!(select_edge(&s, 1, &refs).unwrap().target, "second");
        assert_eq!(select_edge(&s, 2, &refs).unwrap().target, "second");
        assert!(select_edge(&s, 0, &[]).is_none());

        let unlabeled = [Edge::new("s", "x"), Edge::new("s", "y")];
        let refs: Vec<&Edge> = unlabeled.iter().collect();
        assert_eq!(select_edge(&split(vec![50, 50]), 1, &refs).unwrap().target, "y");
    }
}
