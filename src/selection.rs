//! Ranking, fusion and budget-constrained selection of context fragments

use crate::types::*;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Fragments admitted under a budget
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub fragments: Vec<ContextFragment>,
    /// More qualifying fragments existed than were admitted
    pub truncated: bool,
    pub total_score: f32,
}

/// Merge fragments from parallel retrievals. Duplicates (same `source_id`)
/// keep the highest relevance and the position of their first appearance.
pub fn fuse_fragments(lists: Vec<Vec<ContextFragment>>) -> Vec<ContextFragment> {
    let mut fused: Vec<ContextFragment> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for fragments in lists {
        for frag in fragments {
            match index.get(&frag.source_id) {
                Some(&pos) => {
                    if frag.relevance > fused[pos].relevance {
                        fused[pos] = frag;
                    }
                }
                None => {
                    index.insert(frag.source_id.clone(), fused.len());
                    fused.push(frag);
                }
            }
        }
    }

    fused
}

/// Stable sort by relevance, highest first. Equal scores keep store order.
pub fn rank(fragments: &mut [ContextFragment]) {
    fragments.sort_by(|a, b| b.relevance.partial_cmp(&a.relevance).unwrap_or(Ordering::Equal));
}

/// Admit fragments in rank order until the fragment count or byte budget is hit.
///
/// A fragment that would overflow the byte budget is skipped and smaller,
/// lower-ranked fragments may still be admitted after it, so the output stays
/// ordered by relevance. `total_qualifying` is the number of matches the store
/// reported, which may exceed `candidates.len()`.
pub fn select_within_budget(
    mut candidates: Vec<ContextFragment>,
    total_qualifying: usize,
    budget: &ResourceBudget,
) -> Selection {
    rank(&mut candidates);
    let available = total_qualifying.max(candidates.len());

    let mut selected: Vec<ContextFragment> = Vec::new();
    let mut used_bytes = 0usize;

    for frag in candidates {
        if selected.len() >= budget.max_fragments {
            break;
        }
        let size = frag.byte_size();
        if used_bytes + size > budget.max_bytes {
            tracing::debug!(
                source = %frag.source_id,
                size,
                remaining = budget.max_bytes.saturating_sub(used_bytes),
                "SKIP: over byte budget"
            );
            continue;
        }
        used_bytes += size;
        selected.push(frag);
    }

    let total_score = selected.iter().map(|f| f.relevance).sum();
    Selection {
        truncated: selected.len() < available,
        fragments: selected,
        total_score,
    }
}

/// Judge whether ranked fragments are good enough to answer from
pub fn assess(fragments: &[ContextFragment], min_relevance: f32) -> Sufficiency {
    match fragments.first() {
        None => Sufficiency::Insufficient(InsufficientReason::NoMatches),
        Some(best) if best.relevance < min_relevance => {
            Sufficiency::Insufficient(InsufficientReason::BelowThreshold)
        }
        Some(_) => Sufficiency::Sufficient,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag(id: &str, relevance: f32, bytes: usize) -> ContextFragment {
        ContextFragment {
            source_id: id.to_string(),
            kind: FragmentKind::Record,
            vector_distance: 1.0 - relevance,
            relevance,
            payload: "x".repeat(bytes),
            origin: "test".to_string(),
        }
    }

    fn ids(fragments: &[ContextFragment]) -> Vec<&str> {
        fragments.iter().map(|f| f.source_id.as_str()).collect()
    }

    #[test]
    fn rank_is_stable_for_ties() {
        let mut frags = vec![frag("a", 0.5, 1), frag("b", 0.9, 1), frag("c", 0.5, 1)];
        rank(&mut frags);
        assert_eq!(ids(&frags), vec!["b", "a", "c"]);
    }

    #[test]
    fn count_budget_truncates() {
        let frags: Vec<_> = (0..12).map(|i| frag(&format!("f{i}"), 1.0 - i as f32 * 0.05, 10)).collect();
        let budget = ResourceBudget { max_fragments: 8, max_bytes: 10_000 };
        let sel = select_within_budget(frags, 12, &budget);
        assert_eq!(sel.fragments.len(), 8);
        assert!(sel.truncated);
        assert_eq!(sel.fragments[0].source_id, "f0");
        assert!(sel.fragments.windows(2).all(|w| w[0].relevance >= w[1].relevance));
    }

    #[test]
    fn oversized_fragment_is_skipped_for_smaller() {
        let frags = vec![frag("big", 0.9, 900), frag("small", 0.8, 50), frag("mid", 0.85, 100)];
        let budget = ResourceBudget { max_fragments: 8, max_bytes: 200 };
        let sel = select_within_budget(frags, 3, &budget);
        assert_eq!(ids(&sel.fragments), vec!["mid", "small"]);
        assert!(sel.truncated);
        assert!(sel.fragments.iter().map(|f| f.byte_size()).sum::<usize>() <= 200);
    }

    #[test]
    fn not_truncated_when_everything_fits() {
        let frags = vec![frag("a", 0.9, 10), frag("b", 0.8, 10)];
        let sel = select_within_budget(frags, 2, &ResourceBudget::default());
        assert!(!sel.truncated);
        assert!((sel.total_score - 1.7).abs() < 1e-6);

        // store reported more matches than it returned
        let frags = vec![frag("a", 0.9, 10)];
        let sel = select_within_budget(frags, 40, &ResourceBudget::default());
        assert!(sel.truncated);
    }

    #[test]
    fn fuse_keeps_max_and_first_position() {
        let fused = fuse_fragments(vec![
            vec![frag("a", 0.4, 1), frag("b", 0.7, 1)],
            vec![frag("c", 0.5, 1), frag("a", 0.9, 1)],
        ]);
        assert_eq!(ids(&fused), vec!["a", "b", "c"]);
        assert_eq!(fused[0].relevance, 0.9);
    }

    #[test]
    fn assess_thresholds() {
        assert_eq!(assess(&[], 0.35), Sufficiency::Insufficient(InsufficientReason::NoMatches));
        assert_eq!(
            assess(&[frag("a", 0.2, 1)], 0.35),
            Sufficiency::Insufficient(InsufficientReason::BelowThreshold)
        );
        assert_eq!(assess(&[frag("a", 0.6, 1)], 0.35), Sufficiency::Sufficient);
    }
}
