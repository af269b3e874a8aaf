//! Weighted search re-ranking.
//!
//! The graph engine returns candidates ranked by semantic similarity alone.
//! The final ordering folds in recency and importance so a fresh, important
//! memory outranks a slightly better semantic match that has not been
//! touched in months:
//!
//! ```text
//! recency         = exp(-days_since_access / recency_tau_days)
//! importance_norm = (importance - 1) / 4.0
//! combined        = w_sem * semantic + w_rec * recency + w_imp * importance_norm
//! ```
//!
//! The pass is O(n) over the candidate list and does no I/O. Soft-deleted
//! nodes are dropped; everything else comes back, reordered.

use chrono::{DateTime, Utc};

use crate::config::SearchWeights;
use crate::decay::days_since_access;
use crate::model::{LifecycleState, MemoryNode};

/// A candidate with its score breakdown, sorted by `combined` descending.
#[derive(Debug, Clone)]
pub struct RankedNode {
    pub node: MemoryNode,
    pub semantic_score: f64,
    pub recency: f64,
    pub importance_norm: f64,
    pub combined: f64,
}

/// Exponential recency score: 1.0 for a just-touched node, decaying with
/// time constant `tau_days`.
pub fn recency_score(days: f64, tau_days: f64) -> f64 {
    if tau_days <= 0.0 {
        return 0.0;
    }
    (-days.max(0.0) / tau_days).exp()
}

/// Re-rank engine candidates by the weighted combination of semantic score,
/// recency and importance.
///
/// PERMANENT nodes get `recency = 1.0` so inactivity never buries them.
/// SOFT_DELETED nodes are filtered out entirely; the result is a
/// permutation of the remaining input.
pub fn rerank(
    candidates: Vec<(MemoryNode, f64)>,
    now: DateTime<Utc>,
    weights: &SearchWeights,
) -> Vec<RankedNode> {
    let mut ranked: Vec<RankedNode> = candidates
        .into_iter()
        .filter(|(node, _)| node.state != LifecycleState::SoftDeleted)
        .map(|(node, semantic_score)| {
            let recency = if node.state == LifecycleState::Permanent {
                1.0
            } else {
                let days = days_since_access(now, node.last_accessed_at, Some(node.created_at));
                recency_score(days, weights.recency_tau_days)
            };
            let importance_norm = f64::from(node.importance.clamp(1, 5) - 1) / 4.0;
            let combined = weights.semantic * semantic_score
                + weights.recency * recency
                + weights.importance * importance_norm;

            RankedNode {
                node,
                semantic_score,
                recency,
                importance_norm,
                combined,
            }
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.combined
            .partial_cmp(&a.combined)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    ranked
}
