//! Knowledge-health snapshot.
//!
//! One aggregation read over the graph plus the collector's classification
//! window, shaped for the `get_knowledge_health` tool and the gauge refresh
//! at the end of each maintenance cycle.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::storage::GraphStore;

/// Classification outcomes since the last aggregation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClassificationCounts {
    pub success: u64,
    pub fallback: u64,
    pub error: u64,
}

/// Condensed view of the most recent maintenance run.
#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceSummary {
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthMetrics {
    /// Live memories; soft-deleted nodes are excluded.
    pub total_memories: u64,
    /// Count per lifecycle state, keyed by the lowercase label.
    pub counts_by_state: BTreeMap<String, u64>,
    pub avg_decay_score: f64,
    pub avg_importance: f64,
    pub avg_stability: f64,
    pub last_maintenance: Option<MaintenanceSummary>,
    pub classification: ClassificationCounts,
}

/// Build a health snapshot from a single `stats()` read.
pub async fn aggregate<S: GraphStore>(
    store: &S,
    last_maintenance: Option<MaintenanceSummary>,
    classification: ClassificationCounts,
) -> Result<HealthMetrics> {
    let stats = store.stats().await?;

    let counts_by_state = stats
        .counts
        .iter()
        .map(|(state, count)| (state.label().to_string(), *count))
        .collect();

    Ok(HealthMetrics {
        total_memories: stats.total_excluding_deleted,
        counts_by_state,
        avg_decay_score: stats.avg_decay_score,
        avg_importance: stats.avg_importance,
        avg_stability: stats.avg_stability,
        last_maintenance,
        classification,
    })
}
