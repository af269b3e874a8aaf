//! Lifecycle state machine: a pure transition table over node snapshots.
//!
//! Rules are evaluated top to bottom; the first match wins. A node advances
//! at most one non-permanent step per maintenance cycle, which keeps a
//! first run against an old graph from mass-expiring everything at once.
//! PERMANENT promotion can happen from any live state and is never reversed
//! here; only an explicit score mutation can undo it.

use crate::config::Thresholds;
use crate::model::{LifecycleState, NodeSnapshot};

/// Evaluate the transition table for one node.
///
/// Returns the next state, or `None` when the node stays where it is.
/// `Some(SoftDeleted)` is only produced for nodes that are already EXPIRED;
/// the orchestrator applies it as the soft-delete step with its own
/// timestamp. Purging of SOFT_DELETED nodes is a retention decision, not a
/// transition, and is handled by the purge pass.
pub fn next_state(snap: &NodeSnapshot, thresholds: &Thresholds) -> Option<LifecycleState> {
    use LifecycleState::*;

    let permanent = snap.importance >= 4 && snap.stability >= 4;

    match snap.state {
        Permanent => None,
        SoftDeleted => None,
        Active => {
            if permanent {
                Some(Permanent)
            } else if snap.days_since_access >= thresholds.dormant.days
                && snap.decay_score >= thresholds.dormant.decay_score
            {
                Some(Dormant)
            } else {
                None
            }
        }
        Dormant => {
            if permanent {
                Some(Permanent)
            } else if snap.days_since_access < thresholds.dormant.days {
                // accessed since last evaluation
                Some(Active)
            } else if snap.days_since_access >= thresholds.archived.days
                && snap.decay_score >= thresholds.archived.decay_score
            {
                Some(Archived)
            } else {
                None
            }
        }
        Archived => {
            if permanent {
                Some(Permanent)
            } else if snap.days_since_access < thresholds.dormant.days {
                Some(Active)
            } else if snap.days_since_access >= thresholds.expired.days
                && snap.decay_score >= thresholds.expired.decay_score
                && snap.importance <= thresholds.expired.max_importance.unwrap_or(5)
            {
                Some(Expired)
            } else {
                None
            }
        }
        Expired => {
            if permanent {
                Some(Permanent)
            } else {
                Some(SoftDeleted)
            }
        }
    }
}
