//! Prometheus metrics for the decay subsystem.
//!
//! Counters here are cumulative and reset to zero on process restart; they
//! are deliberately not persisted (lifecycle state lives in the graph, not
//! in the collector). Dashboards must therefore use time-over-time wrapping
//! so restarts do not render as cliffs:
//!
//! ```text
//! increase(nisyan_memories_purged_total[1h])
//! sum by (status) (increase(nisyan_maintenance_runs_total[1d]))
//! max_over_time(nisyan_memories_total[10m])
//! ```
//!
//! Gauges are refreshed from the health aggregation at the end of each
//! maintenance cycle.

use std::sync::atomic::{AtomicU64, Ordering};

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::health::{ClassificationCounts, HealthMetrics};
use crate::model::LifecycleState;

// ── Label types ────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StatusLabel {
    pub status: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StateLabel {
    pub state: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TransitionLabel {
    pub from: String,
    pub to: String,
}

// ── Metrics registry ───────────────────────────────────────────────────────────

pub struct Metrics {
    pub registry: Registry,

    // Maintenance counters, cumulative, incremented per cycle
    pub maintenance_runs: Family<StatusLabel, Counter>,
    pub decay_scores_updated: Counter,
    pub transitions: Family<TransitionLabel, Counter>,
    pub memories_purged: Counter,

    // Classification counter by outcome
    pub classification_requests: Family<StatusLabel, Counter>,

    // Graph population gauges, refreshed after each cycle
    pub memories_by_state: Family<StateLabel, Gauge>,
    pub memories_total: Gauge,
    pub avg_decay_score: Gauge<f64, AtomicU64>,
    pub avg_importance: Gauge<f64, AtomicU64>,
    pub avg_stability: Gauge<f64, AtomicU64>,

    // Durations
    pub maintenance_duration: Histogram,
    pub classification_duration: Histogram,
    pub rerank_duration: Histogram,

    // Classification outcomes since the last health aggregation; drained
    // by take_classification_window().
    window_llm: AtomicU64,
    window_fallback: AtomicU64,
    window_error: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let maintenance_runs: Family<StatusLabel, Counter> = Family::default();
        registry.register(
            "nisyan_maintenance_runs_total",
            "Maintenance cycles completed, by final status",
            maintenance_runs.clone(),
        );

        let decay_scores_updated: Counter = Counter::default();
        registry.register(
            "nisyan_decay_scores_updated_total",
            "Decay scores recomputed and persisted",
            decay_scores_updated.clone(),
        );

        let transitions: Family<TransitionLabel, Counter> = Family::default();
        registry.register(
            "nisyan_transitions_total",
            "Lifecycle transitions applied, by (from, to) pair",
            transitions.clone(),
        );

        let memories_purged: Counter = Counter::default();
        registry.register(
            "nisyan_memories_purged_total",
            "Soft-deleted memories hard-deleted past retention",
            memories_purged.clone(),
        );

        let classification_requests: Family<StatusLabel, Counter> = Family::default();
        registry.register(
            "nisyan_classification_requests_total",
            "Classifier invocations by outcome (success, fallback, error)",
            classification_requests.clone(),
        );

        let memories_by_state: Family<StateLabel, Gauge> = Family::default();
        registry.register(
            "nisyan_memories_by_state",
            "Current number of memories per lifecycle state",
            memories_by_state.clone(),
        );

        let memories_total: Gauge = Gauge::default();
        registry.register(
            "nisyan_memories_total",
            "Total memories excluding soft-deleted",
            memories_total.clone(),
        );

        let avg_decay_score: Gauge<f64, AtomicU64> = Gauge::default();
        registry.register(
            "nisyan_avg_decay_score",
            "Mean decay score across live memories",
            avg_decay_score.clone(),
        );

        let avg_importance: Gauge<f64, AtomicU64> = Gauge::default();
        registry.register(
            "nisyan_avg_importance",
            "Mean importance across live memories",
            avg_importance.clone(),
        );

        let avg_stability: Gauge<f64, AtomicU64> = Gauge::default();
        registry.register(
            "nisyan_avg_stability",
            "Mean stability across live memories",
            avg_stability.clone(),
        );

        let maintenance_duration =
            Histogram::new([0.1_f64, 1.0, 5.0, 30.0, 60.0, 300.0, 600.0].into_iter());
        registry.register(
            "nisyan_maintenance_duration_seconds",
            "Maintenance cycle duration in seconds",
            maintenance_duration.clone(),
        );

        let classification_duration =
            Histogram::new([0.05_f64, 0.1, 0.5, 1.0, 5.0, 15.0].into_iter());
        registry.register(
            "nisyan_classification_duration_seconds",
            "Single classification request duration in seconds",
            classification_duration.clone(),
        );

        let rerank_duration =
            Histogram::new([0.001_f64, 0.005, 0.01, 0.05, 0.1, 0.5].into_iter());
        registry.register(
            "nisyan_rerank_duration_seconds",
            "Search re-rank overhead in seconds",
            rerank_duration.clone(),
        );

        Self {
            registry,
            maintenance_runs,
            decay_scores_updated,
            transitions,
            memories_purged,
            classification_requests,
            memories_by_state,
            memories_total,
            avg_decay_score,
            avg_importance,
            avg_stability,
            maintenance_duration,
            classification_duration,
            rerank_duration,
            window_llm: AtomicU64::new(0),
            window_fallback: AtomicU64::new(0),
            window_error: AtomicU64::new(0),
        }
    }

    pub fn record_maintenance_run(&self, status: &str) {
        self.maintenance_runs
            .get_or_create(&StatusLabel {
                status: status.to_string(),
            })
            .inc();
    }

    pub fn record_transition(&self, from: LifecycleState, to: LifecycleState) {
        self.transitions
            .get_or_create(&TransitionLabel {
                from: from.label().to_string(),
                to: to.label().to_string(),
            })
            .inc();
    }

    pub fn record_classification(&self, status: &str) {
        self.classification_requests
            .get_or_create(&StatusLabel {
                status: status.to_string(),
            })
            .inc();
        match status {
            "success" => self.window_llm.fetch_add(1, Ordering::Relaxed),
            "fallback" => self.window_fallback.fetch_add(1, Ordering::Relaxed),
            _ => self.window_error.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Drain the classification outcome counts accumulated since the last
    /// health aggregation.
    pub fn take_classification_window(&self) -> ClassificationCounts {
        ClassificationCounts {
            success: self.window_llm.swap(0, Ordering::Relaxed),
            fallback: self.window_fallback.swap(0, Ordering::Relaxed),
            error: self.window_error.swap(0, Ordering::Relaxed),
        }
    }

    /// Push a health snapshot into the gauges. Called at the end of a
    /// maintenance cycle; any failure upstream of this is swallowed by the
    /// orchestrator.
    pub fn refresh_gauges(&self, health: &HealthMetrics) {
        for state in LifecycleState::ALL {
            let count = health
                .counts_by_state
                .get(state.label())
                .copied()
                .unwrap_or(0);
            self.memories_by_state
                .get_or_create(&StateLabel {
                    state: state.label().to_string(),
                })
                .set(count as i64);
        }
        self.memories_total.set(health.total_memories as i64);
        self.avg_decay_score.set(health.avg_decay_score);
        self.avg_importance.set(health.avg_importance);
        self.avg_stability.set(health.avg_stability);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
