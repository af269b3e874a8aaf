//! Maintenance orchestration.
//!
//! One cycle runs six steps in strict order (classify, recalculate decay,
//! transition states, soft-delete expired, purge past retention, refresh
//! gauges) against a single deadline of
//! `maintenance.max_duration_seconds`. When the deadline fires mid-pipeline
//! the current batch finishes, the rest is deferred, and the run reports
//! `partial`. Only one cycle may run per graph; a second trigger is
//! rejected, not queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::classify::{ClassificationStatus, Classifier};
use crate::config::ConfigHandle;
use crate::error::{NisyanError, Result};
use crate::health::{self, MaintenanceSummary};
use crate::lifecycle;
use crate::metrics::Metrics;
use crate::model::LifecycleState;
use crate::storage::GraphStore;
use crate::updater::{BatchedUpdater, Deadline, StepOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    /// Deadline reached mid-pipeline; remaining work deferred to next run.
    Partial,
    /// Irrecoverable problem (driver lost); gauges were not refreshed.
    Failure,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failure => "failure",
        }
    }
}

/// Outcome of one maintenance cycle.
#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceReport {
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: f64,
    pub status: RunStatus,
    pub dry_run: bool,
    pub classified: usize,
    pub decay_updated: usize,
    pub transitions: usize,
    pub soft_deleted: usize,
    pub purged: usize,
    pub failed_batches: usize,
    pub deadline_hit: bool,
    pub errors: Vec<String>,
}

impl MaintenanceReport {
    fn started(now: DateTime<Utc>, dry_run: bool) -> Self {
        Self {
            started_at: now,
            completed_at: None,
            duration_seconds: 0.0,
            status: RunStatus::Success,
            dry_run,
            classified: 0,
            decay_updated: 0,
            transitions: 0,
            soft_deleted: 0,
            purged: 0,
            failed_batches: 0,
            deadline_hit: false,
            errors: Vec::new(),
        }
    }

    fn absorb(&mut self, outcome: &StepOutcome) {
        self.failed_batches += outcome.failed_batches;
        self.deadline_hit |= outcome.hit_deadline;
    }

    pub fn summary(&self) -> MaintenanceSummary {
        MaintenanceSummary {
            status: self.status.as_str().to_string(),
            started_at: self.started_at,
            duration_seconds: self.duration_seconds,
        }
    }
}

/// Resets the single-cycle guard even when a step errors out early.
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct MaintenanceRunner<S> {
    store: Arc<S>,
    classifier: Arc<Classifier>,
    config: ConfigHandle,
    metrics: Arc<Metrics>,
    running: AtomicBool,
    last_run: RwLock<Option<MaintenanceReport>>,
}

impl<S: GraphStore> MaintenanceRunner<S> {
    pub fn new(
        store: Arc<S>,
        classifier: Arc<Classifier>,
        config: ConfigHandle,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            classifier,
            config,
            metrics,
            running: AtomicBool::new(false),
            last_run: RwLock::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn last_report(&self) -> Option<MaintenanceReport> {
        self.last_run
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Run one cycle against the wall clock.
    pub async fn run(&self, dry_run: bool) -> Result<MaintenanceReport> {
        self.run_at(Utc::now(), dry_run).await
    }

    /// Run one cycle with a pinned logical clock. The scheduler and tests
    /// use this; decay math and retention cutoffs all derive from `now`.
    pub async fn run_at(&self, now: DateTime<Utc>, dry_run: bool) -> Result<MaintenanceReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(NisyanError::AlreadyRunning);
        }
        let _guard = CycleGuard(&self.running);

        // The cycle keeps the snapshot it started with; a config reload
        // takes effect on the next run.
        let config = self.config.snapshot();
        let deadline = Deadline::after(StdDuration::from_secs(
            config.maintenance.max_duration_seconds,
        ));
        let clock = Instant::now();
        let mut report = MaintenanceReport::started(now, dry_run);

        tracing::info!(dry_run, "maintenance cycle started");

        if let Err(e) = self
            .execute(config.as_ref(), now, deadline, dry_run, &mut report)
            .await
        {
            let err = NisyanError::Cycle(e.to_string());
            tracing::error!(error = %err, "maintenance cycle failed");
            report.errors.push(err.to_string());
            report.status = RunStatus::Failure;
        } else if report.deadline_hit {
            report.status = RunStatus::Partial;
        }

        report.duration_seconds = clock.elapsed().as_secs_f64();
        report.completed_at = Some(Utc::now());

        // Step 6: refresh gauges. Failures here degrade gracefully; they
        // must never flip a finished cycle to failure.
        if report.status != RunStatus::Failure && !dry_run {
            let window = self.metrics.take_classification_window();
            match health::aggregate(self.store.as_ref(), Some(report.summary()), window).await {
                Ok(snapshot) => self.metrics.refresh_gauges(&snapshot),
                Err(e) => {
                    tracing::warn!(error = %e, "gauge refresh failed after maintenance");
                }
            }
        }

        if !dry_run {
            self.metrics.record_maintenance_run(report.status.as_str());
            self.metrics
                .maintenance_duration
                .observe(report.duration_seconds);
        }

        tracing::info!(
            status = report.status.as_str(),
            classified = report.classified,
            decay_updated = report.decay_updated,
            transitions = report.transitions,
            soft_deleted = report.soft_deleted,
            purged = report.purged,
            failed_batches = report.failed_batches,
            "maintenance cycle finished"
        );

        match self.last_run.write() {
            Ok(mut guard) => *guard = Some(report.clone()),
            Err(poisoned) => *poisoned.into_inner() = Some(report.clone()),
        }
        Ok(report)
    }

    /// Steps 1–5. A `?` here means the driver itself is gone and the cycle
    /// is marked failure; per-batch errors inside a step are absorbed into
    /// the report instead.
    async fn execute(
        &self,
        config: &crate::config::NisyanConfig,
        now: DateTime<Utc>,
        deadline: Deadline,
        dry_run: bool,
        report: &mut MaintenanceReport,
    ) -> Result<()> {
        let store = self.store.as_ref();
        let updater = BatchedUpdater::new(store, config.maintenance.batch_size, deadline);

        // Step 1: classify nodes the ingest-time task missed.
        let pending = store.list_unclassified(MAX_CLASSIFY_PER_CYCLE).await?;
        if dry_run {
            report.classified = pending.len();
        } else {
            for chunk in pending.chunks(config.maintenance.classify_chunk_size.max(1)) {
                if deadline.expired() {
                    report.deadline_hit = true;
                    break;
                }
                for node in chunk {
                    let outcome = self
                        .classifier
                        .classify_and_store(store, node.uuid, &node.classification_text())
                        .await;
                    if outcome.status == ClassificationStatus::Success {
                        report.classified += 1;
                    }
                }
                tokio::task::yield_now().await;
            }
        }

        // Step 2: recompute decay for everything that can still decay.
        let scoring_ids = store.list_scoring_ids().await?;
        if dry_run {
            report.decay_updated = scoring_ids.len();
        } else {
            let outcome = updater
                .recalc_decay(&scoring_ids, config.decay.base_half_life_days, now)
                .await;
            report.decay_updated = outcome.processed;
            report.absorb(&outcome);
            self.metrics
                .decay_scores_updated
                .inc_by(outcome.processed as u64);
        }

        // Step 3: evaluate the state machine against one consistent
        // snapshot, taken before anything is applied. Nodes that were
        // already EXPIRED here are routed to the soft-delete step, so a
        // node never moves two steps in one cycle.
        let (snapshots, snap_outcome) = updater.snapshots(&scoring_ids, now).await;
        report.absorb(&snap_outcome);

        let mut changes: Vec<(Uuid, LifecycleState, LifecycleState)> = Vec::new();
        let mut to_soft_delete: Vec<Uuid> = Vec::new();
        for snap in &snapshots {
            match lifecycle::next_state(snap, &config.decay.thresholds) {
                Some(LifecycleState::SoftDeleted) => to_soft_delete.push(snap.uuid),
                Some(next) => changes.push((snap.uuid, snap.state, next)),
                None => {}
            }
        }

        if dry_run {
            report.transitions = changes.len();
            report.soft_deleted = to_soft_delete.len();
        } else {
            let metrics = Arc::clone(&self.metrics);
            let outcome = updater
                .run_batches("apply_transitions", &changes, |chunk| {
                    let metrics = Arc::clone(&metrics);
                    async move {
                        let pairs: Vec<(Uuid, LifecycleState)> =
                            chunk.iter().map(|(uuid, _, to)| (*uuid, *to)).collect();
                        let applied = store.apply_transitions(&pairs, now).await?;
                        for (_, from, to) in &chunk {
                            metrics.record_transition(*from, *to);
                        }
                        Ok(applied)
                    }
                })
                .await;
            report.transitions = outcome.processed;
            report.absorb(&outcome);

            // Step 4: soft-delete nodes that entered this cycle as EXPIRED.
            let metrics = Arc::clone(&self.metrics);
            let outcome = updater
                .run_batches("soft_delete", &to_soft_delete, |chunk| {
                    let metrics = Arc::clone(&metrics);
                    async move {
                        let deleted = store.soft_delete(&chunk, now).await?;
                        for _ in 0..deleted {
                            metrics.record_transition(
                                LifecycleState::Expired,
                                LifecycleState::SoftDeleted,
                            );
                        }
                        Ok(deleted)
                    }
                })
                .await;
            report.soft_deleted = outcome.processed;
            report.absorb(&outcome);
        }

        // Step 5: purge soft-deleted nodes past retention.
        let purgeable = store
            .list_purgeable(now, config.decay.retention.soft_delete_days)
            .await?;
        if dry_run {
            report.purged = purgeable.len();
        } else {
            let outcome = updater.purge(&purgeable).await;
            report.purged = outcome.processed;
            report.absorb(&outcome);
            self.metrics.memories_purged.inc_by(outcome.processed as u64);
        }

        Ok(())
    }
}

/// Upper bound on catch-up classification per cycle. The deadline is the
/// real limiter; this only caps the initial fetch.
const MAX_CLASSIFY_PER_CYCLE: usize = 10_000;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NisyanConfig;
    use crate::model::MemoryNode;
    use crate::storage::InMemoryStore;
    use chrono::Duration;

    fn runner_with(
        store: Arc<InMemoryStore>,
        mut config: NisyanConfig,
    ) -> MaintenanceRunner<InMemoryStore> {
        config.validate();
        let metrics = Arc::new(Metrics::new());
        let classifier = Arc::new(Classifier::new(None, Arc::clone(&metrics)));
        MaintenanceRunner::new(
            store,
            classifier,
            ConfigHandle::new(config, None),
            metrics,
        )
    }

    fn node_accessed_days_ago(name: &str, days: i64, now: DateTime<Utc>) -> MemoryNode {
        let mut node = MemoryNode::new(
            name.into(),
            format!("{name} summary"),
            None,
            now - Duration::days(days + 1),
        );
        node.last_accessed_at = Some(now - Duration::days(days));
        node.classified_at = Some(now); // keep the classify step quiet
        node
    }

    #[tokio::test]
    async fn test_permanent_promotion_and_zero_decay() {
        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        // Created a year ago, never accessed, top scores
        let mut node = MemoryNode::new("core".into(), "s".into(), None, now - Duration::days(365));
        node.importance = 5;
        node.stability = 5;
        node.classified_at = Some(now);
        let uuid = node.uuid;
        store.insert_node(&node).await.unwrap();

        let runner = runner_with(Arc::clone(&store), NisyanConfig::with_defaults());
        let report = runner.run_at(now, false).await.unwrap();

        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.transitions, 1);
        let read = store.get_node(uuid).await.unwrap();
        assert_eq!(read.state, LifecycleState::Permanent);
        assert_eq!(read.decay_score, 0.0);
    }

    #[tokio::test]
    async fn test_one_step_per_cycle() {
        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        // 300 days stale, low scores: decay lands ~0.75, past every gate,
        // but the node must only reach DORMANT this cycle.
        let mut node = node_accessed_days_ago("stale", 300, now);
        node.importance = 2;
        node.stability = 2;
        let uuid = node.uuid;
        store.insert_node(&node).await.unwrap();

        let runner = runner_with(Arc::clone(&store), NisyanConfig::with_defaults());
        runner.run_at(now, false).await.unwrap();
        assert_eq!(
            store.get_node(uuid).await.unwrap().state,
            LifecycleState::Dormant
        );

        // Subsequent cycles walk the rest of the path one step at a time
        runner.run_at(now, false).await.unwrap();
        assert_eq!(
            store.get_node(uuid).await.unwrap().state,
            LifecycleState::Archived
        );
        runner.run_at(now, false).await.unwrap();
        assert_eq!(
            store.get_node(uuid).await.unwrap().state,
            LifecycleState::Expired
        );
        runner.run_at(now, false).await.unwrap();
        let read = store.get_node(uuid).await.unwrap();
        assert_eq!(read.state, LifecycleState::SoftDeleted);
        assert_eq!(read.soft_deleted_at, Some(now));
    }

    #[tokio::test]
    async fn test_purges_past_retention() {
        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        let node = node_accessed_days_ago("gone", 10, now);
        let uuid = node.uuid;
        store.insert_node(&node).await.unwrap();
        store
            .soft_delete(&[uuid], now - Duration::days(95))
            .await
            .unwrap();

        let runner = runner_with(Arc::clone(&store), NisyanConfig::with_defaults());
        let report = runner.run_at(now, false).await.unwrap();

        assert_eq!(report.purged, 1);
        assert!(store.get_node(uuid).await.is_err());
    }

    #[tokio::test]
    async fn test_idempotent_on_frozen_clock() {
        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        for (name, days, importance, stability) in [
            ("fresh", 1, 3, 3),
            ("stale", 60, 2, 2),
            ("core", 365, 5, 5),
        ] {
            let mut node = node_accessed_days_ago(name, days, now);
            node.importance = importance;
            node.stability = stability;
            store.insert_node(&node).await.unwrap();
        }

        let runner = runner_with(Arc::clone(&store), NisyanConfig::with_defaults());
        runner.run_at(now, false).await.unwrap();
        let first: Vec<MemoryNode> = {
            let mut nodes = Vec::new();
            for id in store.list_scoring_ids().await.unwrap() {
                nodes.push(store.get_node(id).await.unwrap());
            }
            nodes
        };

        // Second cycle with the clock frozen: same snapshot in, same graph out
        runner.run_at(now, false).await.unwrap();
        for before in &first {
            let after = store.get_node(before.uuid).await.unwrap();
            assert_eq!(after.state, before.state, "{}", before.name);
            assert!(
                (after.decay_score - before.decay_score).abs() < 1e-12,
                "{}",
                before.name
            );
        }
    }

    #[tokio::test]
    async fn test_second_concurrent_cycle_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let runner = Arc::new(runner_with(Arc::clone(&store), NisyanConfig::with_defaults()));

        // Simulate an in-flight cycle holding the guard
        runner.running.store(true, Ordering::SeqCst);
        let result = runner.run(false).await;
        assert!(matches!(result, Err(NisyanError::AlreadyRunning)));
        runner.running.store(false, Ordering::SeqCst);

        // Released, so it runs fine again
        assert!(runner.run(false).await.is_ok());
    }

    #[tokio::test]
    async fn test_zero_duration_marks_partial() {
        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        let node = node_accessed_days_ago("n", 60, now);
        store.insert_node(&node).await.unwrap();

        let mut config = NisyanConfig::with_defaults();
        config.maintenance.max_duration_seconds = 0;
        // Bypass validate()'s repair of zero durations: hand-build the handle
        let metrics = Arc::new(Metrics::new());
        let classifier = Arc::new(Classifier::new(None, Arc::clone(&metrics)));
        let runner = MaintenanceRunner::new(
            Arc::clone(&store),
            classifier,
            ConfigHandle::new(config, None),
            metrics,
        );

        let report = runner.run_at(now, false).await.unwrap();
        assert_eq!(report.status, RunStatus::Partial);
        assert!(report.deadline_hit);
        // No half-applied writes: the node is exactly as ingested
        let read = store.get_node(node.uuid).await.unwrap();
        assert_eq!(read.state, LifecycleState::Active);
    }

    #[tokio::test]
    async fn test_dry_run_reports_without_writing() {
        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        let mut stale = node_accessed_days_ago("stale", 60, now);
        stale.importance = 2;
        stale.stability = 2;
        stale.decay_score = 0.5; // pre-set so the transition is visible to dry-run
        let uuid = stale.uuid;
        store.insert_node(&stale).await.unwrap();

        let runner = runner_with(Arc::clone(&store), NisyanConfig::with_defaults());
        let report = runner.run_at(now, true).await.unwrap();

        assert!(report.dry_run);
        assert_eq!(report.decay_updated, 1);
        assert_eq!(report.transitions, 1);
        // Nothing moved
        let read = store.get_node(uuid).await.unwrap();
        assert_eq!(read.state, LifecycleState::Active);
        assert!((read.decay_score - 0.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_unclassified_counted_in_dry_run() {
        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        let node = MemoryNode::new("pending".into(), "s".into(), None, now);
        store.insert_node(&node).await.unwrap();

        let runner = runner_with(Arc::clone(&store), NisyanConfig::with_defaults());
        let report = runner.run_at(now, true).await.unwrap();
        assert_eq!(report.classified, 1);
    }

    #[tokio::test]
    async fn test_last_report_retained() {
        let store = Arc::new(InMemoryStore::new());
        let runner = runner_with(Arc::clone(&store), NisyanConfig::with_defaults());
        assert!(runner.last_report().is_none());

        runner.run(false).await.unwrap();
        let report = runner.last_report().unwrap();
        assert_eq!(report.status, RunStatus::Success);
        assert!(report.completed_at.is_some());
    }
}
