//! Chunked, time-bounded write passes against the graph store.
//!
//! Every maintenance step that writes goes through [`BatchedUpdater`]:
//! work is split into `batch_size` chunks, the cycle deadline is checked
//! between chunks (the in-flight chunk always completes, so no batch is
//! left half-applied), and a failed chunk is logged with its index and
//! skipped; the remaining chunks still run. Partial progress is an
//! acceptable outcome; the next cycle picks up whatever was missed.

use std::future::Future;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::LifecycleState;
use crate::storage::GraphStore;

/// Cycle-wide deadline. Copyable so every step can carry it.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(duration: Duration) -> Self {
        Self {
            at: Instant::now() + duration,
        }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }
}

/// What a single pass accomplished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepOutcome {
    /// Rows the store reports as written.
    pub processed: usize,
    /// Chunks that errored and were skipped.
    pub failed_batches: usize,
    /// The deadline fired and remaining chunks were deferred.
    pub hit_deadline: bool,
}

pub struct BatchedUpdater<'a, S> {
    store: &'a S,
    batch_size: usize,
    deadline: Deadline,
}

impl<'a, S: GraphStore> BatchedUpdater<'a, S> {
    pub fn new(store: &'a S, batch_size: usize, deadline: Deadline) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            deadline,
        }
    }

    /// Drive `op` over `items` in chunks. The op receives an owned chunk
    /// and returns how many rows it wrote.
    pub async fn run_batches<T, F, Fut>(
        &self,
        step: &'static str,
        items: &[T],
        mut op: F,
    ) -> StepOutcome
    where
        T: Clone,
        F: FnMut(Vec<T>) -> Fut,
        Fut: Future<Output = crate::error::Result<usize>>,
    {
        let mut outcome = StepOutcome::default();
        for (index, chunk) in items.chunks(self.batch_size).enumerate() {
            if self.deadline.expired() {
                tracing::info!(
                    step,
                    remaining = items.len() - index * self.batch_size,
                    "cycle deadline reached, deferring remaining batches"
                );
                outcome.hit_deadline = true;
                break;
            }
            match op(chunk.to_vec()).await {
                Ok(written) => outcome.processed += written,
                Err(e) => {
                    let err = crate::error::NisyanError::Batch {
                        index,
                        message: e.to_string(),
                    };
                    outcome.failed_batches += 1;
                    tracing::warn!(step, error = %err, "continuing with next batch");
                }
            }
            // Cooperative yield between chunks so ingest and search stay live.
            tokio::task::yield_now().await;
        }
        outcome
    }

    pub async fn recalc_decay(
        &self,
        uuids: &[Uuid],
        base_half_life_days: f64,
        now: DateTime<Utc>,
    ) -> StepOutcome {
        let store = self.store;
        self.run_batches("recalc_decay", uuids, |chunk| async move {
            store.recalc_decay(&chunk, base_half_life_days, now).await
        })
        .await
    }

    pub async fn soft_delete(&self, uuids: &[Uuid], now: DateTime<Utc>) -> StepOutcome {
        let store = self.store;
        self.run_batches("soft_delete", uuids, |chunk| async move {
            store.soft_delete(&chunk, now).await
        })
        .await
    }

    pub async fn purge(&self, uuids: &[Uuid]) -> StepOutcome {
        let store = self.store;
        self.run_batches("purge", uuids, |chunk| async move {
            store.purge(&chunk).await
        })
        .await
    }

    pub async fn apply_transitions(
        &self,
        changes: &[(Uuid, LifecycleState)],
        now: DateTime<Utc>,
    ) -> StepOutcome {
        let store = self.store;
        self.run_batches("apply_transitions", changes, |chunk| async move {
            store.apply_transitions(&chunk, now).await
        })
        .await
    }

    /// Batched snapshot read for the transition step. Reads are chunked
    /// like writes so a huge graph cannot blow one round trip.
    pub async fn snapshots(
        &self,
        uuids: &[Uuid],
        now: DateTime<Utc>,
    ) -> (Vec<crate::model::NodeSnapshot>, StepOutcome) {
        let mut all = Vec::with_capacity(uuids.len());
        let mut outcome = StepOutcome::default();
        for (index, chunk) in uuids.chunks(self.batch_size).enumerate() {
            if self.deadline.expired() {
                outcome.hit_deadline = true;
                break;
            }
            match self.store.snapshots(chunk, now).await {
                Ok(mut snaps) => all.append(&mut snaps),
                Err(e) => {
                    outcome.failed_batches += 1;
                    tracing::warn!(step = "snapshots", batch = index, error = %e, "batch failed, continuing with next");
                }
            }
            tokio::task::yield_now().await;
        }
        outcome.processed = all.len();
        (all, outcome)
    }
}
