//! Importance/stability classification.
//!
//! Every memory carries two LLM-assigned scores: importance (1 = trivial,
//! 5 = core identity) and stability (1 = volatile, 5 = permanent fact).
//! Nodes are ingested with neutral `(3, 3)` scores and a null
//! `classified_at`; the classifier revises them either right after ingest
//! (fire-and-forget task) or during the maintenance catch-up pass.
//!
//! The LLM is optional at every level: a missing client, an unreachable
//! endpoint, or an unparseable reply all degrade to the neutral defaults
//! with `classified_at` left null, so the node is retried on a later cycle.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use uuid::Uuid;

use crate::llm::LlmClient;
use crate::metrics::Metrics;
use crate::model::{DEFAULT_IMPORTANCE, DEFAULT_STABILITY};
use crate::storage::GraphStore;

/// Scoring instructions. Exemplars pin the corners of both scales; they are
/// tuning, not contract; the reply format is the contract.
pub const CLASSIFY_SYSTEM_PROMPT: &str = "\
You rate memories for an agent's long-term knowledge graph.

Rate the following memory on two 1-5 scales: importance (1=trivial, 5=core \
identity/long-term) and stability (1=volatile, 5=permanent fact). Reply with \
exactly two integers, importance first.

Examples:
memory: \"User's name is Amara\" -> 5 5
memory: \"User is debugging a flaky CI job today\" -> 2 1
memory: \"User prefers tabs over spaces\" -> 3 4
memory: \"Lunch order was a falafel wrap\" -> 1 1";

/// How a classification was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassificationStatus {
    /// Scores came from the LLM and should be persisted with `classified_at`.
    Success,
    /// LLM missing, unreachable, or unparseable; neutral defaults apply and
    /// the node stays eligible for retry.
    Fallback,
}

#[derive(Debug, Clone, Copy)]
pub struct Classification {
    pub importance: u8,
    pub stability: u8,
    pub status: ClassificationStatus,
}

impl Classification {
    fn fallback() -> Self {
        Self {
            importance: DEFAULT_IMPORTANCE,
            stability: DEFAULT_STABILITY,
            status: ClassificationStatus::Fallback,
        }
    }
}

/// Scan a reply for the first two integers in 1..=5, importance first.
/// Tolerates prose around the numbers but not missing or out-of-range ones.
pub fn parse_scores(text: &str) -> Option<(u8, u8)> {
    let mut found = Vec::with_capacity(2);
    for token in text.split(|c: char| !c.is_ascii_digit()) {
        if token.is_empty() {
            continue;
        }
        let value: u32 = token.parse().ok()?;
        if !(1..=5).contains(&value) {
            return None;
        }
        found.push(value as u8);
        if found.len() == 2 {
            return Some((found[0], found[1]));
        }
    }
    None
}

pub struct Classifier {
    llm: Option<Arc<LlmClient>>,
    metrics: Arc<Metrics>,
}

impl Classifier {
    /// The client is injected explicitly; a `None` here is survivable but
    /// worth one loud log line, because every score will be a neutral
    /// fallback until a client is wired in.
    pub fn new(llm: Option<Arc<LlmClient>>, metrics: Arc<Metrics>) -> Self {
        if llm.is_none() {
            tracing::warn!(
                "classifier constructed without an LLM client; \
                 all scores fall back to neutral (3, 3)"
            );
        }
        Self { llm, metrics }
    }

    /// Classify one summary. Never fails; degraded outcomes are encoded in
    /// the returned status and counted on the metrics registry.
    pub async fn classify(&self, summary: &str) -> Classification {
        let Some(llm) = &self.llm else {
            self.metrics.record_classification("fallback");
            return Classification::fallback();
        };

        let started = Instant::now();
        let reply = llm.complete(summary, CLASSIFY_SYSTEM_PROMPT).await;
        self.metrics
            .classification_duration
            .observe(started.elapsed().as_secs_f64());

        match reply {
            Ok(text) => match parse_scores(&text) {
                Some((importance, stability)) => {
                    self.metrics.record_classification("success");
                    Classification {
                        importance,
                        stability,
                        status: ClassificationStatus::Success,
                    }
                }
                None => {
                    tracing::warn!(reply = %text.trim(), "unparseable classifier reply, using neutral defaults");
                    self.metrics.record_classification("fallback");
                    Classification::fallback()
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "LLM classification failed, using neutral defaults");
                self.metrics.record_classification("fallback");
                Classification::fallback()
            }
        }
    }

    /// Classify a node and persist the result.
    ///
    /// Successful scores are written together with `classified_at`.
    /// Fallback leaves the node untouched; it already carries the neutral
    /// defaults from ingest and must stay selectable for the next catch-up
    /// pass.
    pub async fn classify_and_store<S: GraphStore>(
        &self,
        store: &S,
        uuid: Uuid,
        summary: &str,
    ) -> Classification {
        let classification = self.classify(summary).await;
        if classification.status == ClassificationStatus::Success {
            if let Err(e) = store
                .set_scores(
                    uuid,
                    classification.importance,
                    classification.stability,
                    Some(Utc::now()),
                )
                .await
            {
                tracing::warn!(uuid = %uuid, error = %e, "failed to persist classification");
                self.metrics.record_classification("error");
            }
        }
        classification
    }

    /// Fire-and-forget path used right after ingest. The caller returns
    /// immediately; errors are logged and never propagate.
    pub fn spawn_classify<S: GraphStore + 'static>(
        self: &Arc<Self>,
        store: Arc<S>,
        uuid: Uuid,
        summary: String,
    ) {
        let classifier = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = classifier
                .classify_and_store(store.as_ref(), uuid, &summary)
                .await;
            tracing::debug!(uuid = %uuid, status = ?outcome.status, "background classification finished");
        });
    }
}
