mod cypher;
mod memory;

pub use cypher::{CypherStore, HttpRunner, QueryRunner};
pub use memory::InMemoryStore;

use std::collections::BTreeMap;
use std::future::Future;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::NisyanConfig;
use crate::error::{NisyanError, Result};
use crate::model::{Episode, FactEdge, LifecycleState, MemoryNode, NodeSnapshot};

/// Aggregate view of the graph's scoring attributes, read in a single pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphStats {
    pub counts: BTreeMap<LifecycleState, u64>,
    /// Live memories: everything except SOFT_DELETED.
    pub total_excluding_deleted: u64,
    pub avg_decay_score: f64,
    pub avg_importance: f64,
    pub avg_stability: f64,
}

/// Abstract storage driver for the memory graph.
///
/// The graph engine owns node existence and embeddings; this trait covers
/// only the scoring/lifecycle attributes this subsystem owns, plus the
/// read surfaces the RPC layer needs. The primary implementation composes
/// graph queries over an HTTP session ([`CypherStore`]); [`InMemoryStore`]
/// backs tests and single-process deployments.
pub trait GraphStore: Send + Sync {
    // -- Ingest & single-node access --

    fn insert_node(&self, node: &MemoryNode) -> impl Future<Output = Result<()>> + Send;

    fn get_node(&self, uuid: Uuid) -> impl Future<Output = Result<MemoryNode>> + Send;

    /// Record an access: bump `access_count`, advance `last_accessed_at`
    /// monotonically, and revive DORMANT/ARCHIVED nodes to ACTIVE.
    fn touch(&self, uuid: Uuid, now: DateTime<Utc>) -> impl Future<Output = Result<()>> + Send;

    fn touch_batch(
        &self,
        uuids: &[Uuid],
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<()>> + Send;

    // -- Classification --

    fn set_scores(
        &self,
        uuid: Uuid,
        importance: u8,
        stability: u8,
        classified_at: Option<DateTime<Utc>>,
    ) -> impl Future<Output = Result<()>> + Send;

    fn list_unclassified(&self, limit: usize)
        -> impl Future<Output = Result<Vec<MemoryNode>>> + Send;

    // -- Maintenance passes --

    /// Ids of nodes subject to decay recomputation and transition
    /// evaluation: everything except PERMANENT and SOFT_DELETED.
    fn list_scoring_ids(&self) -> impl Future<Output = Result<Vec<Uuid>>> + Send;

    /// Recompute and persist decay scores for one batch.
    fn recalc_decay(
        &self,
        uuids: &[Uuid],
        base_half_life_days: f64,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<usize>> + Send;

    /// Read the state-machine inputs for one batch as a consistent snapshot.
    fn snapshots(
        &self,
        uuids: &[Uuid],
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<NodeSnapshot>>> + Send;

    /// Apply state changes. PERMANENT targets get `decay_score = 0`.
    fn apply_transitions(
        &self,
        changes: &[(Uuid, LifecycleState)],
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<usize>> + Send;

    /// Mark nodes SOFT_DELETED with `soft_deleted_at = now`.
    fn soft_delete(
        &self,
        uuids: &[Uuid],
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<usize>> + Send;

    fn list_purgeable(
        &self,
        now: DateTime<Utc>,
        retention_days: u32,
    ) -> impl Future<Output = Result<Vec<Uuid>>> + Send;

    /// Hard-delete nodes from the graph.
    fn purge(&self, uuids: &[Uuid]) -> impl Future<Output = Result<usize>> + Send;

    /// SOFT_DELETED → ARCHIVED restoration within the retention window.
    fn recover(
        &self,
        uuid: Uuid,
        now: DateTime<Utc>,
        retention_days: u32,
    ) -> impl Future<Output = Result<MemoryNode>> + Send;

    // -- Retrieval --

    /// Engine-side semantic search; returns (node, semantic score) pairs in
    /// the engine's order. Lifecycle filtering happens in the re-ranker.
    fn search_nodes(
        &self,
        query: &str,
        limit: usize,
        group_ids: Option<&[String]>,
    ) -> impl Future<Output = Result<Vec<(MemoryNode, f64)>>> + Send;

    fn search_facts(
        &self,
        query: &str,
        limit: usize,
        group_ids: Option<&[String]>,
    ) -> impl Future<Output = Result<Vec<FactEdge>>> + Send;

    fn record_episode(&self, episode: &Episode) -> impl Future<Output = Result<()>> + Send;

    fn recent_episodes(
        &self,
        limit: usize,
        group_id: Option<&str>,
    ) -> impl Future<Output = Result<Vec<Episode>>> + Send;

    // -- Aggregation & admin --

    fn stats(&self) -> impl Future<Output = Result<GraphStats>> + Send;

    /// Destructive: remove every node, episode and fact.
    fn clear(&self) -> impl Future<Output = Result<()>> + Send;
}

/// Concrete backend selected from configuration.
pub enum Graph {
    Memory(InMemoryStore),
    Http(CypherStore<HttpRunner>),
}

impl Graph {
    pub fn from_config(config: &NisyanConfig) -> Result<Self> {
        match config.graph.backend.as_str() {
            "memory" => Ok(Self::Memory(InMemoryStore::new())),
            "http" => {
                let runner = HttpRunner::new(&config.graph.url, config.graph.port)?;
                Ok(Self::Http(CypherStore::new(runner)))
            }
            other => Err(NisyanError::Config(format!(
                "unknown graph backend: {other}"
            ))),
        }
    }
}

macro_rules! delegate {
    ($self:ident, $store:ident => $call:expr) => {
        match $self {
            Graph::Memory($store) => $call.await,
            Graph::Http($store) => $call.await,
        }
    };
}

impl GraphStore for Graph {
    async fn insert_node(&self, node: &MemoryNode) -> Result<()> {
        delegate!(self, s => s.insert_node(node))
    }

    async fn get_node(&self, uuid: Uuid) -> Result<MemoryNode> {
        delegate!(self, s => s.get_node(uuid))
    }

    async fn touch(&self, uuid: Uuid, now: DateTime<Utc>) -> Result<()> {
        delegate!(self, s => s.touch(uuid, now))
    }

    async fn touch_batch(&self, uuids: &[Uuid], now: DateTime<Utc>) -> Result<()> {
        delegate!(self, s => s.touch_batch(uuids, now))
    }

    async fn set_scores(
        &self,
        uuid: Uuid,
        importance: u8,
        stability: u8,
        classified_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        delegate!(self, s => s.set_scores(uuid, importance, stability, classified_at))
    }

    async fn list_unclassified(&self, limit: usize) -> Result<Vec<MemoryNode>> {
        delegate!(self, s => s.list_unclassified(limit))
    }

    async fn list_scoring_ids(&self) -> Result<Vec<Uuid>> {
        delegate!(self, s => s.list_scoring_ids())
    }

    async fn recalc_decay(
        &self,
        uuids: &[Uuid],
        base_half_life_days: f64,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        delegate!(self, s => s.recalc_decay(uuids, base_half_life_days, now))
    }

    async fn snapshots(&self, uuids: &[Uuid], now: DateTime<Utc>) -> Result<Vec<NodeSnapshot>> {
        delegate!(self, s => s.snapshots(uuids, now))
    }

    async fn apply_transitions(
        &self,
        changes: &[(Uuid, LifecycleState)],
        now: DateTime<Utc>,
    ) -> Result<usize> {
        delegate!(self, s => s.apply_transitions(changes, now))
    }

    async fn soft_delete(&self, uuids: &[Uuid], now: DateTime<Utc>) -> Result<usize> {
        delegate!(self, s => s.soft_delete(uuids, now))
    }

    async fn list_purgeable(&self, now: DateTime<Utc>, retention_days: u32) -> Result<Vec<Uuid>> {
        delegate!(self, s => s.list_purgeable(now, retention_days))
    }

    async fn purge(&self, uuids: &[Uuid]) -> Result<usize> {
        delegate!(self, s => s.purge(uuids))
    }

    async fn recover(
        &self,
        uuid: Uuid,
        now: DateTime<Utc>,
        retention_days: u32,
    ) -> Result<MemoryNode> {
        delegate!(self, s => s.recover(uuid, now, retention_days))
    }

    async fn search_nodes(
        &self,
        query: &str,
        limit: usize,
        group_ids: Option<&[String]>,
    ) -> Result<Vec<(MemoryNode, f64)>> {
        delegate!(self, s => s.search_nodes(query, limit, group_ids))
    }

    async fn search_facts(
        &self,
        query: &str,
        limit: usize,
        group_ids: Option<&[String]>,
    ) -> Result<Vec<FactEdge>> {
        delegate!(self, s => s.search_facts(query, limit, group_ids))
    }

    async fn record_episode(&self, episode: &Episode) -> Result<()> {
        delegate!(self, s => s.record_episode(episode))
    }

    async fn recent_episodes(&self, limit: usize, group_id: Option<&str>) -> Result<Vec<Episode>> {
        delegate!(self, s => s.recent_episodes(limit, group_id))
    }

    async fn stats(&self) -> Result<GraphStats> {
        delegate!(self, s => s.stats())
    }

    async fn clear(&self) -> Result<()> {
        delegate!(self, s => s.clear())
    }
}
