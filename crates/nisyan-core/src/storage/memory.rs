use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::decay;
use crate::error::{NisyanError, Result};
use crate::model::{in_groups, Episode, FactEdge, LifecycleState, MemoryNode, NodeSnapshot};
use crate::recovery::within_retention;
use crate::storage::{GraphStats, GraphStore};

/// Embedded graph store.
///
/// Backs tests and single-process deployments; the semantics match
/// [`CypherStore`](super::CypherStore) against a real engine, with keyword
/// overlap standing in for the engine's semantic scores.
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<State>,
}

#[derive(Default)]
struct State {
    nodes: HashMap<Uuid, MemoryNode>,
    episodes: Vec<Episode>,
    facts: Vec<FactEdge>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seed a fact edge. Fact edges are created by the host engine's
    /// extraction pipeline, so the trait has no write path for them; this
    /// exists for tests and embedded deployments.
    pub fn record_fact(&self, fact: FactEdge) {
        self.write().facts.push(fact);
    }
}

/// Fraction of query terms found in the haystack, case-insensitive.
/// Stands in for the engine's semantic score in the embedded backend.
fn keyword_score(query: &str, haystack: &str) -> f64 {
    let terms: Vec<&str> = query.split_whitespace().collect();
    if terms.is_empty() {
        return 0.0;
    }
    let haystack = haystack.to_lowercase();
    let matched = terms
        .iter()
        .filter(|t| haystack.contains(&t.to_lowercase()))
        .count();
    matched as f64 / terms.len() as f64
}

impl GraphStore for InMemoryStore {
    async fn insert_node(&self, node: &MemoryNode) -> Result<()> {
        self.write().nodes.insert(node.uuid, node.clone());
        Ok(())
    }

    async fn get_node(&self, uuid: Uuid) -> Result<MemoryNode> {
        self.read()
            .nodes
            .get(&uuid)
            .cloned()
            .ok_or_else(|| NisyanError::NotFound(format!("memory {uuid}")))
    }

    async fn touch(&self, uuid: Uuid, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.write();
        let node = state
            .nodes
            .get_mut(&uuid)
            .ok_or_else(|| NisyanError::NotFound(format!("memory {uuid}")))?;

        // Monotonic under concurrent callers: the timestamp never moves
        // backwards and the counter only grows.
        node.last_accessed_at = Some(match node.last_accessed_at {
            Some(prev) if prev > now => prev,
            _ => now,
        });
        node.access_count += 1;
        if matches!(
            node.state,
            LifecycleState::Dormant | LifecycleState::Archived
        ) {
            node.state = LifecycleState::Active;
        }
        Ok(())
    }

    async fn touch_batch(&self, uuids: &[Uuid], now: DateTime<Utc>) -> Result<()> {
        for uuid in uuids {
            // Missing nodes are skipped, not fatal: the batch form backs the
            // search path, which races with purges.
            if let Err(NisyanError::NotFound(_)) = self.touch(*uuid, now).await {
                continue;
            }
        }
        Ok(())
    }

    async fn set_scores(
        &self,
        uuid: Uuid,
        importance: u8,
        stability: u8,
        classified_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        crate::model::validate_score("importance", importance)?;
        crate::model::validate_score("stability", stability)?;
        let mut state = self.write();
        let node = state
            .nodes
            .get_mut(&uuid)
            .ok_or_else(|| NisyanError::NotFound(format!("memory {uuid}")))?;
        node.importance = importance;
        node.stability = stability;
        node.classified_at = classified_at;
        Ok(())
    }

    async fn list_unclassified(&self, limit: usize) -> Result<Vec<MemoryNode>> {
        let state = self.read();
        let mut pending: Vec<MemoryNode> = state
            .nodes
            .values()
            .filter(|n| n.classified_at.is_none() && n.state != LifecycleState::SoftDeleted)
            .cloned()
            .collect();
        pending.sort_by_key(|n| n.created_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn list_scoring_ids(&self) -> Result<Vec<Uuid>> {
        let state = self.read();
        let mut ids: Vec<Uuid> = state
            .nodes
            .values()
            .filter(|n| {
                !matches!(
                    n.state,
                    LifecycleState::Permanent | LifecycleState::SoftDeleted
                )
            })
            .map(|n| n.uuid)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn recalc_decay(
        &self,
        uuids: &[Uuid],
        base_half_life_days: f64,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut state = self.write();
        let mut updated = 0;
        for uuid in uuids {
            let Some(node) = state.nodes.get_mut(uuid) else {
                continue;
            };
            if matches!(
                node.state,
                LifecycleState::Permanent | LifecycleState::SoftDeleted
            ) {
                continue;
            }
            let days =
                decay::days_since_access(now, node.last_accessed_at, Some(node.created_at));
            node.decay_score =
                decay::decay_score(base_half_life_days, node.importance, node.stability, days);
            updated += 1;
        }
        Ok(updated)
    }

    async fn snapshots(&self, uuids: &[Uuid], now: DateTime<Utc>) -> Result<Vec<NodeSnapshot>> {
        let state = self.read();
        Ok(uuids
            .iter()
            .filter_map(|uuid| state.nodes.get(uuid))
            .map(|node| NodeSnapshot {
                uuid: node.uuid,
                state: node.state,
                decay_score: node.decay_score,
                days_since_access: decay::days_since_access(
                    now,
                    node.last_accessed_at,
                    Some(node.created_at),
                ),
                importance: node.importance,
                stability: node.stability,
            })
            .collect())
    }

    async fn apply_transitions(
        &self,
        changes: &[(Uuid, LifecycleState)],
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut state = self.write();
        let mut applied = 0;
        for (uuid, next) in changes {
            let Some(node) = state.nodes.get_mut(uuid) else {
                continue;
            };
            node.state = *next;
            match next {
                LifecycleState::Permanent => node.decay_score = 0.0,
                LifecycleState::SoftDeleted => node.soft_deleted_at = Some(now),
                _ => {}
            }
            applied += 1;
        }
        Ok(applied)
    }

    async fn soft_delete(&self, uuids: &[Uuid], now: DateTime<Utc>) -> Result<usize> {
        let mut state = self.write();
        let mut deleted = 0;
        for uuid in uuids {
            let Some(node) = state.nodes.get_mut(uuid) else {
                continue;
            };
            if node.state == LifecycleState::SoftDeleted {
                continue;
            }
            node.state = LifecycleState::SoftDeleted;
            node.soft_deleted_at = Some(now);
            deleted += 1;
        }
        Ok(deleted)
    }

    async fn list_purgeable(&self, now: DateTime<Utc>, retention_days: u32) -> Result<Vec<Uuid>> {
        let state = self.read();
        let mut ids: Vec<Uuid> = state
            .nodes
            .values()
            .filter(|n| {
                n.state == LifecycleState::SoftDeleted
                    && n.soft_deleted_at
                        .is_some_and(|ts| !within_retention(ts, now, retention_days))
            })
            .map(|n| n.uuid)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn purge(&self, uuids: &[Uuid]) -> Result<usize> {
        let mut state = self.write();
        let mut purged = 0;
        for uuid in uuids {
            if state.nodes.remove(uuid).is_some() {
                purged += 1;
            }
        }
        let State { nodes, facts, .. } = &mut *state;
        facts.retain(|f| nodes.contains_key(&f.source_uuid) && nodes.contains_key(&f.target_uuid));
        Ok(purged)
    }

    async fn recover(
        &self,
        uuid: Uuid,
        now: DateTime<Utc>,
        retention_days: u32,
    ) -> Result<MemoryNode> {
        let mut state = self.write();
        let node = state
            .nodes
            .get_mut(&uuid)
            .ok_or_else(|| NisyanError::NotFound(format!("memory {uuid}")))?;

        if node.state != LifecycleState::SoftDeleted {
            return Err(NisyanError::NotRecoverable(format!(
                "memory {uuid} is {}, not SOFT_DELETED",
                node.state
            )));
        }
        let deleted_at = node.soft_deleted_at.ok_or_else(|| {
            NisyanError::Storage(format!("memory {uuid} soft-deleted without timestamp"))
        })?;
        if !within_retention(deleted_at, now, retention_days) {
            return Err(NisyanError::NotRecoverable(format!(
                "memory {uuid} passed the {retention_days}-day recovery window"
            )));
        }

        node.state = LifecycleState::Archived;
        node.soft_deleted_at = None;
        node.last_accessed_at = Some(now);
        Ok(node.clone())
    }

    async fn search_nodes(
        &self,
        query: &str,
        limit: usize,
        group_ids: Option<&[String]>,
    ) -> Result<Vec<(MemoryNode, f64)>> {
        let state = self.read();
        let mut hits: Vec<(MemoryNode, f64)> = state
            .nodes
            .values()
            .filter(|n| in_groups(&n.group_id, group_ids))
            .filter_map(|n| {
                let score = keyword_score(query, &format!("{} {}", n.name, n.summary));
                (score > 0.0).then(|| (n.clone(), score))
            })
            .collect();
        hits.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn search_facts(
        &self,
        query: &str,
        limit: usize,
        group_ids: Option<&[String]>,
    ) -> Result<Vec<FactEdge>> {
        let state = self.read();
        let mut hits: Vec<(FactEdge, f64)> = state
            .facts
            .iter()
            .filter(|f| in_groups(&f.group_id, group_ids))
            .filter_map(|f| {
                let score = keyword_score(query, &format!("{} {}", f.predicate, f.fact));
                (score > 0.0).then(|| (f.clone(), score))
            })
            .collect();
        hits.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits.into_iter().map(|(f, _)| f).collect())
    }

    async fn record_episode(&self, episode: &Episode) -> Result<()> {
        self.write().episodes.push(episode.clone());
        Ok(())
    }

    async fn recent_episodes(&self, limit: usize, group_id: Option<&str>) -> Result<Vec<Episode>> {
        let state = self.read();
        let mut episodes: Vec<Episode> = state
            .episodes
            .iter()
            .filter(|e| match group_id {
                Some(g) => e.group_id.as_deref() == Some(g),
                None => true,
            })
            .cloned()
            .collect();
        episodes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        episodes.truncate(limit);
        Ok(episodes)
    }

    async fn stats(&self) -> Result<GraphStats> {
        let state = self.read();
        let mut stats = GraphStats::default();
        let mut live = 0u64;
        let mut sum_decay = 0.0;
        let mut sum_importance = 0.0;
        let mut sum_stability = 0.0;

        for node in state.nodes.values() {
            *stats.counts.entry(node.state).or_insert(0) += 1;
            if node.state != LifecycleState::SoftDeleted {
                live += 1;
                sum_decay += node.decay_score;
                sum_importance += f64::from(node.importance);
                sum_stability += f64::from(node.stability);
            }
        }

        stats.total_excluding_deleted = live;
        if live > 0 {
            stats.avg_decay_score = sum_decay / live as f64;
            stats.avg_importance = sum_importance / live as f64;
            stats.avg_stability = sum_stability / live as f64;
        }
        Ok(stats)
    }

    async fn clear(&self) -> Result<()> {
        let mut state = self.write();
        state.nodes.clear();
        state.episodes.clear();
        state.facts.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn node_at(name: &str, now: DateTime<Utc>) -> MemoryNode {
        MemoryNode::new(name.into(), format!("{name} summary"), None, now)
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let node = node_at("alpha", now);
        let uuid = node.uuid;
        store.insert_node(&node).await.unwrap();
        let read = store.get_node(uuid).await.unwrap();
        assert_eq!(read.name, "alpha");
        assert_eq!(read.state, LifecycleState::Active);
    }

    #[tokio::test]
    async fn test_touch_bumps_and_is_monotonic() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let node = node_at("alpha", now);
        let uuid = node.uuid;
        store.insert_node(&node).await.unwrap();

        store.touch(uuid, now).await.unwrap();
        let after = store.get_node(uuid).await.unwrap();
        assert_eq!(after.access_count, 1);
        assert_eq!(after.last_accessed_at, Some(now));

        // An out-of-order touch with an older timestamp must not move the
        // clock backwards, but still counts the access.
        store.touch(uuid, now - Duration::hours(1)).await.unwrap();
        let after = store.get_node(uuid).await.unwrap();
        assert_eq!(after.access_count, 2);
        assert_eq!(after.last_accessed_at, Some(now));
    }

    #[tokio::test]
    async fn test_touch_revives_dormant_and_archived() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        for state in [LifecycleState::Dormant, LifecycleState::Archived] {
            let mut node = node_at("sleeper", now);
            node.state = state;
            let uuid = node.uuid;
            store.insert_node(&node).await.unwrap();
            store.touch(uuid, now).await.unwrap();
            assert_eq!(
                store.get_node(uuid).await.unwrap().state,
                LifecycleState::Active
            );
        }
    }

    #[tokio::test]
    async fn test_set_scores_roundtrip() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let node = node_at("alpha", now);
        let uuid = node.uuid;
        store.insert_node(&node).await.unwrap();

        store.set_scores(uuid, 4, 5, Some(now)).await.unwrap();
        let read = store.get_node(uuid).await.unwrap();
        assert_eq!((read.importance, read.stability), (4, 5));
        assert_eq!(read.classified_at, Some(now));
    }

    #[tokio::test]
    async fn test_list_unclassified_skips_classified_and_deleted() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let pending = node_at("pending", now);
        let mut scored = node_at("scored", now);
        scored.classified_at = Some(now);
        let deleted = node_at("deleted", now);
        let deleted_id = deleted.uuid;
        store.insert_node(&pending).await.unwrap();
        store.insert_node(&scored).await.unwrap();
        store.insert_node(&deleted).await.unwrap();
        store.soft_delete(&[deleted_id], now).await.unwrap();

        let unclassified = store.list_unclassified(10).await.unwrap();
        assert_eq!(unclassified.len(), 1);
        assert_eq!(unclassified[0].name, "pending");
    }

    #[tokio::test]
    async fn test_list_scoring_ids_excludes_permanent_and_deleted() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let active = node_at("active", now);
        let mut permanent = node_at("permanent", now);
        permanent.state = LifecycleState::Permanent;
        let deleted = node_at("deleted", now);
        let (active_id, deleted_id) = (active.uuid, deleted.uuid);
        store.insert_node(&active).await.unwrap();
        store.insert_node(&permanent).await.unwrap();
        store.insert_node(&deleted).await.unwrap();
        store.soft_delete(&[deleted_id], now).await.unwrap();

        let ids = store.list_scoring_ids().await.unwrap();
        assert_eq!(ids, vec![active_id]);
    }

    #[tokio::test]
    async fn test_recalc_decay_uses_three_way_fallback() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        // Never accessed, so decay anchors on created_at
        let mut node = node_at("alpha", now - Duration::days(2));
        node.last_accessed_at = None;
        let uuid = node.uuid;
        store.insert_node(&node).await.unwrap();

        let updated = store.recalc_decay(&[uuid], 180.0, now).await.unwrap();
        assert_eq!(updated, 1);
        let read = store.get_node(uuid).await.unwrap();
        assert!((read.decay_score - 0.0046).abs() < 0.0005);
    }

    #[tokio::test]
    async fn test_recalc_decay_skips_permanent() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let mut node = node_at("core", now - Duration::days(365));
        node.state = LifecycleState::Permanent;
        let uuid = node.uuid;
        store.insert_node(&node).await.unwrap();

        let updated = store.recalc_decay(&[uuid], 180.0, now).await.unwrap();
        assert_eq!(updated, 0);
        assert_eq!(store.get_node(uuid).await.unwrap().decay_score, 0.0);
    }

    #[tokio::test]
    async fn test_apply_transitions_permanent_zeroes_decay() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let mut node = node_at("core", now);
        node.decay_score = 0.4;
        let uuid = node.uuid;
        store.insert_node(&node).await.unwrap();

        store
            .apply_transitions(&[(uuid, LifecycleState::Permanent)], now)
            .await
            .unwrap();
        let read = store.get_node(uuid).await.unwrap();
        assert_eq!(read.state, LifecycleState::Permanent);
        assert_eq!(read.decay_score, 0.0);
    }

    #[tokio::test]
    async fn test_soft_delete_sets_timestamp_once() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let node = node_at("gone", now);
        let uuid = node.uuid;
        store.insert_node(&node).await.unwrap();

        assert_eq!(store.soft_delete(&[uuid], now).await.unwrap(), 1);
        // Second call is a no-op, not a timestamp reset
        let later = now + Duration::days(1);
        assert_eq!(store.soft_delete(&[uuid], later).await.unwrap(), 0);
        let read = store.get_node(uuid).await.unwrap();
        assert_eq!(read.soft_deleted_at, Some(now));
    }

    #[tokio::test]
    async fn test_search_nodes_scores_and_groups() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let mut a = node_at("rust borrow checker", now);
        a.group_id = Some("work".into());
        let b = node_at("gardening tips", now);
        store.insert_node(&a).await.unwrap();
        store.insert_node(&b).await.unwrap();

        let hits = store.search_nodes("rust", 10, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.name, "rust borrow checker");

        let filter = vec!["other".to_string()];
        let hits = store.search_nodes("rust", 10, Some(&filter)).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_episodes_recent_first() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        for (i, name) in ["first", "second", "third"].iter().enumerate() {
            store
                .record_episode(&Episode {
                    uuid: Uuid::now_v7(),
                    name: name.to_string(),
                    body: "body".into(),
                    source: "text".into(),
                    group_id: None,
                    created_at: now + Duration::seconds(i as i64),
                })
                .await
                .unwrap();
        }
        let episodes = store.recent_episodes(2, None).await.unwrap();
        assert_eq!(episodes.len(), 2);
        assert_eq!(episodes[0].name, "third");
        assert_eq!(episodes[1].name, "second");
    }

    #[tokio::test]
    async fn test_stats_excludes_soft_deleted_from_totals() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let mut a = node_at("a", now);
        a.decay_score = 0.4;
        let b = node_at("b", now);
        let b_id = b.uuid;
        store.insert_node(&a).await.unwrap();
        store.insert_node(&b).await.unwrap();
        store.soft_delete(&[b_id], now).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_excluding_deleted, 1);
        assert_eq!(stats.counts[&LifecycleState::Active], 1);
        assert_eq!(stats.counts[&LifecycleState::SoftDeleted], 1);
        assert!((stats.avg_decay_score - 0.4).abs() < 1e-9);
        assert!((stats.avg_importance - 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_clear_wipes_everything() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let node = node_at("a", now);
        store.insert_node(&node).await.unwrap();
        store
            .record_episode(&Episode {
                uuid: Uuid::now_v7(),
                name: "ep".into(),
                body: "body".into(),
                source: "text".into(),
                group_id: None,
                created_at: now,
            })
            .await
            .unwrap();

        store.clear().await.unwrap();
        assert!(store.get_node(node.uuid).await.is_err());
        assert!(store.recent_episodes(10, None).await.unwrap().is_empty());
        assert_eq!(store.stats().await.unwrap().total_excluding_deleted, 0);
    }

    #[test]
    fn test_keyword_score() {
        assert_eq!(keyword_score("", "anything"), 0.0);
        assert!((keyword_score("rust async", "Rust async runtime") - 1.0).abs() < 1e-9);
        assert!((keyword_score("rust gardening", "rust only") - 0.5).abs() < 1e-9);
        assert_eq!(keyword_score("python", "rust only"), 0.0);
    }
}
