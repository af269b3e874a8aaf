use std::future::Future;

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{NisyanError, Result};
use crate::model::{Episode, FactEdge, LifecycleState, MemoryNode, NodeSnapshot};
use crate::retry::{run_with_backoff, Backoff};
use crate::storage::{GraphStats, GraphStore};

/// Abstract query session against the graph engine.
///
/// The engine may hand out sync or async sessions; adapters implement this
/// one capability and everything above it stays agnostic. Parameters are
/// bound NULL-safely by the engine; missing attributes come back as JSON
/// nulls, never as errors.
pub trait QueryRunner: Send + Sync {
    fn run(
        &self,
        query: &str,
        params: Value,
    ) -> impl Future<Output = Result<Vec<Value>>> + Send;
}

/// HTTP session adapter: POSTs `{query, params}` to the engine's query
/// endpoint, with retry on transient failures.
pub struct HttpRunner {
    base_url: String,
    http: reqwest::Client,
}

impl HttpRunner {
    pub fn new(url: &str, port: u16) -> Result<Self> {
        Ok(Self {
            base_url: format!("{}:{port}", url.trim_end_matches('/')),
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .connect_timeout(std::time::Duration::from_secs(5))
                .build()
                .map_err(|e| NisyanError::Config(format!("failed to build HTTP client: {e}")))?,
        })
    }

    async fn run_once(&self, query: &str, params: &Value) -> Result<Vec<Value>> {
        let url = format!("{}/query", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&json!({ "query": query, "params": params }))
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(NisyanError::Upstream {
                service: "graph engine",
                status: status.as_u16(),
                message: body,
            });
        }

        let parsed: Value = serde_json::from_str(&body).map_err(|e| {
            let preview: String = body.chars().take(300).collect();
            NisyanError::Storage(format!(
                "failed to deserialize query response: {e}\nBody: {preview}"
            ))
        })?;

        // Engines answer either a bare row array or {"rows": [...]}.
        match parsed {
            Value::Array(rows) => Ok(rows),
            Value::Object(mut map) => match map.remove("rows") {
                Some(Value::Array(rows)) => Ok(rows),
                _ => Err(NisyanError::Storage(
                    "query response missing 'rows' array".into(),
                )),
            },
            other => Err(NisyanError::Storage(format!(
                "unexpected query response shape: {other}"
            ))),
        }
    }
}

impl QueryRunner for HttpRunner {
    async fn run(&self, query: &str, params: Value) -> Result<Vec<Value>> {
        let policy = Backoff::new(3, std::time::Duration::from_millis(200));
        run_with_backoff(policy, || self.run_once(query, &params)).await
    }
}

/// Days since a node was last touched, computed inside the query.
///
/// The three branches are explicit: `last_accessed_at`, else `created_at`,
/// else 0. Never written as coalesce-then-parse; a NULL that survives into
/// duration arithmetic poisons the whole row.
const DAYS_SINCE_ACCESS: &str = "CASE \
     WHEN n.last_accessed_at IS NOT NULL \
       THEN duration.between(datetime(n.last_accessed_at), datetime($now)).seconds / 86400.0 \
     WHEN n.created_at IS NOT NULL \
       THEN duration.between(datetime(n.created_at), datetime($now)).seconds / 86400.0 \
     ELSE 0.0 END";

/// Graph store that composes parameterized queries over a [`QueryRunner`].
pub struct CypherStore<R> {
    runner: R,
}

impl<R: QueryRunner> CypherStore<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    async fn run_count(&self, query: &str, params: Value, key: &str) -> Result<usize> {
        let rows = self.runner.run(query, params).await?;
        Ok(rows
            .first()
            .and_then(|row| row[key].as_u64())
            .unwrap_or(0) as usize)
    }

    async fn run_uuids(&self, query: &str, params: Value) -> Result<Vec<Uuid>> {
        let rows = self.runner.run(query, params).await?;
        rows.iter().map(|row| parse_uuid(&row["uuid"])).collect()
    }
}

fn uuid_strings(uuids: &[Uuid]) -> Vec<String> {
    uuids.iter().map(Uuid::to_string).collect()
}

fn parse_uuid(value: &Value) -> Result<Uuid> {
    value
        .as_str()
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| NisyanError::Storage(format!("row has no valid uuid: {value}")))
}

fn parse_node(value: &Value) -> Result<MemoryNode> {
    serde_json::from_value(value.clone())
        .map_err(|e| NisyanError::Storage(format!("failed to parse memory node: {e}")))
}

impl<R: QueryRunner> GraphStore for CypherStore<R> {
    async fn insert_node(&self, node: &MemoryNode) -> Result<()> {
        let query = "MERGE (n:Memory {uuid: $uuid}) \
             SET n.name = $name, n.summary = $summary, n.group_id = $group_id, \
                 n.importance = $importance, n.stability = $stability, \
                 n.decay_score = $decay_score, n.state = $state, \
                 n.last_accessed_at = $last_accessed_at, n.created_at = $created_at, \
                 n.access_count = $access_count, n.soft_deleted_at = $soft_deleted_at, \
                 n.classified_at = $classified_at";
        self.runner
            .run(query, serde_json::to_value(node)?)
            .await?;
        Ok(())
    }

    async fn get_node(&self, uuid: Uuid) -> Result<MemoryNode> {
        let query = "MATCH (n:Memory {uuid: $uuid}) RETURN n { .* } AS node";
        let rows = self
            .runner
            .run(query, json!({ "uuid": uuid.to_string() }))
            .await?;
        let row = rows
            .first()
            .ok_or_else(|| NisyanError::NotFound(format!("memory {uuid}")))?;
        parse_node(&row["node"])
    }

    async fn touch(&self, uuid: Uuid, now: DateTime<Utc>) -> Result<()> {
        self.touch_batch(std::slice::from_ref(&uuid), now).await
    }

    async fn touch_batch(&self, uuids: &[Uuid], now: DateTime<Utc>) -> Result<()> {
        // Monotonic on both attributes so concurrent touches commute.
        let query = "MATCH (n:Memory) WHERE n.uuid IN $uuids \
             SET n.access_count = coalesce(n.access_count, 0) + 1, \
                 n.last_accessed_at = CASE \
                     WHEN n.last_accessed_at IS NULL THEN $now \
                     WHEN datetime(n.last_accessed_at) < datetime($now) THEN $now \
                     ELSE n.last_accessed_at END, \
                 n.state = CASE WHEN n.state IN ['DORMANT', 'ARCHIVED'] \
                     THEN 'ACTIVE' ELSE n.state END";
        self.runner
            .run(
                query,
                json!({ "uuids": uuid_strings(uuids), "now": now.to_rfc3339() }),
            )
            .await?;
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
        let query = "MATCH (n:Memory {uuid: $uuid}) \
             SET n.importance = $importance, n.stability = $stability, \
                 n.classified_at = $classified_at \
             RETURN count(n) AS updated";
        let updated = self
            .run_count(
                query,
                json!({
                    "uuid": uuid.to_string(),
                    "importance": importance,
                    "stability": stability,
                    "classified_at": classified_at.map(|ts| ts.to_rfc3339()),
                }),
                "updated",
            )
            .await?;
        if updated == 0 {
            return Err(NisyanError::NotFound(format!("memory {uuid}")));
        }
        Ok(())
    }

    async fn list_unclassified(&self, limit: usize) -> Result<Vec<MemoryNode>> {
        let query = "MATCH (n:Memory) \
             WHERE n.classified_at IS NULL AND n.state <> 'SOFT_DELETED' \
             RETURN n { .* } AS node \
             ORDER BY n.created_at ASC LIMIT $limit";
        let rows = self.runner.run(query, json!({ "limit": limit })).await?;
        rows.iter().map(|row| parse_node(&row["node"])).collect()
    }

    async fn list_scoring_ids(&self) -> Result<Vec<Uuid>> {
        let query = "MATCH (n:Memory) \
             WHERE n.state <> 'PERMANENT' AND n.state <> 'SOFT_DELETED' \
             RETURN n.uuid AS uuid";
        self.run_uuids(query, json!({})).await
    }

    async fn recalc_decay(
        &self,
        uuids: &[Uuid],
        base_half_life_days: f64,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        // The whole curve runs engine-side so a batch is one round trip.
        // days < 0 clamps to 0; zero stability or a non-positive half-life
        // yields 0.0, matching decay::decay_score.
        let query = format!(
            "MATCH (n:Memory) WHERE n.uuid IN $uuids \
               AND n.state <> 'PERMANENT' AND n.state <> 'SOFT_DELETED' \
             WITH n, {DAYS_SINCE_ACCESS} AS raw_days \
             WITH n, CASE WHEN raw_days < 0.0 THEN 0.0 ELSE raw_days END AS days, \
                  $base_half_life * (toFloat(n.stability) / 3.0) AS half_life \
             SET n.decay_score = CASE \
                 WHEN n.stability = 0 OR half_life <= 0.0 THEN 0.0 \
                 ELSE 1.0 - exp(-(log(2.0) / half_life) \
                      * ((6.0 - toFloat(n.importance)) / 5.0) * days) END \
             RETURN count(n) AS updated"
        );
        self.run_count(
            &query,
            json!({
                "uuids": uuid_strings(uuids),
                "base_half_life": base_half_life_days,
                "now": now.to_rfc3339(),
            }),
            "updated",
        )
        .await
    }

    async fn snapshots(&self, uuids: &[Uuid], now: DateTime<Utc>) -> Result<Vec<NodeSnapshot>> {
        let query = format!(
            "MATCH (n:Memory) WHERE n.uuid IN $uuids \
             RETURN n.uuid AS uuid, n.state AS state, n.decay_score AS decay_score, \
                    {DAYS_SINCE_ACCESS} AS days_since_access, \
                    n.importance AS importance, n.stability AS stability"
        );
        let rows = self
            .runner
            .run(
                &query,
                json!({ "uuids": uuid_strings(uuids), "now": now.to_rfc3339() }),
            )
            .await?;

        rows.iter()
            .map(|row| {
                let state: LifecycleState = row["state"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| {
                        NisyanError::Storage(format!("snapshot row has bad state: {row}"))
                    })?;
                Ok(NodeSnapshot {
                    uuid: parse_uuid(&row["uuid"])?,
                    state,
                    decay_score: row["decay_score"].as_f64().unwrap_or(0.0),
                    days_since_access: row["days_since_access"].as_f64().unwrap_or(0.0),
                    importance: row["importance"].as_u64().unwrap_or(3) as u8,
                    stability: row["stability"].as_u64().unwrap_or(3) as u8,
                })
            })
            .collect()
    }

    async fn apply_transitions(
        &self,
        changes: &[(Uuid, LifecycleState)],
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let query = "UNWIND $changes AS change \
             MATCH (n:Memory {uuid: change.uuid}) \
             SET n.state = change.state, \
                 n.decay_score = CASE WHEN change.state = 'PERMANENT' \
                     THEN 0.0 ELSE n.decay_score END, \
                 n.soft_deleted_at = CASE WHEN change.state = 'SOFT_DELETED' \
                     THEN $now ELSE n.soft_deleted_at END \
             RETURN count(n) AS updated";
        let changes: Vec<Value> = changes
            .iter()
            .map(|(uuid, state)| json!({ "uuid": uuid.to_string(), "state": state.as_str() }))
            .collect();
        self.run_count(
            query,
            json!({ "changes": changes, "now": now.to_rfc3339() }),
            "updated",
        )
        .await
    }

    async fn soft_delete(&self, uuids: &[Uuid], now: DateTime<Utc>) -> Result<usize> {
        let query = "MATCH (n:Memory) \
             WHERE n.uuid IN $uuids AND n.state <> 'SOFT_DELETED' \
             SET n.state = 'SOFT_DELETED', n.soft_deleted_at = $now \
             RETURN count(n) AS deleted";
        self.run_count(
            query,
            json!({ "uuids": uuid_strings(uuids), "now": now.to_rfc3339() }),
            "deleted",
        )
        .await
    }

    async fn list_purgeable(&self, now: DateTime<Utc>, retention_days: u32) -> Result<Vec<Uuid>> {
        let cutoff = now - Duration::days(i64::from(retention_days));
        let query = "MATCH (n:Memory) \
             WHERE n.state = 'SOFT_DELETED' AND n.soft_deleted_at IS NOT NULL \
               AND datetime(n.soft_deleted_at) <= datetime($cutoff) \
             RETURN n.uuid AS uuid";
        self.run_uuids(query, json!({ "cutoff": cutoff.to_rfc3339() }))
            .await
    }

    async fn purge(&self, uuids: &[Uuid]) -> Result<usize> {
        let query = "MATCH (n:Memory) WHERE n.uuid IN $uuids \
             DETACH DELETE n RETURN count(*) AS purged";
        self.run_count(query, json!({ "uuids": uuid_strings(uuids) }), "purged")
            .await
    }

    async fn recover(
        &self,
        uuid: Uuid,
        now: DateTime<Utc>,
        retention_days: u32,
    ) -> Result<MemoryNode> {
        let node = self.get_node(uuid).await?;
        if node.state != LifecycleState::SoftDeleted {
            return Err(NisyanError::NotRecoverable(format!(
                "memory {uuid} is {}, not SOFT_DELETED",
                node.state
            )));
        }
        let deleted_at = node.soft_deleted_at.ok_or_else(|| {
            NisyanError::Storage(format!("memory {uuid} soft-deleted without timestamp"))
        })?;
        if !crate::recovery::within_retention(deleted_at, now, retention_days) {
            return Err(NisyanError::NotRecoverable(format!(
                "memory {uuid} passed the {retention_days}-day recovery window"
            )));
        }

        let query = "MATCH (n:Memory {uuid: $uuid}) \
             SET n.state = 'ARCHIVED', n.soft_deleted_at = NULL, \
                 n.last_accessed_at = $now \
             RETURN n { .* } AS node";
        let rows = self
            .runner
            .run(
                query,
                json!({ "uuid": uuid.to_string(), "now": now.to_rfc3339() }),
            )
            .await?;
        let row = rows
            .first()
            .ok_or_else(|| NisyanError::NotFound(format!("memory {uuid}")))?;
        parse_node(&row["node"])
    }

    async fn search_nodes(
        &self,
        query_text: &str,
        limit: usize,
        group_ids: Option<&[String]>,
    ) -> Result<Vec<(MemoryNode, f64)>> {
        // Semantic scoring is the engine's: its search procedure embeds the
        // query and returns cosine-ranked candidates.
        let query = "CALL engine.search_nodes($query, $limit, $group_ids) \
             YIELD node, score \
             RETURN node { .* } AS node, score";
        let rows = self
            .runner
            .run(
                query,
                json!({ "query": query_text, "limit": limit, "group_ids": group_ids }),
            )
            .await?;
        rows.iter()
            .map(|row| {
                let node = parse_node(&row["node"])?;
                let score = row["score"].as_f64().unwrap_or(0.0);
                Ok((node, score))
            })
            .collect()
    }

    async fn search_facts(
        &self,
        query_text: &str,
        limit: usize,
        group_ids: Option<&[String]>,
    ) -> Result<Vec<FactEdge>> {
        let query = "CALL engine.search_facts($query, $limit, $group_ids) \
             YIELD edge \
             RETURN edge { .* } AS fact";
        let rows = self
            .runner
            .run(
                query,
                json!({ "query": query_text, "limit": limit, "group_ids": group_ids }),
            )
            .await?;
        rows.iter()
            .map(|row| {
                serde_json::from_value(row["fact"].clone())
                    .map_err(|e| NisyanError::Storage(format!("failed to parse fact edge: {e}")))
            })
            .collect()
    }

    async fn record_episode(&self, episode: &Episode) -> Result<()> {
        let query = "CREATE (e:Episode { \
                 uuid: $uuid, name: $name, body: $body, source: $source, \
                 group_id: $group_id, created_at: $created_at })";
        self.runner
            .run(query, serde_json::to_value(episode)?)
            .await?;
        Ok(())
    }

    async fn recent_episodes(&self, limit: usize, group_id: Option<&str>) -> Result<Vec<Episode>> {
        let query = "MATCH (e:Episode) \
             WHERE $group_id IS NULL OR e.group_id = $group_id \
             RETURN e { .* } AS episode \
             ORDER BY e.created_at DESC LIMIT $limit";
        let rows = self
            .runner
            .run(query, json!({ "limit": limit, "group_id": group_id }))
            .await?;
        rows.iter()
            .map(|row| {
                serde_json::from_value(row["episode"].clone())
                    .map_err(|e| NisyanError::Storage(format!("failed to parse episode: {e}")))
            })
            .collect()
    }

    async fn stats(&self) -> Result<GraphStats> {
        // Single grouped read; the per-state rows fold into totals here.
        let query = "MATCH (n:Memory) \
             RETURN n.state AS state, count(n) AS count, \
                    avg(n.decay_score) AS avg_decay, \
                    avg(toFloat(n.importance)) AS avg_importance, \
                    avg(toFloat(n.stability)) AS avg_stability";
        let rows = self.runner.run(query, json!({})).await?;

        let mut stats = GraphStats::default();
        let mut live = 0u64;
        let mut sum_decay = 0.0;
        let mut sum_importance = 0.0;
        let mut sum_stability = 0.0;

        for row in &rows {
            let state: LifecycleState = row["state"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| NisyanError::Storage(format!("stats row has bad state: {row}")))?;
            let count = row["count"].as_u64().unwrap_or(0);
            stats.counts.insert(state, count);
            if state != LifecycleState::SoftDeleted {
                live += count;
                sum_decay += row["avg_decay"].as_f64().unwrap_or(0.0) * count as f64;
                sum_importance += row["avg_importance"].as_f64().unwrap_or(0.0) * count as f64;
                sum_stability += row["avg_stability"].as_f64().unwrap_or(0.0) * count as f64;
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
        self.runner
            .run("MATCH (n:Memory) DETACH DELETE n", json!({}))
            .await?;
        self.runner
            .run("MATCH (e:Episode) DETACH DELETE e", json!({}))
            .await?;
        Ok(())
    }
}
