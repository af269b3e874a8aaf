use std::sync::Arc;
use std::time::Instant;

use chrono::{Duration, Utc};
use rmcp::handler::server::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::*;
use rmcp::{schemars, tool, tool_handler, tool_router, ServerHandler};
use serde::Deserialize;
use uuid::Uuid;

use nisyan_core::classify::Classifier;
use nisyan_core::config::ConfigHandle;
use nisyan_core::error::NisyanError;
use nisyan_core::health;
use nisyan_core::maintenance::MaintenanceRunner;
use nisyan_core::metrics::Metrics;
use nisyan_core::model::{self, Episode, MemoryNode};
use nisyan_core::recovery;
use nisyan_core::search;
use nisyan_core::storage::{Graph, GraphStore};

#[derive(Clone)]
pub struct NisyanServer {
    graph: Arc<Graph>,
    classifier: Arc<Classifier>,
    maintenance: Arc<MaintenanceRunner<Graph>>,
    config: ConfigHandle,
    metrics: Arc<Metrics>,
    started_at: chrono::DateTime<chrono::Utc>,
    tool_router: ToolRouter<Self>,
}

// -- Tool parameter types --

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct AddMemoryParams {
    #[schemars(description = "Short name for this memory")]
    pub name: String,

    #[schemars(description = "Memory content; the graph engine extracts entities from it")]
    pub body: String,

    #[schemars(description = "Where this content came from, e.g. 'text', 'message', 'json'")]
    #[serde(default = "default_source")]
    pub source: String,

    #[schemars(description = "Group to scope this memory to (optional)")]
    #[serde(default)]
    pub group_id: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct SearchNodesParams {
    #[schemars(description = "Search query text")]
    pub query: String,

    #[schemars(description = "Max results (default 10)")]
    #[serde(default = "default_limit")]
    pub limit: usize,

    #[schemars(description = "Restrict to these groups; omit to search all groups")]
    #[serde(default)]
    pub group_ids: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct SearchFactsParams {
    #[schemars(description = "Search query text")]
    pub query: String,

    #[schemars(description = "Max results (default 10)")]
    #[serde(default = "default_limit")]
    pub limit: usize,

    #[schemars(description = "Restrict to these groups; omit to search all groups")]
    #[serde(default)]
    pub group_ids: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct GetEpisodesParams {
    #[schemars(description = "Max episodes to return (default 5)")]
    #[serde(default = "default_episode_limit")]
    pub limit: usize,

    #[schemars(description = "Filter by group (optional)")]
    #[serde(default)]
    pub group_id: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct RunMaintenanceParams {
    #[schemars(description = "Report what the cycle would do without writing (default false)")]
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct RecoverMemoryParams {
    #[schemars(description = "UUID of the soft-deleted memory to restore")]
    pub uuid: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ClearGraphParams {
    #[schemars(description = "Must be true; guards against accidental destruction")]
    #[serde(default)]
    pub confirm: bool,
}

fn default_source() -> String {
    "text".to_string()
}
fn default_limit() -> usize {
    10
}
fn default_episode_limit() -> usize {
    5
}

fn to_mcp_error(e: NisyanError) -> ErrorData {
    match &e {
        NisyanError::NotFound(_) => ErrorData::resource_not_found(
            e.to_string(),
            Some(serde_json::json!({"error_type": "not_found"})),
        ),
        NisyanError::InvalidInput(_) => ErrorData::invalid_params(
            e.to_string(),
            Some(serde_json::json!({"error_type": "invalid_input"})),
        ),
        NisyanError::NotRecoverable(_) => ErrorData::invalid_params(
            e.to_string(),
            Some(serde_json::json!({"error_type": "not_recoverable"})),
        ),
        NisyanError::Config(_) => ErrorData::invalid_params(
            e.to_string(),
            Some(serde_json::json!({"error_type": "config_error"})),
        ),
        NisyanError::AlreadyRunning => ErrorData::invalid_request(
            e.to_string(),
            Some(serde_json::json!({"error_type": "already_running"})),
        ),
        _ => {
            let variant = match &e {
                NisyanError::Storage(_) => "storage_error",
                NisyanError::Upstream { .. } => "upstream_error",
                NisyanError::Http(_) => "http_error",
                NisyanError::Serialization(_) => "serialization_error",
                NisyanError::Classification(_) => "classification_error",
                NisyanError::Batch { .. } => "batch_error",
                NisyanError::Cycle(_) => "cycle_error",
                _ => "internal_error",
            };
            ErrorData::internal_error(
                e.to_string(),
                Some(serde_json::json!({"error_type": variant})),
            )
        }
    }
}

fn json_result(value: serde_json::Value) -> Result<CallToolResult, ErrorData> {
    let text = serde_json::to_string_pretty(&value)
        .map_err(|e| ErrorData::internal_error(e.to_string(), None))?;
    Ok(CallToolResult::success(vec![Content::text(text)]))
}

/// First ~200 chars of the body, used as the node's brief description.
fn summarize(body: &str) -> String {
    if body.chars().count() > 200 {
        let head: String = body.chars().take(200).collect();
        format!("{head}...")
    } else {
        body.to_string()
    }
}

#[tool_router]
impl NisyanServer {
    /// All collaborators are injected here, once, at startup; the graph
    /// store, classifier and metrics have no process-wide fallbacks to
    /// silently pick up instead.
    pub fn new(
        graph: Arc<Graph>,
        classifier: Arc<Classifier>,
        maintenance: Arc<MaintenanceRunner<Graph>>,
        config: ConfigHandle,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            graph,
            classifier,
            maintenance,
            config,
            metrics,
            started_at: Utc::now(),
            tool_router: Self::tool_router(),
        }
    }

    #[tool(
        description = "Add a memory to the knowledge graph. Returns immediately; importance/stability scoring happens in the background and never blocks or fails the ingest."
    )]
    async fn add_memory(
        &self,
        Parameters(params): Parameters<AddMemoryParams>,
    ) -> Result<CallToolResult, ErrorData> {
        model::validate_add_input(&params.name, &params.body).map_err(to_mcp_error)?;

        let now = Utc::now();
        let episode = Episode {
            uuid: Uuid::now_v7(),
            name: params.name.clone(),
            body: params.body.clone(),
            source: params.source,
            group_id: params.group_id.clone(),
            created_at: now,
        };
        let node = MemoryNode::new(
            params.name,
            summarize(&params.body),
            params.group_id,
            now,
        );

        self.graph.insert_node(&node).await.map_err(to_mcp_error)?;
        self.graph
            .record_episode(&episode)
            .await
            .map_err(to_mcp_error)?;

        // Fire-and-forget scoring; errors are logged inside the task.
        self.classifier.spawn_classify(
            Arc::clone(&self.graph),
            node.uuid,
            node.classification_text(),
        );

        json_result(serde_json::json!({
            "uuid": node.uuid,
            "episode_uuid": episode.uuid,
            "name": node.name,
            "state": node.state,
            "importance": node.importance,
            "stability": node.stability,
            "classification": "queued",
        }))
    }

    #[tool(
        description = "Search memories. Engine results are re-ranked by a weighted blend of semantic similarity, recency and importance; returned memories count as accessed."
    )]
    async fn search_nodes(
        &self,
        Parameters(params): Parameters<SearchNodesParams>,
    ) -> Result<CallToolResult, ErrorData> {
        let config = self.config.snapshot();
        let candidates = self
            .graph
            .search_nodes(&params.query, params.limit * 3, params.group_ids.as_deref())
            .await
            .map_err(to_mcp_error)?;

        let now = Utc::now();
        let started = Instant::now();
        let ranked = search::rerank(candidates, now, &config.decay.search_weights);
        self.metrics
            .rerank_duration
            .observe(started.elapsed().as_secs_f64());

        let top: Vec<_> = ranked.into_iter().take(params.limit).collect();

        // Retrieval counts as access: bump counters and revive dormant
        // nodes. A failure here degrades; it never fails the search.
        let touched: Vec<Uuid> = top.iter().map(|r| r.node.uuid).collect();
        if let Err(e) = self.graph.touch_batch(&touched, now).await {
            tracing::warn!(error = %e, "failed to record access for search results");
        }

        let results: Vec<serde_json::Value> = top
            .iter()
            .map(|r| {
                serde_json::json!({
                    "uuid": r.node.uuid,
                    "name": r.node.name,
                    "summary": r.node.summary,
                    "state": r.node.state,
                    "importance": r.node.importance,
                    "stability": r.node.stability,
                    "group_id": r.node.group_id,
                    "score": r.combined,
                    "semantic_score": r.semantic_score,
                    "recency": r.recency,
                })
            })
            .collect();
        json_result(serde_json::Value::Array(results))
    }

    #[tool(
        description = "Search relationships (facts) between memories. Facts are returned in engine order without re-ranking."
    )]
    async fn search_facts(
        &self,
        Parameters(params): Parameters<SearchFactsParams>,
    ) -> Result<CallToolResult, ErrorData> {
        let facts = self
            .graph
            .search_facts(&params.query, params.limit, params.group_ids.as_deref())
            .await
            .map_err(to_mcp_error)?;
        json_result(serde_json::to_value(facts).map_err(|e| {
            ErrorData::internal_error(e.to_string(), None)
        })?)
    }

    #[tool(description = "Most recent ingested episodes, newest first.")]
    async fn get_episodes(
        &self,
        Parameters(params): Parameters<GetEpisodesParams>,
    ) -> Result<CallToolResult, ErrorData> {
        let episodes = self
            .graph
            .recent_episodes(params.limit, params.group_id.as_deref())
            .await
            .map_err(to_mcp_error)?;
        json_result(serde_json::to_value(episodes).map_err(|e| {
            ErrorData::internal_error(e.to_string(), None)
        })?)
    }

    #[tool(
        description = "Liveness plus a summary of the last maintenance cycle and the next scheduled run."
    )]
    async fn get_status(&self) -> Result<CallToolResult, ErrorData> {
        let config = self.config.snapshot();
        let last = self.maintenance.last_report();
        let interval = Duration::seconds(config.maintenance.interval_seconds as i64);
        let next_run_at = last
            .as_ref()
            .and_then(|r| r.completed_at)
            .map(|done| done + interval)
            .unwrap_or(self.started_at + interval);

        json_result(serde_json::json!({
            "status": "ok",
            "uptime_seconds": (Utc::now() - self.started_at).num_seconds(),
            "maintenance_running": self.maintenance.is_running(),
            "last_maintenance": last,
            "next_run_at": next_run_at,
        }))
    }

    #[tool(
        description = "Full knowledge-health snapshot: per-state counts, score averages, last maintenance outcome, and classification counts since the previous snapshot."
    )]
    async fn get_knowledge_health(&self) -> Result<CallToolResult, ErrorData> {
        let window = self.metrics.take_classification_window();
        let last = self.maintenance.last_report().map(|r| r.summary());
        let snapshot = health::aggregate(self.graph.as_ref(), last, window)
            .await
            .map_err(to_mcp_error)?;
        json_result(
            serde_json::to_value(&snapshot)
                .map_err(|e| ErrorData::internal_error(e.to_string(), None))?,
        )
    }

    #[tool(
        description = "Trigger a maintenance cycle now: classify, recompute decay, transition states, soft-delete, purge, refresh gauges. Rejected if a cycle is already running. dry_run reports without writing."
    )]
    async fn run_decay_maintenance(
        &self,
        Parameters(params): Parameters<RunMaintenanceParams>,
    ) -> Result<CallToolResult, ErrorData> {
        let report = self
            .maintenance
            .run(params.dry_run)
            .await
            .map_err(to_mcp_error)?;
        json_result(
            serde_json::to_value(&report)
                .map_err(|e| ErrorData::internal_error(e.to_string(), None))?,
        )
    }

    #[tool(
        description = "Restore a soft-deleted memory to ARCHIVED. Only possible inside the retention window (default 90 days)."
    )]
    async fn recover_memory(
        &self,
        Parameters(params): Parameters<RecoverMemoryParams>,
    ) -> Result<CallToolResult, ErrorData> {
        let uuid = Uuid::parse_str(&params.uuid)
            .map_err(|e| ErrorData::invalid_params(format!("invalid UUID: {e}"), None))?;
        let config = self.config.snapshot();
        let node = recovery::recover(
            self.graph.as_ref(),
            uuid,
            Utc::now(),
            config.decay.retention.soft_delete_days,
        )
        .await
        .map_err(to_mcp_error)?;

        json_result(serde_json::json!({
            "uuid": node.uuid,
            "name": node.name,
            "state": node.state,
            "recovered_at": node.last_accessed_at,
        }))
    }

    #[tool(
        description = "Delete every memory, episode and fact from the graph. Destructive and unrecoverable; requires confirm=true."
    )]
    async fn clear_graph(
        &self,
        Parameters(params): Parameters<ClearGraphParams>,
    ) -> Result<CallToolResult, ErrorData> {
        if !params.confirm {
            return Err(ErrorData::invalid_params(
                "clear_graph is destructive; pass confirm=true to proceed",
                None,
            ));
        }
        self.graph.clear().await.map_err(to_mcp_error)?;
        tracing::warn!("graph cleared by request");
        json_result(serde_json::json!({ "cleared": true }))
    }
}

#[tool_handler]
impl ServerHandler for NisyanServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Nisyan is a memory layer over a temporal knowledge graph with decay-based \
                 forgetting.\n\n\
                 Retrieval: search_nodes (re-ranked by similarity, recency and importance), \
                 search_facts (relationships), get_episodes (recent raw ingests).\n\n\
                 Writing: add_memory returns immediately; importance/stability scoring runs \
                 in the background.\n\n\
                 Lifecycle: memories decay when untouched, moving ACTIVE → DORMANT → \
                 ARCHIVED → EXPIRED → SOFT_DELETED before being purged 90 days later. \
                 Accessing a memory revives it; recover_memory restores a soft-deleted one.\n\n\
                 Operations: get_status (liveness, last/next maintenance), \
                 get_knowledge_health (full snapshot), run_decay_maintenance (manual cycle, \
                 supports dry_run), clear_graph (destructive, needs confirm=true)."
                    .to_string(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_maps_to_resource_not_found() {
        let err = NisyanError::NotFound("memory xyz".into());
        let data = to_mcp_error(err);
        assert_eq!(data.code.0, -32002); // RESOURCE_NOT_FOUND
        let error_type = data.data.unwrap()["error_type"].as_str().unwrap().to_string();
        assert_eq!(error_type, "not_found");
    }

    #[test]
    fn test_invalid_input_maps_to_invalid_params() {
        let err = NisyanError::InvalidInput("name cannot be empty".into());
        let data = to_mcp_error(err);
        assert_eq!(data.code.0, -32602); // INVALID_PARAMS
        let error_type = data.data.unwrap()["error_type"].as_str().unwrap().to_string();
        assert_eq!(error_type, "invalid_input");
    }

    #[test]
    fn test_not_recoverable_maps_to_invalid_params() {
        let err = NisyanError::NotRecoverable("window elapsed".into());
        let data = to_mcp_error(err);
        assert_eq!(data.code.0, -32602);
        let error_type = data.data.unwrap()["error_type"].as_str().unwrap().to_string();
        assert_eq!(error_type, "not_recoverable");
    }

    #[test]
    fn test_already_running_maps_to_invalid_request() {
        let err = NisyanError::AlreadyRunning;
        let data = to_mcp_error(err);
        assert_eq!(data.code.0, -32600); // INVALID_REQUEST
        let error_type = data.data.unwrap()["error_type"].as_str().unwrap().to_string();
        assert_eq!(error_type, "already_running");
    }

    #[test]
    fn test_storage_maps_to_internal_error() {
        let err = NisyanError::Storage("driver lost".into());
        let data = to_mcp_error(err);
        assert_eq!(data.code.0, -32603); // INTERNAL_ERROR
        let error_type = data.data.unwrap()["error_type"].as_str().unwrap().to_string();
        assert_eq!(error_type, "storage_error");
    }

    #[test]
    fn test_summarize_truncates_long_bodies() {
        let long = "x".repeat(500);
        let summary = summarize(&long);
        assert!(summary.ends_with("..."));
        assert_eq!(summary.chars().count(), 203);

        let short = "short body";
        assert_eq!(summarize(short), "short body");
    }
}
