use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use rmcp::{transport::stdio, ServiceExt};
use tracing_subscriber::EnvFilter;

use nisyan_core::classify::Classifier;
use nisyan_core::config::{ConfigHandle, NisyanConfig};
use nisyan_core::error::NisyanError;
use nisyan_core::llm::LlmClient;
use nisyan_core::maintenance::MaintenanceRunner;
use nisyan_core::metrics::Metrics;
use nisyan_core::storage::Graph;

mod server;

#[derive(Parser, Debug)]
#[command(name = "nisyan-mcp", about = "MCP server for the Nisyan memory graph")]
struct Cli {
    /// Path to the decay config YAML. Defaults to $NISYAN_CONFIG or
    /// ~/.config/nisyan/decay.yaml; missing files fall back to defaults.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    tracing::info!("Starting Nisyan MCP server");

    // Construction happens once, here; every subsystem receives its
    // collaborators explicitly.
    let config = NisyanConfig::load(cli.config.as_deref());
    let config = ConfigHandle::new(config, cli.config);
    let snapshot = config.snapshot();

    let graph = Arc::new(Graph::from_config(&snapshot)?);
    let metrics = Arc::new(Metrics::new());

    let llm = if snapshot.llm.enabled {
        match LlmClient::from_config(&snapshot.llm) {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                tracing::warn!(error = %e, "LLM client unavailable; classification falls back to neutral scores");
                None
            }
        }
    } else {
        None
    };
    let classifier = Arc::new(Classifier::new(llm, Arc::clone(&metrics)));

    let maintenance = Arc::new(MaintenanceRunner::new(
        Arc::clone(&graph),
        Arc::clone(&classifier),
        config.clone(),
        Arc::clone(&metrics),
    ));

    spawn_scheduler(Arc::clone(&maintenance), config.clone());

    let service = server::NisyanServer::new(graph, classifier, maintenance, config, metrics);
    let running = service.serve(stdio()).await?;
    running.waiting().await?;

    Ok(())
}

/// Periodic maintenance trigger. Reads the interval from the live config
/// each round so a reload takes effect without a restart; a manual cycle
/// already in flight just skips the tick.
fn spawn_scheduler(maintenance: Arc<MaintenanceRunner<Graph>>, config: ConfigHandle) {
    tokio::spawn(async move {
        loop {
            let interval = config.snapshot().maintenance.interval_seconds;
            tokio::time::sleep(std::time::Duration::from_secs(interval)).await;

            match maintenance.run(false).await {
                Ok(report) => {
                    tracing::info!(status = report.status.as_str(), "scheduled maintenance finished");
                }
                Err(NisyanError::AlreadyRunning) => {
                    tracing::debug!("scheduled maintenance skipped, cycle already running");
                }
                Err(e) => {
                    tracing::error!(error = %e, "scheduled maintenance failed to start");
                }
            }
        }
    });
}
