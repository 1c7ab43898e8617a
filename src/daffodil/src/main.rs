//! Daffodil segment sync: keeps per-user segment memberships and payloads
//! in the serving cache up to date.
//!
//! Wires the ClickHouse stores, the Redis cache and the NATS event agents
//! together, then runs until interrupted.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use daffodil_agents::{AgentManager, Coordinator, SequenceSource};
use daffodil_cache::{CacheMaterializer, RedisCacheStore, ReconciliationBacklog, RetryPolicy};
use daffodil_core::config::{AppConfig, MetricsConfig};
use daffodil_core::{MetricStore, SegmentStore};
use daffodil_segmentation::SegmentCatalog;
use daffodil_store::ClickHouseStore;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "daffodil")]
#[command(about = "Segment evaluation and cache materialization engine")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "DAFFODIL__NODE_ID")]
    node_id: Option<String>,

    /// Number of event agents per node (overrides config)
    #[arg(long, env = "DAFFODIL__AGENTS_PER_NODE")]
    agents: Option<usize>,

    /// Run a single full sweep, print its report and exit
    #[arg(long, default_value_t = false)]
    once: bool,

    /// Skip NATS agent spawning (periodic sweeps only)
    #[arg(long, default_value_t = false)]
    no_agents: bool,

    /// Create an empty metrics row for this user, recompute them and exit
    #[arg(long, value_name = "USER_ID", conflicts_with = "once")]
    register: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "daffodil=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Daffodil starting up");

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(agents) = cli.agents {
        config.agents_per_node = agents;
    }

    info!(
        node_id = %config.node_id,
        agents = config.agents_per_node,
        max_concurrency = config.evaluation.max_concurrency,
        sweep_interval_secs = config.evaluation.sweep_interval_secs,
        "Configuration loaded"
    );

    let store = Arc::new(
        ClickHouseStore::new(&config.clickhouse)
            .await
            .context("ClickHouse connection required")?,
    );
    let cache = Arc::new(
        RedisCacheStore::new(&config.redis)
            .await
            .context("Redis connection required")?,
    );

    let metric_store: Arc<dyn MetricStore> = store.clone();
    let segment_store: Arc<dyn SegmentStore> = store;
    let materializer = Arc::new(CacheMaterializer::new(
        cache,
        Arc::new(ReconciliationBacklog::new()),
        RetryPolicy::from_config(&config.evaluation),
    ));
    let coordinator = Arc::new(Coordinator::new(
        metric_store,
        Arc::new(SegmentCatalog::new(segment_store)),
        materializer,
        Arc::new(SequenceSource::new()),
        config.evaluation.clone(),
    ));

    if let Some(user_id) = cli.register {
        coordinator.register_user(&user_id).await?;
        let outcome = coordinator
            .recompute_user(&user_id, coordinator.next_sequence())
            .await?;
        info!(user_id = %user_id, outcome = ?outcome, "User registered and recomputed");
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if cli.once {
        let report = coordinator.run_sweep(shutdown_rx).await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if let Err(e) = start_metrics(&config.metrics) {
        error!(error = %e, "Failed to start metrics exporter");
    }

    let mut agent_manager = AgentManager::new(config.clone(), coordinator);

    if !cli.no_agents {
        match agent_manager.start_agents().await {
            Ok(_) => info!("Agent manager started with {} agents", config.agents_per_node),
            Err(e) => {
                error!(error = %e, "Failed to start agents, running sweeps only");
            }
        }
    } else {
        info!("Running without NATS agents (sweeps only)");
    }

    agent_manager.start_scheduler(shutdown_rx);

    info!("Daffodil is running");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, letting in-flight work finish");
    let _ = shutdown_tx.send(true);
    agent_manager.shutdown().await;

    info!("Daffodil stopped");
    Ok(())
}

fn start_metrics(config: &MetricsConfig) -> anyhow::Result<()> {
    let addr = SocketAddr::new(config.host.parse()?, config.port);
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!(port = config.port, "Metrics exporter started");
    Ok(())
}
