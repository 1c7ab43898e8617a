//! Agent manager: spawns and supervises the event agents and the periodic
//! sweep scheduler on this node.

use std::sync::Arc;
use std::time::Duration;

use daffodil_core::config::AppConfig;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::agent::EventAgent;
use crate::coordinator::Coordinator;

pub struct AgentManager {
    config: AppConfig,
    coordinator: Arc<Coordinator>,
    agents: Vec<JoinHandle<()>>,
    scheduler: Option<JoinHandle<()>>,
}

impl AgentManager {
    pub fn new(config: AppConfig, coordinator: Arc<Coordinator>) -> Self {
        Self {
            config,
            coordinator,
            agents: Vec::new(),
            scheduler: None,
        }
    }

    pub fn coordinator(&self) -> Arc<Coordinator> {
        self.coordinator.clone()
    }

    /// Subject order events are published on.
    pub fn event_subject(&self) -> String {
        format!("{}.order-events", self.config.nats.stream_name)
    }

    /// Connect to NATS and spawn `agents_per_node` event agents.
    pub async fn start_agents(&mut self) -> anyhow::Result<()> {
        let nats_url = self
            .config
            .nats
            .urls
            .first()
            .cloned()
            .unwrap_or_else(|| "nats://localhost:4222".to_string());

        info!(url = %nats_url, "Connecting to NATS");

        let nats_client = async_nats::ConnectOptions::new()
            .max_reconnects(Some(self.config.nats.max_reconnects))
            .connect(&nats_url)
            .await?;

        info!("NATS connection established");

        let subject = self.event_subject();
        for i in 0..self.config.agents_per_node {
            let agent_id = format!("{}-agent-{:02}", self.config.node_id, i);
            let agent = EventAgent::new(
                agent_id.clone(),
                self.config.node_id.clone(),
                self.coordinator.clone(),
            );

            let handle = agent.spawn(
                nats_client.clone(),
                subject.clone(),
                self.config.nats.queue_group.clone(),
            );
            self.agents.push(handle);

            info!(agent_id = %agent_id, "Agent spawned");
        }

        info!(
            count = self.config.agents_per_node,
            node = %self.config.node_id,
            "All agents started"
        );

        Ok(())
    }

    /// Run a full sweep every `sweep_interval_secs`, starting immediately.
    /// Returns `false` without spawning anything when the interval is zero.
    pub fn start_scheduler(&mut self, shutdown: watch::Receiver<bool>) -> bool {
        let interval_secs = self.config.evaluation.sweep_interval_secs;
        if interval_secs == 0 {
            info!("Periodic sweeps disabled");
            return false;
        }

        self.scheduler = Some(spawn_scheduler(
            self.coordinator.clone(),
            Duration::from_secs(interval_secs),
            shutdown,
        ));
        info!(interval_secs = interval_secs, "Sweep scheduler started");
        true
    }

    /// Stop consuming events and wait for the scheduler to exit. The
    /// shutdown signal passed to `start_scheduler` must already be set, so a
    /// sweep in progress finishes its running users and starts no more.
    pub async fn shutdown(&mut self) {
        for handle in self.agents.drain(..) {
            handle.abort();
        }
        if let Some(handle) = self.scheduler.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "Sweep scheduler panicked");
            }
        }
        info!(node = %self.config.node_id, "Agent manager stopped");
    }

    pub fn task_count(&self) -> usize {
        self.agents.len() + usize::from(self.scheduler.is_some())
    }
}

fn spawn_scheduler(
    coordinator: Arc<Coordinator>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    if let Err(e) = coordinator.run_sweep(shutdown.clone()).await {
                        metrics::counter!("sweep.errors").increment(1);
                        error!(error = %e, retryable = e.is_retryable(), "Scheduled sweep failed");
                    }
                }
            }
        }

        info!("Sweep scheduler stopped");
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::sequence::SequenceSource;
    use daffodil_cache::{
        CacheMaterializer, CacheStore, LocalCacheStore, ReconciliationBacklog, RetryPolicy,
    };
    use daffodil_core::config::EvaluationConfig;
    use daffodil_core::fakes::{MemoryMetricStore, MemorySegmentStore};
    use daffodil_core::UserMetrics;
    use daffodil_segmentation::{SegmentBuilder, SegmentCatalog};

    fn manager(sweep_interval_secs: u64) -> (AgentManager, Arc<LocalCacheStore>) {
        let metrics = Arc::new(MemoryMetricStore::with_rows([UserMetrics {
            user_id: "u1".into(),
            orders_23d: 9,
            total_spend: 900.0,
            location_tag: "NYC".into(),
        }]));
        let segments = Arc::new(MemorySegmentStore::new(vec![SegmentBuilder::new(
            "1",
            "Frequent Buyer",
        )
        .attribute_gt("orders_23d", 5)
        .record()]));
        let cache = Arc::new(LocalCacheStore::new());
        let materializer = Arc::new(CacheMaterializer::new(
            cache.clone(),
            Arc::new(ReconciliationBacklog::new()),
            RetryPolicy::default(),
        ));

        let mut config = AppConfig::default();
        config.node_id = "node-test".into();
        config.evaluation = EvaluationConfig {
            sweep_interval_secs,
            ..EvaluationConfig::default()
        };

        let coordinator = Arc::new(Coordinator::new(
            metrics,
            Arc::new(SegmentCatalog::new(segments)),
            materializer,
            Arc::new(SequenceSource::new()),
            config.evaluation.clone(),
        ));
        (AgentManager::new(config, coordinator), cache)
    }

    #[test]
    fn test_event_subject() {
        let (manager, _) = manager(0);
        assert_eq!(manager.event_subject(), "daffodil.order-events");
    }

    #[tokio::test]
    async fn test_zero_interval_disables_scheduler() {
        let (mut manager, _) = manager(0);
        let (_tx, rx) = watch::channel(false);
        assert!(!manager.start_scheduler(rx));
        assert_eq!(manager.task_count(), 0);
    }

    #[tokio::test]
    async fn test_scheduler_sweeps_immediately_and_stops_on_shutdown() {
        let (mut manager, cache) = manager(3600);
        let (tx, rx) = watch::channel(false);
        assert!(manager.start_scheduler(rx));

        let mut published = false;
        for _ in 0..50 {
            if cache.last_applied("u1").await.unwrap().is_some() {
                published = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(published);
        assert!(cache.read_membership("u1").await.unwrap().segments.contains("Frequent Buyer"));

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), manager.shutdown())
            .await
            .unwrap();
        assert_eq!(manager.task_count(), 0);
    }
}
