//! Event agent: a Tokio task that consumes order events from a NATS queue
//! group and hands each one to the coordinator.

use std::sync::Arc;

use daffodil_core::OrderEvent;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use crate::coordinator::{Coordinator, RecomputeOutcome};
use crate::error::DaffodilError;

/// Decode one message body into an order event.
pub fn decode_event(payload: &[u8]) -> Result<OrderEvent, DaffodilError> {
    let event: OrderEvent =
        serde_json::from_slice(payload).map_err(|e| DaffodilError::InvalidEvent(e.to_string()))?;
    if event.user_id.trim().is_empty() {
        return Err(DaffodilError::InvalidEvent("empty user_id".into()));
    }
    Ok(event)
}

pub struct EventAgent {
    pub agent_id: String,
    pub node_id: String,
    coordinator: Arc<Coordinator>,
}

impl EventAgent {
    pub fn new(agent_id: String, node_id: String, coordinator: Arc<Coordinator>) -> Self {
        Self {
            agent_id,
            node_id,
            coordinator,
        }
    }

    /// Spawn this agent as a Tokio task subscribed to `subject` within
    /// `queue_group`, so each event is delivered to one agent only.
    pub fn spawn(
        self,
        nats_client: async_nats::Client,
        subject: String,
        queue_group: String,
    ) -> JoinHandle<()> {
        let agent_id = self.agent_id.clone();
        let node_id = self.node_id.clone();

        tokio::spawn(async move {
            info!(
                agent_id = %agent_id,
                node_id = %node_id,
                subject = %subject,
                queue_group = %queue_group,
                "Agent started, subscribing to NATS queue"
            );

            let subscriber = match nats_client.queue_subscribe(subject, queue_group).await {
                Ok(sub) => sub,
                Err(e) => {
                    error!(agent_id = %agent_id, error = %e, "Failed to subscribe to NATS");
                    return;
                }
            };

            self.process_messages(subscriber).await;
        })
    }

    async fn process_messages(self, mut subscriber: async_nats::Subscriber) {
        while let Some(msg) = subscriber.next().await {
            let event = match decode_event(&msg.payload) {
                Ok(event) => event,
                Err(e) => {
                    warn!(agent_id = %self.agent_id, error = %e, "Dropping undecodable order event");
                    metrics::counter!("agent.deserialize_errors").increment(1);
                    continue;
                }
            };

            // Ordering is fixed at arrival, not when the task gets scheduled.
            let sequence = self.coordinator.next_sequence();
            let coordinator = self.coordinator.clone();
            let agent_id = self.agent_id.clone();
            tokio::spawn(async move {
                match coordinator.handle_event(&event, sequence).await {
                    Ok(Some(RecomputeOutcome::Published { segments })) => {
                        debug!(
                            agent_id = %agent_id,
                            user_id = %event.user_id,
                            sequence = %sequence,
                            segments = segments,
                            "Instant sync published"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(
                            agent_id = %agent_id,
                            user_id = %event.user_id,
                            retryable = e.is_retryable(),
                            error = %e,
                            "Order event processing failed"
                        );
                        metrics::counter!("agent.processing_errors").increment(1);
                    }
                }
            });
        }

        warn!(agent_id = %self.agent_id, "NATS subscription ended");
    }
}
