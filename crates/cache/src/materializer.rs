//! Cache materializer: publishes a resolved membership into the cache store.
//!
//! Publishing either replaces the user's membership and payload completely or
//! leaves them untouched. Transient store failures are retried with
//! exponential backoff; once retries run out the user is flagged in the
//! [`ReconciliationBacklog`] and the error is returned to the caller.

use std::sync::Arc;
use std::time::Duration;

use daffodil_core::config::EvaluationConfig;
use daffodil_core::Sequence;
use daffodil_segmentation::MembershipResult;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::reconcile::ReconciliationBacklog;
use crate::store::{ApplyOutcome, CacheStore, CacheStoreError, MembershipUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Applied,
    /// A newer materialization was already in place; nothing was written.
    Stale { last_applied: Sequence },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PublishError {
    #[error("publish for user {user_id} failed after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        user_id: String,
        attempts: u32,
        #[source]
        source: CacheStoreError,
    },

    #[error("payload for user {user_id} could not be serialized: {reason}")]
    Encode { user_id: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &EvaluationConfig) -> Self {
        Self {
            max_attempts: config.publish_max_attempts.max(1),
            base_delay: config.publish_backoff_base(),
            attempt_timeout: config.operation_timeout(),
        }
    }

    /// Delay before attempt `attempt + 1`, doubling each time.
    fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(1u32 << (attempt.saturating_sub(1)).min(16))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&EvaluationConfig::default())
    }
}

pub struct CacheMaterializer {
    store: Arc<dyn CacheStore>,
    backlog: Arc<ReconciliationBacklog>,
    policy: RetryPolicy,
}

impl CacheMaterializer {
    pub fn new(
        store: Arc<dyn CacheStore>,
        backlog: Arc<ReconciliationBacklog>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            backlog,
            policy,
        }
    }

    pub fn backlog(&self) -> &Arc<ReconciliationBacklog> {
        &self.backlog
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Replace the user's published membership with `result`, unless a
    /// materialization with a newer sequence already landed.
    pub async fn publish(
        &self,
        result: &MembershipResult,
        sequence: Sequence,
    ) -> Result<PublishOutcome, PublishError> {
        let user_id = &result.user_id;
        let update = match Self::encode(result, sequence) {
            Ok(update) => update,
            Err(e) => {
                self.backlog.flag(user_id);
                return Err(e);
            }
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.try_apply(&update).await {
                Ok(ApplyOutcome::Applied) => {
                    self.backlog.resolve(user_id);
                    metrics::counter!("materializer.published").increment(1);
                    debug!(
                        user_id = %user_id,
                        sequence = %sequence,
                        segments = update.segments.len(),
                        "Membership published"
                    );
                    return Ok(PublishOutcome::Applied);
                }
                Ok(ApplyOutcome::Stale { last_applied }) => {
                    self.backlog.resolve(user_id);
                    metrics::counter!("materializer.stale").increment(1);
                    debug!(
                        user_id = %user_id,
                        sequence = %sequence,
                        last_applied = %last_applied,
                        "Discarding stale membership result"
                    );
                    return Ok(PublishOutcome::Stale { last_applied });
                }
                Err(err) => err,
            };

            if !err.is_retryable() || attempt >= self.policy.max_attempts {
                self.backlog.flag(user_id);
                metrics::counter!("materializer.failed").increment(1);
                warn!(
                    user_id = %user_id,
                    attempts = attempt,
                    error = %err,
                    "Publish failed, user flagged for reconciliation"
                );
                return Err(PublishError::RetriesExhausted {
                    user_id: user_id.clone(),
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = self.policy.backoff(attempt);
            metrics::counter!("materializer.retries").increment(1);
            info!(
                user_id = %user_id,
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Publish failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn try_apply(&self, update: &MembershipUpdate) -> Result<ApplyOutcome, CacheStoreError> {
        let timeout = self.policy.attempt_timeout;
        tokio::time::timeout(timeout, self.store.apply(update))
            .await
            .unwrap_or(Err(CacheStoreError::Timeout(timeout.as_millis() as u64)))
    }

    fn encode(result: &MembershipResult, sequence: Sequence) -> Result<MembershipUpdate, PublishError> {
        let payload_json = if result.matched_segments.is_empty() {
            None
        } else {
            Some(
                serde_json::to_string(&result.merged_payload).map_err(|e| PublishError::Encode {
                    user_id: result.user_id.clone(),
                    reason: e.to_string(),
                })?,
            )
        };
        Ok(MembershipUpdate {
            user_id: result.user_id.clone(),
            sequence,
            segments: result.matched_segments.clone(),
            payload_json,
        })
    }
}
