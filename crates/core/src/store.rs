//! Store traits consumed by the evaluation engine.
//!
//! - `MetricStore`: per-user aggregated metrics (attribute source)
//! - `SegmentStore`: active segment definitions (catalog source)
//!
//! Both are async and backend-agnostic. In-memory fakes live in
//! [`crate::fakes`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{AttributeReadError, StoreResult};
use crate::types::{OrderEvent, UserMetrics};

/// Segment definition as stored, before its rule is parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub id: String,
    pub name: String,
    pub rule_logic: serde_json::Value,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait MetricStore: Send + Sync {
    /// Current metrics row for one user.
    async fn fetch_metrics(&self, user_id: &str) -> Result<UserMetrics, AttributeReadError>;

    /// Every user id with a metrics row.
    async fn list_users(&self) -> StoreResult<Vec<String>>;

    /// Fold an order into the user's row, creating it if absent.
    async fn record_order(&self, event: &OrderEvent) -> StoreResult<()>;

    /// Create an empty row for the user. No-op if one exists.
    async fn ensure_user(&self, user_id: &str) -> StoreResult<()>;
}

#[async_trait]
pub trait SegmentStore: Send + Sync {
    /// All currently active segment records, in no particular order.
    async fn active_segments(&self) -> StoreResult<Vec<SegmentRecord>>;
}
