//! In-memory fakes for the store traits.
//!
//! Used by tests throughout the workspace. Both fakes can be switched into
//! an outage mode or given a fixed latency so error and timeout paths are
//! testable.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{AttributeReadError, StoreError, StoreResult};
use crate::store::{MetricStore, SegmentRecord, SegmentStore};
use crate::types::{OrderEvent, UserMetrics};

// ---------------------------------------------------------------------------
// MemoryMetricStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryMetricStore {
    rows: Mutex<BTreeMap<String, UserMetrics>>,
    unavailable: AtomicBool,
    latency: Mutex<Option<Duration>>,
}

impl MemoryMetricStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: impl IntoIterator<Item = UserMetrics>) -> Self {
        let store = Self::new();
        for row in rows {
            store.upsert(row);
        }
        store
    }

    pub fn upsert(&self, row: UserMetrics) {
        self.lock().insert(row.user_id.clone(), row);
    }

    pub fn remove(&self, user_id: &str) {
        self.lock().remove(user_id);
    }

    pub fn get(&self, user_id: &str) -> Option<UserMetrics> {
        self.lock().get(user_id).cloned()
    }

    /// Make every subsequent call fail with `StoreError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every call by `latency` before touching the rows.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = latency;
    }

    async fn check(&self) -> StoreResult<()> {
        delay(&self.latency).await;
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("metric store offline".into()));
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, UserMetrics>> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl MetricStore for MemoryMetricStore {
    async fn fetch_metrics(&self, user_id: &str) -> Result<UserMetrics, AttributeReadError> {
        self.check().await?;
        self.get(user_id)
            .ok_or_else(|| AttributeReadError::NotFound(user_id.to_string()))
    }

    async fn list_users(&self) -> StoreResult<Vec<String>> {
        self.check().await?;
        Ok(self.lock().keys().cloned().collect())
    }

    async fn record_order(&self, event: &OrderEvent) -> StoreResult<()> {
        self.check().await?;
        self.lock()
            .entry(event.user_id.clone())
            .or_insert_with(|| UserMetrics::empty(&event.user_id))
            .apply_order(event);
        Ok(())
    }

    async fn ensure_user(&self, user_id: &str) -> StoreResult<()> {
        self.check().await?;
        self.lock()
            .entry(user_id.to_string())
            .or_insert_with(|| UserMetrics::empty(user_id));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemorySegmentStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemorySegmentStore {
    records: Mutex<Vec<SegmentRecord>>,
    unavailable: AtomicBool,
    latency: Mutex<Option<Duration>>,
}

impl MemorySegmentStore {
    pub fn new(records: Vec<SegmentRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            ..Self::default()
        }
    }

    /// Replace the full set of active records.
    pub fn replace(&self, records: Vec<SegmentRecord>) {
        *self.records.lock().unwrap_or_else(|e| e.into_inner()) = records;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = latency;
    }
}

#[async_trait]
impl SegmentStore for MemorySegmentStore {
    async fn active_segments(&self) -> StoreResult<Vec<SegmentRecord>> {
        delay(&self.latency).await;
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("segment store offline".into()));
        }
        Ok(self
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }
}

async fn delay(latency: &Mutex<Option<Duration>>) {
    let latency = *latency.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(latency) = latency {
        tokio::time::sleep(latency).await;
    }
}
