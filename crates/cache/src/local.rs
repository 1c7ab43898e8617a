//! In-process cache store backed by DashMap.
//!
//! Each user's keys live in a single map entry, so the entry lock gives the
//! same all-or-nothing replacement the Redis script gives. Used by tests and
//! by single-node deployments without Redis.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use daffodil_core::Sequence;
use dashmap::DashMap;

use crate::store::{
    decode_payload, ApplyOutcome, CacheStore, CacheStoreError, MembershipUpdate,
    PublishedMembership,
};

#[derive(Debug, Clone, Default)]
struct CacheEntry {
    segments: BTreeSet<String>,
    payload_json: Option<String>,
    sequence: Option<Sequence>,
}

#[derive(Default)]
pub struct LocalCacheStore {
    store: DashMap<String, CacheEntry>,
    failures_remaining: AtomicU32,
    latency: Mutex<Option<Duration>>,
}

impl LocalCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` applies fail with `Unavailable`.
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Delay every apply by `latency` before touching the map.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = latency;
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    fn take_failure(&self) -> bool {
        self.failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl CacheStore for LocalCacheStore {
    async fn apply(&self, update: &MembershipUpdate) -> Result<ApplyOutcome, CacheStoreError> {
        let latency = *self.latency.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.take_failure() {
            return Err(CacheStoreError::Unavailable("injected failure".into()));
        }

        let mut entry = self.store.entry(update.user_id.clone()).or_default();
        if let Some(last) = entry.sequence {
            if last > update.sequence {
                return Ok(ApplyOutcome::Stale { last_applied: last });
            }
        }
        *entry = CacheEntry {
            segments: update.segments.clone(),
            payload_json: if update.segments.is_empty() {
                None
            } else {
                update.payload_json.clone()
            },
            sequence: Some(update.sequence),
        };
        Ok(ApplyOutcome::Applied)
    }

    async fn read_membership(&self, user_id: &str) -> Result<PublishedMembership, CacheStoreError> {
        let Some(entry) = self.store.get(user_id).map(|e| e.clone()) else {
            return Ok(PublishedMembership::default());
        };
        Ok(PublishedMembership {
            segments: entry.segments,
            payload: decode_payload(entry.payload_json)?,
        })
    }

    async fn last_applied(&self, user_id: &str) -> Result<Option<Sequence>, CacheStoreError> {
        Ok(self.store.get(user_id).and_then(|e| e.sequence))
    }
}
