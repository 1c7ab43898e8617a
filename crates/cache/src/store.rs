//! Cache store contract and key layout.
//!
//! A user's published state lives under three keys that always change
//! together:
//! - `user:segments:{id}`: set of matched segment names
//! - `user:payload:{id}`: merged payload as a JSON string
//! - `user:seq:{id}`: sequence of the last applied materialization

use std::collections::BTreeSet;

use async_trait::async_trait;
use daffodil_core::Sequence;
use serde_json::{Map, Value};
use thiserror::Error;

pub fn segments_key(user_id: &str) -> String {
    format!("user:segments:{user_id}")
}

pub fn payload_key(user_id: &str) -> String {
    format!("user:payload:{user_id}")
}

pub fn sequence_key(user_id: &str) -> String {
    format!("user:seq:{user_id}")
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheStoreError {
    #[error("cache store unavailable: {0}")]
    Unavailable(String),

    #[error("cache operation timed out after {0} ms")]
    Timeout(u64),

    #[error("cache returned malformed data: {0}")]
    Corrupt(String),
}

impl CacheStoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CacheStoreError::Unavailable(_) | CacheStoreError::Timeout(_)
        )
    }
}

impl From<redis::RedisError> for CacheStoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            CacheStoreError::Timeout(0)
        } else {
            CacheStoreError::Unavailable(err.to_string())
        }
    }
}

/// Full replacement of one user's published state.
#[derive(Debug, Clone, PartialEq)]
pub struct MembershipUpdate {
    pub user_id: String,
    pub sequence: Sequence,
    pub segments: BTreeSet<String>,
    /// Serialized merged payload. `None` when no segment matched.
    pub payload_json: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The store already holds a newer materialization.
    Stale { last_applied: Sequence },
}

/// What readers currently see for a user.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishedMembership {
    pub segments: BTreeSet<String>,
    pub payload: Option<Map<String, Value>>,
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Atomically compare the stored sequence with `update.sequence` and, if
    /// the update is not older, clear both membership keys, write the new
    /// values and record the sequence. Readers never observe a cleared but
    /// not yet rewritten state.
    async fn apply(&self, update: &MembershipUpdate) -> Result<ApplyOutcome, CacheStoreError>;

    async fn read_membership(&self, user_id: &str) -> Result<PublishedMembership, CacheStoreError>;

    async fn last_applied(&self, user_id: &str) -> Result<Option<Sequence>, CacheStoreError>;
}

pub(crate) fn decode_payload(raw: Option<String>) -> Result<Option<Map<String, Value>>, CacheStoreError> {
    raw.map(|json| {
        serde_json::from_str::<Map<String, Value>>(&json)
            .map_err(|e| CacheStoreError::Corrupt(e.to_string()))
    })
    .transpose()
}
