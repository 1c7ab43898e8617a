//! Redis-backed cache store for published segment memberships.
//!
//! Every materialization is a single Lua script, so the sequence check, the
//! clear of the old keys and the write of the new ones execute as one
//! indivisible step on the server.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use daffodil_core::config::RedisConfig;
use daffodil_core::Sequence;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::{debug, info};

use crate::store::{
    decode_payload, payload_key, segments_key, sequence_key, ApplyOutcome, CacheStore,
    CacheStoreError, MembershipUpdate, PublishedMembership,
};

/// KEYS: segments, payload, sequence. ARGV: sequence, payload, names...
/// Returns `-1` when applied, otherwise the newer stored sequence.
/// Sequences stay below 2^53, so Lua numbers hold them exactly.
/// Names are added in batches; `unpack` overflows the Lua stack past a few
/// thousand values.
const APPLY_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[3])
if current and tonumber(current) > tonumber(ARGV[1]) then
    return tonumber(current)
end
redis.call('DEL', KEYS[1], KEYS[2])
if #ARGV > 2 then
    for i = 3, #ARGV, 1000 do
        redis.call('SADD', KEYS[1], unpack(ARGV, i, math.min(i + 999, #ARGV)))
    end
    redis.call('SET', KEYS[2], ARGV[2])
end
redis.call('SET', KEYS[3], ARGV[1])
return -1
"#;

pub struct RedisCacheStore {
    conn: ConnectionManager,
    apply_script: Script,
}

impl RedisCacheStore {
    /// Connect to the first configured Redis node and verify it answers.
    pub async fn new(config: &RedisConfig) -> anyhow::Result<Self> {
        let url = config
            .urls
            .first()
            .cloned()
            .unwrap_or_else(|| "redis://localhost:6379".to_string());

        info!(url = %url, "Connecting to Redis");

        let client = redis::Client::open(url.as_str())?;
        let mut conn = tokio::time::timeout(
            Duration::from_millis(config.connect_timeout_ms),
            ConnectionManager::new(client),
        )
        .await
        .map_err(|_| anyhow::anyhow!("timed out connecting to Redis at {url}"))??;

        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!(response = %pong, "Redis connection established");

        Ok(Self {
            conn,
            apply_script: Script::new(APPLY_SCRIPT),
        })
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn apply(&self, update: &MembershipUpdate) -> Result<ApplyOutcome, CacheStoreError> {
        let mut conn = self.conn.clone();
        let user_id = &update.user_id;

        let mut invocation = self.apply_script.key(segments_key(user_id));
        invocation
            .key(payload_key(user_id))
            .key(sequence_key(user_id))
            .arg(update.sequence.0)
            .arg(update.payload_json.as_deref().unwrap_or(""));
        for name in &update.segments {
            invocation.arg(name);
        }

        let newer: i64 = invocation.invoke_async(&mut conn).await?;
        if newer < 0 {
            debug!(user_id = %user_id, sequence = %update.sequence, "Membership applied");
            Ok(ApplyOutcome::Applied)
        } else {
            Ok(ApplyOutcome::Stale {
                last_applied: Sequence(newer as u64),
            })
        }
    }

    async fn read_membership(&self, user_id: &str) -> Result<PublishedMembership, CacheStoreError> {
        let mut conn = self.conn.clone();
        let (segments, payload): (BTreeSet<String>, Option<String>) = redis::pipe()
            .atomic()
            .smembers(segments_key(user_id))
            .get(payload_key(user_id))
            .query_async(&mut conn)
            .await?;

        Ok(PublishedMembership {
            segments,
            payload: decode_payload(payload)?,
        })
    }

    async fn last_applied(&self, user_id: &str) -> Result<Option<Sequence>, CacheStoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<u64> = conn.get(sequence_key(user_id)).await?;
        Ok(raw.map(Sequence))
    }
}
