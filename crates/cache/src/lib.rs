#![warn(clippy::unwrap_used)]

pub mod client;
pub mod local;
pub mod materializer;
pub mod reconcile;
pub mod store;

pub use client::RedisCacheStore;
pub use local::LocalCacheStore;
pub use materializer::{CacheMaterializer, PublishError, PublishOutcome, RetryPolicy};
pub use reconcile::ReconciliationBacklog;
pub use store::{
    ApplyOutcome, CacheStore, CacheStoreError, MembershipUpdate, PublishedMembership,
};
