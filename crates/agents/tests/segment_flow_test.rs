//! End-to-end flow: order events and sweeps against in-memory stores, with
//! segment definitions in their stored JSON-Logic form.

use std::sync::Arc;
use std::time::Duration;

use daffodil_agents::{Coordinator, RecomputeOutcome, SequenceSource};
use daffodil_cache::{CacheMaterializer, CacheStore, LocalCacheStore, ReconciliationBacklog, RetryPolicy};
use daffodil_core::config::EvaluationConfig;
use daffodil_core::fakes::{MemoryMetricStore, MemorySegmentStore};
use daffodil_core::{OrderEvent, SegmentRecord, UserMetrics};
use daffodil_segmentation::SegmentCatalog;
use serde_json::{json, Value};
use tokio::sync::watch;

fn record(id: &str, name: &str, rule_logic: Value, payload: Value) -> SegmentRecord {
    SegmentRecord {
        id: id.into(),
        name: name.into(),
        rule_logic,
        payload,
    }
}

fn catalog_records() -> Vec<SegmentRecord> {
    vec![
        record(
            "2",
            "NYC Power User",
            json!({"and": [
                {">": [{"var": "orders_23d"}, 5]},
                {"==": [{"var": "location_tag"}, "NYC"]}
            ]}),
            json!({"discount_pct": 15, "banner": "nyc"}),
        ),
        record(
            "1",
            "Frequent Buyer",
            json!({">": [{"var": "orders_23d"}, 5]}),
            json!({"discount_pct": 10, "free_shipping": true}),
        ),
        record("3", "Broken", json!({"between": [1, 2, 3]}), json!({})),
        record(
            "10",
            "Big Spender",
            json!({">=": [{"var": "total_spend"}, 1000]}),
            json!({"vip": true}),
        ),
    ]
}

struct Flow {
    coordinator: Arc<Coordinator>,
    metrics: Arc<MemoryMetricStore>,
    cache: Arc<LocalCacheStore>,
}

fn flow(rows: Vec<UserMetrics>) -> Flow {
    let metrics = Arc::new(MemoryMetricStore::with_rows(rows));
    let cache = Arc::new(LocalCacheStore::new());
    let materializer = Arc::new(CacheMaterializer::new(
        cache.clone(),
        Arc::new(ReconciliationBacklog::new()),
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            attempt_timeout: Duration::from_millis(500),
        },
    ));
    let coordinator = Arc::new(Coordinator::new(
        metrics.clone(),
        Arc::new(SegmentCatalog::new(Arc::new(MemorySegmentStore::new(
            catalog_records(),
        )))),
        materializer,
        Arc::new(SequenceSource::new()),
        EvaluationConfig {
            max_concurrency: 4,
            ..EvaluationConfig::default()
        },
    ));
    Flow {
        coordinator,
        metrics,
        cache,
    }
}

fn order(user_id: &str, amount: f64, location: &str, instant_sync: bool) -> OrderEvent {
    OrderEvent {
        user_id: user_id.into(),
        amount,
        location: location.into(),
        instant_sync,
    }
}

#[tokio::test]
async fn test_orders_promote_user_into_segments() {
    let flow = flow(vec![]);

    for _ in 0..5 {
        let outcome = flow
            .coordinator
            .handle_event(&order("u1", 100.0, "NYC", false), flow.coordinator.next_sequence())
            .await
            .unwrap();
        assert_eq!(outcome, None);
    }
    assert!(flow.cache.is_empty());

    let outcome = flow
        .coordinator
        .handle_event(&order("u1", 100.0, "NYC", true), flow.coordinator.next_sequence())
        .await
        .unwrap();
    assert_eq!(outcome, Some(RecomputeOutcome::Published { segments: 2 }));

    let published = flow.cache.read_membership("u1").await.unwrap();
    assert!(published.segments.contains("Frequent Buyer"));
    assert!(published.segments.contains("NYC Power User"));
    assert!(!published.segments.contains("Broken"));

    let payload = published.payload.unwrap();
    assert_eq!(payload.get("discount_pct"), Some(&json!(15)));
    assert_eq!(payload.get("free_shipping"), Some(&json!(true)));
    assert_eq!(payload.get("banner"), Some(&json!("nyc")));
}

#[tokio::test]
async fn test_sweep_reflects_metric_changes() {
    let flow = flow(vec![
        UserMetrics {
            user_id: "u1".into(),
            orders_23d: 8,
            total_spend: 1500.0,
            location_tag: "SF".into(),
        },
        UserMetrics {
            user_id: "u2".into(),
            orders_23d: 2,
            total_spend: 80.0,
            location_tag: "NYC".into(),
        },
    ]);

    let (_tx, rx) = watch::channel(false);
    let first = flow.coordinator.run_sweep(rx.clone()).await.unwrap();
    assert_eq!(first.published, 2);

    let u1 = flow.cache.read_membership("u1").await.unwrap();
    assert_eq!(u1.segments.len(), 2);
    let payload = u1.payload.unwrap();
    assert_eq!(payload.get("discount_pct"), Some(&json!(10)));
    assert_eq!(payload.get("vip"), Some(&json!(true)));
    assert!(flow.cache.read_membership("u2").await.unwrap().segments.is_empty());

    // u1's window rolls over; they should drop out on the next sweep.
    flow.metrics.upsert(UserMetrics {
        user_id: "u1".into(),
        orders_23d: 0,
        total_spend: 0.0,
        location_tag: "SF".into(),
    });
    let second = flow.coordinator.run_sweep(rx).await.unwrap();
    assert!(second.sequence > first.sequence);

    let u1 = flow.cache.read_membership("u1").await.unwrap();
    assert!(u1.segments.is_empty());
    assert!(u1.payload.is_none());
}

#[tokio::test]
async fn test_instant_sync_after_sweep_sequence_wins() {
    let flow = flow(vec![UserMetrics {
        user_id: "u1".into(),
        orders_23d: 5,
        total_spend: 500.0,
        location_tag: "SF".into(),
    }]);

    let (_tx, rx) = watch::channel(false);
    let report = flow.coordinator.run_sweep(rx).await.unwrap();
    assert!(flow.cache.read_membership("u1").await.unwrap().segments.is_empty());

    let sequence = flow.coordinator.next_sequence();
    assert!(sequence.0 > report.sequence);
    flow.coordinator
        .handle_event(&order("u1", 10.0, "NYC", true), sequence)
        .await
        .unwrap();

    assert_eq!(flow.cache.last_applied("u1").await.unwrap(), Some(sequence));
    let published = flow.cache.read_membership("u1").await.unwrap();
    assert!(published.segments.contains("NYC Power User"));
}
