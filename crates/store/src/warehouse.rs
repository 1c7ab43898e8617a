//! ClickHouse-backed metric and segment stores.
//!
//! `user_metric_deltas` is append-only: each order inserts one row carrying
//! its own increment, and a registration inserts a zero row. Reads sum the
//! counters per user and take the location of the newest row, so concurrent
//! writers on any node never overwrite each other.
//! `segments` holds definitions with rule and payload stored as JSON text.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::Utc;
use clickhouse::Row;
use daffodil_core::config::ClickHouseConfig;
use daffodil_core::{
    AttributeReadError, MetricStore, OrderEvent, SegmentRecord, SegmentStore, StoreError,
    StoreResult, UserMetrics,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Row, Serialize, Deserialize)]
struct MetricsRow {
    user_id: String,
    orders_23d: i64,
    total_spend: f64,
    location_tag: String,
    updated_at_us: i64,
}

const METRICS_TABLE: &str = "user_metric_deltas";

const FETCH_METRICS_SQL: &str = "SELECT
        user_id,
        sum(orders_23d) AS orders_23d,
        sum(total_spend) AS total_spend,
        argMax(location_tag, updated_at_us) AS location_tag,
        max(updated_at_us) AS updated_at_us
    FROM user_metric_deltas
    WHERE user_id = ?
    GROUP BY user_id";

impl MetricsRow {
    /// Increment contributed by one order.
    fn order_delta(event: &OrderEvent, updated_at_us: i64) -> Self {
        Self {
            user_id: event.user_id.clone(),
            orders_23d: 1,
            total_spend: event.amount,
            location_tag: event.location.clone(),
            updated_at_us,
        }
    }

    /// Zero row that makes a user visible to sweeps. Its timestamp of 0 never
    /// wins the location over a real order.
    fn registration(user_id: &str) -> Self {
        let empty = UserMetrics::empty(user_id);
        Self {
            user_id: empty.user_id,
            orders_23d: 0,
            total_spend: 0.0,
            location_tag: empty.location_tag,
            updated_at_us: 0,
        }
    }

    fn into_metrics(self) -> UserMetrics {
        UserMetrics {
            user_id: self.user_id,
            orders_23d: self.orders_23d,
            total_spend: self.total_spend,
            location_tag: self.location_tag,
        }
    }
}

#[derive(Debug, Clone, Row, Deserialize)]
struct UserIdRow {
    user_id: String,
}

#[derive(Debug, Clone, Row, Deserialize)]
struct SegmentRow {
    id: String,
    name: String,
    rule_logic: String,
    payload: String,
}

impl SegmentRow {
    /// Text that is not valid JSON is kept as a JSON string so the catalog
    /// rejects this one segment instead of the whole load failing.
    fn into_record(self) -> SegmentRecord {
        SegmentRecord {
            rule_logic: parse_json_column(&self.id, "rule_logic", self.rule_logic),
            payload: parse_json_column(&self.id, "payload", self.payload),
            id: self.id,
            name: self.name,
        }
    }
}

fn parse_json_column(segment_id: &str, column: &str, raw: String) -> Value {
    if raw.trim().is_empty() {
        return Value::Null;
    }
    match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(e) => {
            warn!(segment_id = %segment_id, column = column, error = %e, "Segment column is not valid JSON");
            Value::String(raw)
        }
    }
}

fn unavailable(err: clickhouse::error::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

/// Metric and segment store over one ClickHouse database.
#[derive(Clone)]
pub struct ClickHouseStore {
    client: clickhouse::Client,
}

impl ClickHouseStore {
    /// Connect and create the tables if they do not exist yet.
    pub async fn new(config: &ClickHouseConfig) -> anyhow::Result<Self> {
        let client = clickhouse::Client::default()
            .with_url(&config.url)
            .with_database(&config.database);

        let store = Self { client };
        store.ensure_schema().await?;

        info!(url = %config.url, database = %config.database, "ClickHouse store initialized");
        Ok(store)
    }

    async fn ensure_schema(&self) -> anyhow::Result<()> {
        self.client
            .query(
                "CREATE TABLE IF NOT EXISTS user_metric_deltas (
                    user_id String,
                    orders_23d Int64,
                    total_spend Float64,
                    location_tag String,
                    updated_at_us Int64
                ) ENGINE = MergeTree
                ORDER BY (user_id, updated_at_us)",
            )
            .execute()
            .await?;

        self.client
            .query(
                "CREATE TABLE IF NOT EXISTS segments (
                    id String,
                    name String,
                    rule_logic String,
                    payload String,
                    is_active UInt8 DEFAULT 1,
                    updated_at_us Int64
                ) ENGINE = ReplacingMergeTree(updated_at_us)
                ORDER BY id",
            )
            .execute()
            .await?;

        info!("ClickHouse schema verified");
        Ok(())
    }

    async fn current_row(&self, user_id: &str) -> StoreResult<Option<MetricsRow>> {
        let rows = self
            .client
            .query(FETCH_METRICS_SQL)
            .bind(user_id)
            .fetch_all::<MetricsRow>()
            .await
            .map_err(unavailable)?;
        Ok(rows.into_iter().next())
    }

    async fn write_row(&self, row: &MetricsRow) -> StoreResult<()> {
        let mut insert = self.client.insert(METRICS_TABLE).map_err(unavailable)?;
        insert.write(row).await.map_err(unavailable)?;
        insert.end().await.map_err(unavailable)
    }
}

#[async_trait]
impl MetricStore for ClickHouseStore {
    async fn fetch_metrics(&self, user_id: &str) -> Result<UserMetrics, AttributeReadError> {
        let row = self
            .current_row(user_id)
            .await?
            .ok_or_else(|| AttributeReadError::NotFound(user_id.to_string()))?;
        metrics::counter!("store.metrics_reads").increment(1);
        Ok(row.into_metrics())
    }

    async fn list_users(&self) -> StoreResult<Vec<String>> {
        let rows = self
            .client
            .query("SELECT DISTINCT user_id FROM user_metric_deltas")
            .fetch_all::<UserIdRow>()
            .await
            .map_err(unavailable)?;

        let users: BTreeSet<String> = rows.into_iter().map(|r| r.user_id).collect();
        debug!(count = users.len(), "Listed users");
        Ok(users.into_iter().collect())
    }

    async fn record_order(&self, event: &OrderEvent) -> StoreResult<()> {
        let row = MetricsRow::order_delta(event, Utc::now().timestamp_micros());
        self.write_row(&row).await?;

        metrics::counter!("store.orders_recorded").increment(1);
        debug!(
            user_id = %event.user_id,
            amount = event.amount,
            location = %event.location,
            "Order recorded"
        );
        Ok(())
    }

    async fn ensure_user(&self, user_id: &str) -> StoreResult<()> {
        if self.current_row(user_id).await?.is_some() {
            return Ok(());
        }
        self.write_row(&MetricsRow::registration(user_id)).await
    }
}

#[async_trait]
impl SegmentStore for ClickHouseStore {
    async fn active_segments(&self) -> StoreResult<Vec<SegmentRecord>> {
        let rows = self
            .client
            .query("SELECT ?fields FROM segments FINAL WHERE is_active = 1")
            .fetch_all::<SegmentRow>()
            .await
            .map_err(unavailable)?;

        debug!(count = rows.len(), "Loaded active segment rows");
        Ok(rows.into_iter().map(SegmentRow::into_record).collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_segment_row_parses_json_columns() {
        let row = SegmentRow {
            id: "1".into(),
            name: "Power User".into(),
            rule_logic: r#"{">": [{"var": "orders_23d"}, 5]}"#.into(),
            payload: r#"{"discount_pct": 15}"#.into(),
        };
        let record = row.into_record();
        assert_eq!(record.rule_logic, json!({">": [{"var": "orders_23d"}, 5]}));
        assert_eq!(record.payload, json!({"discount_pct": 15}));
    }

    #[test]
    fn test_invalid_json_is_kept_as_string() {
        let row = SegmentRow {
            id: "2".into(),
            name: "Broken".into(),
            rule_logic: "{not json".into(),
            payload: String::new(),
        };
        let record = row.into_record();
        assert_eq!(record.rule_logic, Value::String("{not json".into()));
        assert_eq!(record.payload, Value::Null);
    }

    fn order(amount: f64, location: &str) -> OrderEvent {
        OrderEvent {
            user_id: "u1".into(),
            amount,
            location: location.into(),
            instant_sync: false,
        }
    }

    /// Mirrors `FETCH_METRICS_SQL` over rows already read back.
    fn aggregate(rows: &[MetricsRow]) -> UserMetrics {
        let newest = rows.iter().max_by_key(|r| r.updated_at_us).unwrap();
        MetricsRow {
            user_id: newest.user_id.clone(),
            orders_23d: rows.iter().map(|r| r.orders_23d).sum(),
            total_spend: rows.iter().map(|r| r.total_spend).sum(),
            location_tag: newest.location_tag.clone(),
            updated_at_us: newest.updated_at_us,
        }
        .into_metrics()
    }

    #[test]
    fn test_order_rows_carry_only_their_increment() {
        let row = MetricsRow::order_delta(&order(120.0, "NYC"), 42);
        assert_eq!(row.orders_23d, 1);
        assert_eq!(row.total_spend, 120.0);
        assert_eq!(row.location_tag, "NYC");
        assert_eq!(row.updated_at_us, 42);
    }

    #[test]
    fn test_concurrent_orders_are_all_counted() {
        // Two writers that each saw five orders still add two rows, not two
        // overwrites.
        let mut rows: Vec<MetricsRow> = (0..5)
            .map(|i| MetricsRow::order_delta(&order(10.0, "SF"), 100 + i))
            .collect();
        rows.push(MetricsRow::order_delta(&order(30.0, "NYC"), 200));
        rows.push(MetricsRow::order_delta(&order(20.0, "LA"), 199));
        rows.push(MetricsRow::registration("u1"));

        let mut sequential = UserMetrics::empty("u1");
        for _ in 0..5 {
            sequential.apply_order(&order(10.0, "SF"));
        }
        sequential.apply_order(&order(20.0, "LA"));
        sequential.apply_order(&order(30.0, "NYC"));

        rows.reverse();
        assert_eq!(aggregate(&rows), sequential);
    }

    #[test]
    fn test_registration_row_is_neutral() {
        let row = MetricsRow::registration("u2");
        assert_eq!(row.orders_23d, 0);
        assert_eq!(row.total_spend, 0.0);
        assert_eq!(row.updated_at_us, 0);
        assert_eq!(aggregate(&[row]), UserMetrics::empty("u2"));
    }

    #[test]
    fn test_fetch_query_aggregates_per_user() {
        assert!(FETCH_METRICS_SQL.contains("sum(orders_23d) AS orders_23d"));
        assert!(FETCH_METRICS_SQL.contains("sum(total_spend) AS total_spend"));
        assert!(FETCH_METRICS_SQL.contains("argMax(location_tag, updated_at_us)"));
        assert!(FETCH_METRICS_SQL.contains("GROUP BY user_id"));
        assert!(!FETCH_METRICS_SQL.contains("FINAL"));
    }
}
