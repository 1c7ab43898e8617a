//! Segment catalog: point-in-time snapshots of the active segment set.
//!
//! Every evaluation pass works against exactly one [`CatalogSnapshot`], so a
//! single run never mixes rule versions. Records that fail to parse are
//! dropped from the snapshot and logged; they never fail the load.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use daffodil_core::{SegmentRecord, SegmentStore, StoreError};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::parser::{parse_rule, RuleParseError};
use crate::predicates::RuleNode;

/// Stable segment identifier.
///
/// Ordered numerically when both ids are integers; integer ids sort before
/// non-integer ids, which order lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SegmentId(String);

impl SegmentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn numeric(&self) -> Option<u64> {
        self.0.parse().ok()
    }
}

impl Ord for SegmentId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.numeric(), other.numeric()) {
            (Some(a), Some(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for SegmentId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SegmentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A parsed, evaluable segment definition.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub id: SegmentId,
    pub name: String,
    pub rule: RuleNode,
    pub payload: Map<String, Value>,
}

impl Segment {
    /// Parse a stored record. The payload must be a JSON object; `null` is
    /// read as an empty payload.
    pub fn from_record(record: &SegmentRecord) -> Result<Self, SegmentRejection> {
        let rule = parse_rule(&record.rule_logic)?;
        let payload = match &record.payload {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => return Err(SegmentRejection::PayloadNotObject(type_name(other))),
        };
        Ok(Self {
            id: SegmentId::new(record.id.clone()),
            name: record.name.clone(),
            rule,
            payload,
        })
    }

    /// Serialize back into the stored shape.
    pub fn to_record(&self) -> SegmentRecord {
        SegmentRecord {
            id: self.id.to_string(),
            name: self.name.clone(),
            rule_logic: self.rule.to_json_logic(),
            payload: Value::Object(self.payload.clone()),
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Why a stored record was left out of a snapshot.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SegmentRejection {
    #[error("invalid rule_logic: {0}")]
    Rule(#[from] RuleParseError),

    #[error("payload must be a JSON object, found {0}")]
    PayloadNotObject(&'static str),

    #[error("name `{name}` already used by segment {kept}")]
    DuplicateName { name: String, kept: SegmentId },

    #[error("id already used by another record")]
    DuplicateId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RejectedSegment {
    pub id: String,
    pub name: String,
    pub reason: SegmentRejection,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CatalogError {
    #[error("failed to read segment definitions: {0}")]
    Store(#[from] StoreError),
}

/// Immutable view of the catalog used for one evaluation pass.
#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    version: u64,
    segments: Arc<[Segment]>,
    rejected: Arc<[RejectedSegment]>,
}

impl CatalogSnapshot {
    /// Build a snapshot from already-parsed segments. Input order does not
    /// matter; the snapshot is sorted by ascending id.
    pub fn from_segments(version: u64, segments: Vec<Segment>) -> Self {
        Self::assemble(version, segments.into_iter().map(Ok).collect())
    }

    /// Parse stored records into a snapshot, rejecting the ones that fail.
    pub fn from_records(version: u64, records: &[SegmentRecord]) -> Self {
        let parsed = records
            .iter()
            .map(|record| {
                Segment::from_record(record).map_err(|reason| RejectedSegment {
                    id: record.id.clone(),
                    name: record.name.clone(),
                    reason,
                })
            })
            .collect();
        Self::assemble(version, parsed)
    }

    fn assemble(version: u64, parsed: Vec<Result<Segment, RejectedSegment>>) -> Self {
        let mut rejected = Vec::new();
        let mut segments = Vec::with_capacity(parsed.len());
        for item in parsed {
            match item {
                Ok(segment) => segments.push(segment),
                Err(rejection) => rejected.push(rejection),
            }
        }
        segments.sort_by(|a, b| a.id.cmp(&b.id));

        // Lowest id keeps an id or name that appears more than once.
        let mut seen_names: HashMap<String, SegmentId> = HashMap::new();
        let mut seen_ids = HashSet::new();
        segments.retain(|segment| {
            if !seen_ids.insert(segment.id.clone()) {
                rejected.push(RejectedSegment {
                    id: segment.id.to_string(),
                    name: segment.name.clone(),
                    reason: SegmentRejection::DuplicateId,
                });
                return false;
            }
            if let Some(kept) = seen_names.get(&segment.name) {
                rejected.push(RejectedSegment {
                    id: segment.id.to_string(),
                    name: segment.name.clone(),
                    reason: SegmentRejection::DuplicateName {
                        name: segment.name.clone(),
                        kept: kept.clone(),
                    },
                });
                return false;
            }
            seen_names.insert(segment.name.clone(), segment.id.clone());
            true
        });

        Self {
            version,
            segments: segments.into(),
            rejected: rejected.into(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Segments in ascending id order.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn rejected(&self) -> &[RejectedSegment] {
        &self.rejected
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// Loads snapshots from a [`SegmentStore`].
pub struct SegmentCatalog {
    store: Arc<dyn SegmentStore>,
    version: AtomicU64,
}

impl SegmentCatalog {
    pub fn new(store: Arc<dyn SegmentStore>) -> Self {
        Self {
            store,
            version: AtomicU64::new(0),
        }
    }

    /// Read every active record and parse it into a fresh snapshot.
    pub async fn load_snapshot(&self) -> Result<CatalogSnapshot, CatalogError> {
        let records = self.store.active_segments().await?;
        let version = self.version.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        let snapshot = CatalogSnapshot::from_records(version, &records);

        for rejected in snapshot.rejected() {
            warn!(
                segment_id = %rejected.id,
                segment_name = %rejected.name,
                reason = %rejected.reason,
                "Segment excluded from catalog snapshot"
            );
            metrics::counter!("catalog.rejected_segments").increment(1);
        }
        debug!(
            version = version,
            segments = snapshot.len(),
            rejected = snapshot.rejected().len(),
            "Catalog snapshot loaded"
        );
        metrics::gauge!("catalog.active_segments").set(snapshot.len() as f64);

        Ok(snapshot)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use daffodil_core::fakes::MemorySegmentStore;
    use serde_json::json;

    fn record(id: &str, name: &str, rule: Value, payload: Value) -> SegmentRecord {
        SegmentRecord {
            id: id.into(),
            name: name.into(),
            rule_logic: rule,
            payload,
        }
    }

    #[test]
    fn test_segment_id_ordering() {
        let mut ids: Vec<SegmentId> = ["10", "2", "beta", "1", "alpha", "02"]
            .into_iter()
            .map(SegmentId::from)
            .collect();
        ids.sort();
        let ordered: Vec<&str> = ids.iter().map(SegmentId::as_str).collect();
        assert_eq!(ordered, vec!["1", "02", "2", "10", "alpha", "beta"]);
    }

    #[test]
    fn test_snapshot_sorted_by_id() {
        let snapshot = CatalogSnapshot::from_records(
            1,
            &[
                record("3", "C", json!(true), json!({})),
                record("1", "A", json!(true), json!({})),
                record("2", "B", json!(true), Value::Null),
            ],
        );
        let names: Vec<&str> = snapshot.segments().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B", "C"]);
        assert!(snapshot.rejected().is_empty());
    }

    #[test]
    fn test_unparsable_rule_is_excluded() {
        let snapshot = CatalogSnapshot::from_records(
            1,
            &[
                record("1", "Good", json!({">": [{"var": "orders_23d"}, 1]}), json!({})),
                record("2", "Bad", json!({"unknown_op": [1, 2]}), json!({})),
                record("3", "BadPayload", json!(true), json!([1, 2])),
            ],
        );
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.segments()[0].name, "Good");
        assert_eq!(snapshot.rejected().len(), 2);
        assert!(matches!(
            snapshot.rejected()[1].reason,
            SegmentRejection::PayloadNotObject("array")
        ));
    }

    #[test]
    fn test_duplicate_names_keep_lowest_id() {
        let snapshot = CatalogSnapshot::from_records(
            1,
            &[
                record("7", "Power User", json!(true), json!({})),
                record("4", "Power User", json!(false), json!({})),
            ],
        );
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.segments()[0].id.as_str(), "4");
        assert_eq!(
            snapshot.rejected()[0].reason,
            SegmentRejection::DuplicateName {
                name: "Power User".into(),
                kept: SegmentId::new("4"),
            }
        );
    }

    #[test]
    fn test_record_round_trip() {
        let source = record(
            "5",
            "Big Spender",
            json!({">=": [{"var": "total_spend"}, 500]}),
            json!({"banner": "gold"}),
        );
        let segment = Segment::from_record(&source).unwrap();
        assert_eq!(segment.to_record(), source);
    }

    #[tokio::test]
    async fn test_load_snapshot_bumps_version() {
        let store = Arc::new(MemorySegmentStore::new(vec![record(
            "1",
            "A",
            json!(true),
            json!({}),
        )]));
        let catalog = SegmentCatalog::new(store.clone());

        let first = catalog.load_snapshot().await.unwrap();
        store.replace(vec![]);
        let second = catalog.load_snapshot().await.unwrap();

        assert!(second.version() > first.version());
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_load_snapshot_surfaces_store_failure() {
        let store = Arc::new(MemorySegmentStore::new(vec![]));
        store.set_unavailable(true);
        let catalog = SegmentCatalog::new(store);
        assert!(matches!(
            catalog.load_snapshot().await,
            Err(CatalogError::Store(StoreError::Unavailable(_)))
        ));
    }
}
